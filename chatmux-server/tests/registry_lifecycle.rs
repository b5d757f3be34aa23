//! Registry-level lifecycle tests: idempotency, concurrency, teardown and
//! failure isolation across sessions.

mod support;

use chatmux_core::transport::{ConnectPlan, TransportError, TransportEvent};
use chatmux_core::{SessionError, SessionRecord, SessionStatus, SessionStore};
use chatmux_server::subsystems::orchestrator::start_all_sessions;
use std::sync::Arc;
use std::time::Duration;
use support::{fast_config, wait_until, Harness};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn start_is_idempotent_for_a_live_session() {
    let h = Harness::with_records([SessionRecord::new(1, 1, "main")], fast_config());
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    h.registry.start(1).await.unwrap();
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;

    // A second start returns the live client untouched.
    let snapshot = h.registry.start(1).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Connected);
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.registry.running_count().await, 1);
}

#[tokio::test]
async fn concurrent_starts_build_exactly_one_client() {
    let h = Harness::with_records([SessionRecord::new(1, 1, "main")], fast_config());
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    let registry_a = Arc::clone(&h.registry);
    let registry_b = Arc::clone(&h.registry);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { registry_a.start(1).await }),
        tokio::spawn(async move { registry_b.start(1).await }),
    );

    let results = [a.unwrap(), b.unwrap()];
    assert!(results.iter().any(|r| r.is_ok()));
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, SessionError::AlreadyStarting(1)), "{err}");
        }
    }

    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;
    assert_eq!(h.registry.running_count().await, 1);
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.transport.max_active_for(1), 1);

    // Once the winner finished, a retried start is a plain idempotent hit.
    h.registry.start(1).await.unwrap();
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test]
async fn starting_an_unknown_session_is_not_found() {
    let h = Harness::with_records([], fast_config());
    assert!(matches!(
        h.registry.start(42).await,
        Err(SessionError::NotFound(42))
    ));
}

#[tokio::test]
async fn stopping_an_absent_session_is_a_noop() {
    let h = Harness::with_records([], fast_config());
    h.registry.stop(99).await;
    assert_eq!(h.registry.running_count().await, 0);
}

#[tokio::test]
async fn stop_interrupts_a_backoff_wait() {
    // Hour-scale backoff; no scripted plan, so every connect fails.
    let config = chatmux_core::config::WhatsappConfig {
        max_retries: 10,
        backoff_base_ms: 3_600_000,
        backoff_max_ms: 3_600_000,
        ..fast_config()
    };
    let h = Harness::with_records([SessionRecord::new(1, 1, "main")], config);

    h.registry.start(1).await.unwrap();
    h.wait_for_record(1, WAIT, |r| r.retries >= 1).await;

    // Must return long before the backoff delay elapses.
    tokio::time::timeout(Duration::from_secs(2), h.registry.stop(1))
        .await
        .expect("stop did not interrupt the backoff wait");

    assert_eq!(h.registry.running_count().await, 0);
    let record = h.store.load(1).await.unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Disconnected);
}

#[tokio::test]
async fn restart_tears_down_the_old_client_first() {
    let h = Harness::with_records([SessionRecord::new(1, 1, "main")], fast_config());
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    h.registry.start(1).await.unwrap();
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;

    h.registry.restart(1).await.unwrap();
    let transport = Arc::clone(&h.transport);
    wait_until(WAIT, || transport.connect_count() == 2).await;
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;

    // The old connection was fully released before the new one opened.
    assert_eq!(h.transport.max_active_for(1), 1);
    assert_eq!(h.registry.running_count().await, 1);
}

#[tokio::test]
async fn delete_stops_the_client_and_removes_the_record() {
    let h = Harness::with_records([SessionRecord::new(1, 3, "main")], fast_config());
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    h.registry.start(1).await.unwrap();
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;

    h.registry.delete(1).await.unwrap();
    assert_eq!(h.registry.running_count().await, 0);
    assert!(h.store.load(1).await.unwrap().is_none());
}

#[tokio::test]
async fn one_failing_session_does_not_disturb_the_others() {
    let h = Harness::with_records(
        [SessionRecord::new(1, 1, "healthy"), SessionRecord::new(2, 1, "banned")],
        fast_config(),
    );
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));
    h.transport.plan(
        2,
        ConnectPlan::Fail(TransportError::Fatal("account banned".to_string())),
    );

    h.registry.start(1).await.unwrap();
    h.registry.start(2).await.unwrap();

    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;
    // Both clients have attempted their connect before we judge session 2.
    let transport = Arc::clone(&h.transport);
    wait_until(WAIT, || transport.connect_count() == 2).await;
    h.wait_for_status(2, SessionStatus::Disconnected, WAIT).await;

    // The failed client settles but stays registered; the healthy one is
    // untouched.
    assert_eq!(h.registry.running_count().await, 2);
    let healthy = h.registry.get(1).await.unwrap();
    assert_eq!(healthy.status, SessionStatus::Connected);
    assert_eq!(h.transport.connect_count(), 2);
}

#[tokio::test]
async fn startup_brings_every_persisted_session_up() {
    let h = Harness::with_records(
        (1..=5).map(|id| SessionRecord::new(id, 1, format!("line-{id}"))),
        fast_config(),
    );
    // Session 3 has no scripted plan: its handshakes fail and it settles,
    // without holding up the rest of the fleet.
    for id in [1, 2, 4, 5] {
        h.transport
            .plan(id, ConnectPlan::Events(vec![TransportEvent::Paired]));
    }

    let report = start_all_sessions(
        Arc::clone(&h.registry),
        Arc::clone(&h.store) as Arc<dyn SessionStore>,
        2,
    )
    .await
    .unwrap();

    assert_eq!(report.started, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(h.registry.running_count().await, 5);

    for id in [1, 2, 4, 5] {
        h.wait_for_status(id, SessionStatus::Connected, WAIT).await;
    }
    h.wait_for_record(3, WAIT, |r| {
        r.status == SessionStatus::Disconnected && r.retries == 3
    })
    .await;
}

#[tokio::test]
async fn start_queues_behind_a_concurrent_stop() {
    let h = Harness::with_slow_records(
        [SessionRecord::new(1, 1, "main")],
        fast_config(),
        Duration::from_millis(100),
    );
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    h.registry.start(1).await.unwrap();
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;

    // The stop's final persist keeps it holding the per-id serialization
    // point while the start arrives.
    let stopper = Arc::clone(&h.registry);
    let stop_task = tokio::spawn(async move { stopper.stop(1).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let snapshot = h
        .registry
        .start(1)
        .await
        .expect("a start during a stop must queue behind it, not fail");
    assert_eq!(snapshot.session_id, 1);
    stop_task.await.unwrap();

    // The queued start ran after the stop and spawned a fresh client.
    let transport = Arc::clone(&h.transport);
    wait_until(WAIT, || transport.connect_count() == 2).await;
    assert_eq!(h.registry.running_count().await, 1);
    assert_eq!(h.transport.max_active_for(1), 1);
}

#[tokio::test]
async fn only_a_competing_start_fails_fast() {
    let h = Harness::with_slow_records(
        [SessionRecord::new(1, 1, "main")],
        fast_config(),
        Duration::from_millis(150),
    );
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));

    // The slow record load keeps the first start in flight.
    let starter = Arc::clone(&h.registry);
    let start_task = tokio::spawn(async move { starter.start(1).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(
        h.registry.start(1).await,
        Err(SessionError::AlreadyStarting(1))
    ));
    assert!(matches!(
        h.registry.restart(1).await,
        Err(SessionError::AlreadyStarting(1))
    ));

    start_task.await.unwrap().unwrap();

    // Once the start lands, restart is available again.
    h.transport
        .plan(1, ConnectPlan::Events(vec![TransportEvent::Paired]));
    h.registry.restart(1).await.unwrap();
    h.wait_for_status(1, SessionStatus::Connected, WAIT).await;
    assert_eq!(h.transport.max_active_for(1), 1);
}
