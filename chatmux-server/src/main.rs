use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use chatmux_core::{
    transport::create_transport, ChatmuxConfig, MemorySessionStore, MemoryTicketStore,
    PgSessionStore, PgTicketStore, SessionStore, TicketStore,
};
use chatmux_server::router::AppContext;
use chatmux_server::subsystems::broadcaster::Broadcaster;
use chatmux_server::subsystems::registry::SessionRegistry;
use chatmux_server::subsystems::{autoclose, orchestrator};
use chatmux_server::{http, server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "chatmux.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match ChatmuxConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Stores: Postgres in production, in-memory for credential-less dev mode
    let (pool, session_store, ticket_store): (
        Option<sqlx::PgPool>,
        Arc<dyn SessionStore>,
        Arc<dyn TicketStore>,
    ) = if config.database.backend == "memory" {
        tracing::warn!("running with in-memory stores; nothing survives a restart");
        (
            None,
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryTicketStore::new()),
        )
    } else {
        let pool = match chatmux_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        };
        (
            Some(pool.clone()),
            Arc::new(PgSessionStore::new(pool.clone())),
            Arc::new(PgTicketStore::new(pool)),
        )
    };

    if args.health {
        match &pool {
            Some(pool) => match chatmux_core::db::health_check(pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            },
            None => println!("✅ memory backend (no database to check)"),
        }
        println!("✅ Chatmux health check passed");
        return Ok(());
    }

    // Shutdown signal
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Session machinery
    let transport = create_transport(&config.transport)
        .map_err(|e| anyhow::anyhow!("transport init failed: {e}"))?;
    tracing::info!(backend = transport.name(), "protocol transport ready");

    let broadcaster = Arc::new(Broadcaster::new(config.whatsapp.event_capacity));
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&session_store),
        Arc::clone(&broadcaster),
        transport,
        config.whatsapp.clone(),
    ));

    // Bring every persisted session to its last-known-good state
    orchestrator::start_all_sessions(
        Arc::clone(&registry),
        Arc::clone(&session_store),
        config.whatsapp.startup_concurrency,
    )
    .await?;

    // Auto-close sweep for idle conversations
    if config.autoclose.enabled {
        let autoclose_config = config.autoclose.clone();
        let autoclose_shutdown = tx.subscribe();
        tokio::spawn(autoclose::run_autoclose_loop(
            ticket_store,
            autoclose_config,
            autoclose_shutdown,
        ));
    }

    let ctx = AppContext {
        registry: Arc::clone(&registry),
        store: session_store,
        pool,
    };

    // HTTP REST API
    if config.http.enabled {
        let state = Arc::new(http::HttpState {
            ctx: ctx.clone(),
            config: config.clone(),
        });
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = http::start_http_server(state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = config.service.socket_path.clone();
    server::run_unix_server(&socket_path, ctx, tx.subscribe()).await?;

    // Graceful teardown: stop all clients in parallel within the grace period
    registry
        .shutdown_all(Duration::from_secs(config.whatsapp.shutdown_grace_seconds))
        .await;

    Ok(())
}
