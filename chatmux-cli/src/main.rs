//! chatmux-cli — operator frontend for the Chatmux session registry
//!
//! # Subcommands
//! - `list [--company <id>] [--json]` — live session snapshots
//! - `get <id> [--json]`              — one session's state
//! - `restart <id>`                   — atomically restart a session
//! - `delete <id>`                    — stop a session and delete its record
//! - `status`                         — show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8770";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "chatmux-cli",
    version,
    about = "Chatmux WhatsApp session registry — operator CLI"
)]
struct Cli {
    /// Chatmux HTTP server URL (overrides CHATMUX_HTTP_URL env var)
    #[arg(long, env = "CHATMUX_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List live sessions
    List {
        /// Only sessions belonging to this company
        #[arg(long)]
        company: Option<i32>,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one session's state (live or persisted)
    Get {
        /// Session id
        id: i32,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop and start a session atomically
    Restart {
        /// Session id
        id: i32,
    },

    /// Stop a session and delete its record
    Delete {
        /// Session id
        id: i32,
    },

    /// Show Chatmux server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

/// One live session snapshot from GET /connections
#[derive(Debug, Deserialize)]
struct Snapshot {
    session_id: i32,
    company_id: i32,
    name: String,
    status: String,
    qrcode: String,
    pairing_code: Option<String>,
    retries: i32,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    connections: Vec<Snapshot>,
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?)
}

fn print_snapshot(s: &Snapshot) {
    println!(
        "#{:<5} {:<24} company {:<5} {:<13} retries {}",
        s.session_id, s.name, s.company_id, s.status, s.retries
    );
    if !s.qrcode.is_empty() {
        println!("       qrcode: {}", s.qrcode);
    }
    if let Some(code) = &s.pairing_code {
        println!("       pairing code: {}", code);
    }
}

fn do_list(server: &str, company: Option<i32>, json_output: bool) -> anyhow::Result<()> {
    let mut url = format!("{}/connections", server);
    if let Some(company) = company {
        url = format!("{}?company_id={}", url, company);
    }

    let resp = match client()?.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chatmux-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("chatmux-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    if json_output {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let list: ListResponse = match resp.json() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chatmux-cli: failed to parse response: {}", e);
            std::process::exit(1);
        }
    };

    if list.connections.is_empty() {
        eprintln!("No live sessions");
        return Ok(());
    }
    for snapshot in &list.connections {
        print_snapshot(snapshot);
    }
    Ok(())
}

fn do_get(server: &str, id: i32, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/connections/{}", server, id);
    let resp = match client()?.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chatmux-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();
    if !status.is_success() {
        eprintln!(
            "chatmux-cli: server returned {}: {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!(
            "session {}: {} (running: {})",
            id,
            body["status"].as_str().unwrap_or("?"),
            body["running"].as_bool().unwrap_or(false)
        );
        if let Some(qrcode) = body["qrcode"].as_str() {
            if !qrcode.is_empty() {
                println!("qrcode: {}", qrcode);
            }
        }
    }
    Ok(())
}

fn do_restart(server: &str, id: i32) -> anyhow::Result<()> {
    let url = format!("{}/whatsapp/{}/restart", server, id);
    let resp = match client()?.post(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chatmux-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();
    if !status.is_success() {
        eprintln!(
            "chatmux-cli: restart failed ({}): {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
    println!(
        "session {} restarted (status: {})",
        id,
        body["status"].as_str().unwrap_or("?")
    );
    Ok(())
}

fn do_delete(server: &str, id: i32) -> anyhow::Result<()> {
    let url = format!("{}/whatsapp/{}", server, id);
    let resp = match client()?.delete(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chatmux-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().unwrap_or_default();
        eprintln!(
            "chatmux-cli: delete failed ({}): {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
    println!("session {} deleted", id);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client()?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!(
                "Chatmux server: {}",
                body["status"].as_str().unwrap_or("unknown")
            );
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("Database:       {}", body["database"].as_str().unwrap_or("?"));
            println!(
                "Live sessions:  {}",
                body["sessions_running"].as_u64().unwrap_or(0)
            );
        }
        Ok(r) => {
            eprintln!("chatmux-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("chatmux-cli: cannot reach {} — {}", url, e);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::List { company, json } => do_list(&cli.server, company, json),
        Commands::Get { id, json } => do_get(&cli.server, id, json),
        Commands::Restart { id } => do_restart(&cli.server, id),
        Commands::Delete { id } => do_delete(&cli.server, id),
        Commands::Status => do_status(&cli.server),
    }
}
