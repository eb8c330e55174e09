//! Simulated agent for exercising a listener from the terminal.
//!
//! Run with: cargo run -p persist-agent-sim -- --session-id r1
//!
//! Understands a tiny command language in place of a script engine:
//! `echo <text>`, `sum <n>...`, `upper <text>`, `now`, `noop`.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use persist_agent::{AgentRuntime, CommandEvaluator, HttpTransport};
use persist_core::EncryptionKey;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "persist-agent-sim", about = "Simulated persistent channel agent")]
struct Cli {
    /// Channel endpoint of the listener.
    #[arg(long, default_value = "http://127.0.0.1:3000/api/persist")]
    endpoint: String,

    /// Session identifier to report under.
    #[arg(long)]
    session_id: String,

    /// Pre-shared key, 64 hex characters.
    #[arg(long)]
    key: Option<String>,

    /// Behave like an agent without usable cryptography.
    #[arg(long)]
    no_crypto: bool,

    /// Milliseconds between polls.
    #[arg(long, default_value_t = 3000)]
    interval_ms: u64,
}

struct MiniShell;

impl CommandEvaluator for MiniShell {
    fn evaluate(&self, command: &str) -> Result<Option<Value>, String> {
        let (verb, rest) = command.trim().split_once(' ').unwrap_or((command.trim(), ""));
        match verb {
            "echo" => Ok(Some(Value::String(rest.to_string()))),
            "upper" => Ok(Some(Value::String(rest.to_uppercase()))),
            "sum" => rest
                .split_whitespace()
                .map(|n| n.parse::<f64>().map_err(|_| format!("{n} is not a number")))
                .sum::<Result<f64, String>>()
                .map(|total| Some(json!(total))),
            "now" => Ok(Some(json!({ "now": chrono::Utc::now().to_rfc3339() }))),
            "noop" => Ok(None),
            other => Err(format!("{other} is not defined")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let transport = HttpTransport::new(&cli.endpoint)?;

    let no_crypto = cli.no_crypto;
    let mut agent = AgentRuntime::new(cli.session_id, transport, MiniShell, move || !no_crypto)
        .with_interval(Duration::from_millis(cli.interval_ms));
    if let Some(raw) = cli.key.as_deref() {
        let key = EncryptionKey::parse(raw).context("--key must be 64 hex characters")?;
        agent = agent.with_key(key);
    }

    tracing::info!(endpoint = %cli.endpoint, "Polling listener, Ctrl+C to stop");
    agent.run(shutdown_on(tokio::signal::ctrl_c())).await;

    Ok(())
}

/// Resolve once `signal` fires, or at once if the handler cannot be installed.
async fn shutdown_on<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
