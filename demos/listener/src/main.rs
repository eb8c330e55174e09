//! Listener for the persistent command channel.
//!
//! Run with: cargo run -p persist-listener -- --config persist.toml
//!
//! Agents poll `POST /api/persist`; operators queue commands with
//! `PUT /api/persist` and read status with `GET /api/persist?sessionId=`.

use std::sync::Arc;

use anyhow::Context;
use chrono::TimeDelta;
use clap::Parser;
use persist_core::{
    ChannelConfig, SessionStorage, SettingsStore,
    traits::{Authenticator, Operator},
};
use persist_session::{
    MemorySettings, SessionBroker,
    storage::{MemoryStorage, SqliteStorage},
};
use persist_transport::{AppState, DenyAll, JwtAuthenticator, auth::sign_token, router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "persist-listener", about = "Persistent command channel listener")]
struct Cli {
    /// Configuration file; missing files fall back to defaults and environment.
    #[arg(long, default_value = "persist.toml")]
    config: String,

    /// Print an operator token for USERNAME and exit.
    #[arg(long, value_name = "USERNAME")]
    issue_token: Option<String>,

    /// Lifetime of an issued token, in hours.
    #[arg(long, default_value_t = 12)]
    token_ttl_hours: i64,
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
    let config = ChannelConfig::load(Some(&cli.config)).context("loading configuration")?;

    if let Some(username) = cli.issue_token {
        let secret = config
            .auth
            .jwt_secret
            .as_deref()
            .context("auth.jwt_secret must be set to issue tokens")?;
        let operator = Operator {
            user_id: username.clone(),
            username,
            rank: 0,
        };
        let token = sign_token(secret, &operator, TimeDelta::hours(cli.token_ttl_hours))?;
        println!("{token}");
        return Ok(());
    }

    let auth: Arc<dyn Authenticator> = match config.auth.jwt_secret.as_deref() {
        Some(secret) => Arc::new(JwtAuthenticator::new(secret)),
        None => {
            tracing::warn!("auth.jwt_secret not set, operator endpoints will reject every request");
            Arc::new(DenyAll)
        }
    };

    match config.database.url.clone() {
        Some(url) => {
            let storage = SqliteStorage::connect(&url)
                .await
                .with_context(|| format!("opening {url}"))?;
            if let Some(key) = config.encryption.key.as_deref() {
                storage.set_encryption_key(Some(key)).await?;
            }
            tracing::info!("Using SQLite store at {url}");
            serve(&config, storage.clone(), storage, auth).await
        }
        None => {
            let settings = config
                .encryption
                .key
                .clone()
                .map_or_else(MemorySettings::new, MemorySettings::with_key);
            tracing::info!("Using in-memory store");
            serve(&config, MemoryStorage::new(), settings, auth).await
        }
    }
}

async fn serve<S, K>(
    config: &ChannelConfig,
    storage: S,
    settings: K,
    auth: Arc<dyn Authenticator>,
) -> anyhow::Result<()>
where
    S: SessionStorage + 'static,
    K: SettingsStore + 'static,
{
    let policy = config.liveness.validate()?;
    if settings.current_key().await.is_none() {
        tracing::warn!("No valid encryption key configured, commands are sent in the clear");
    }

    let broker = SessionBroker::new(storage, settings).with_policy(policy);
    let app = router(AppState::new(broker, auth, config.auth.cookie_name.as_str()));

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    tracing::info!("Listener stopped");
    Ok(())
}
