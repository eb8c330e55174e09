//! Layered configuration: optional TOML file, then `PERSIST__*` environment.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::LivenessPolicy;

/// Environment prefix; nested keys use `__`, e.g. `PERSIST__SERVER__PORT`.
pub const ENV_PREFIX: &str = "PERSIST";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConfig {
    pub poll_interval_secs: i64,
    pub status_window_secs: i64,
    pub submit_window_secs: i64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        let policy = LivenessPolicy::default();
        Self {
            poll_interval_secs: policy.poll_interval_secs(),
            status_window_secs: policy.status_window_secs(),
            submit_window_secs: policy.submit_window_secs(),
        }
    }
}

impl LivenessConfig {
    /// Check the windows against the poll interval and build the policy.
    ///
    /// # Errors
    /// Returns an error if the interval is not positive or either window
    /// does not exceed it.
    pub fn validate(&self) -> Result<LivenessPolicy, ConfigError> {
        if self.poll_interval_secs <= 0 {
            return Err(ConfigError::Message(
                "liveness.poll_interval_secs must be positive".to_string(),
            ));
        }
        for (name, window) in [
            ("status_window_secs", self.status_window_secs),
            ("submit_window_secs", self.submit_window_secs),
        ] {
            if window <= self.poll_interval_secs {
                return Err(ConfigError::Message(format!(
                    "liveness.{name} ({window}s) must exceed the poll interval ({}s)",
                    self.poll_interval_secs
                )));
            }
        }
        Ok(LivenessPolicy::new(
            self.poll_interval_secs,
            self.status_window_secs,
            self.submit_window_secs,
        ))
    }
}

/// Session store selection. No URL means in-memory.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for operator session tokens. Without it every operator
    /// request is rejected.
    pub jwt_secret: Option<String>,
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            cookie_name: "persist_session".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Initial key seeded into the settings store at startup.
    pub key: Option<String>,
}

impl ChannelConfig {
    /// Load from an optional TOML file, overridden by `PERSIST__*` variables.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let cfg: Self = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.liveness.validate()?;
        Ok(cfg)
    }

    /// Parse from TOML text alone.
    ///
    /// # Errors
    /// Returns an error if the text cannot be parsed or validation fails.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.liveness.validate()?;
        Ok(cfg)
    }
}
