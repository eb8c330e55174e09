//! Core abstractions for the persistent remote-command channel.
//!
//! This crate provides the fundamental building blocks:
//! - `crypto` - AES-256-CBC payload encoding under a pre-shared key
//! - `LivenessPolicy` - Heartbeat-gap inference of session liveness
//! - `Clock` - Injectable "server now"
//! - `ChannelConfig` - Layered file + environment configuration
//! - Storage, settings and authentication traits

pub mod clock;
pub mod config;
pub mod crypto;
pub mod liveness;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChannelConfig;
pub use crypto::{CryptoError, EncryptionKey};
pub use liveness::{Liveness, LivenessPolicy};
pub use traits::{Authenticator, SessionStorage, SettingsStore};
