//! Session storage and the command broker for the persistent channel.
//!
//! Provides:
//! - `SessionBroker` - Poll / submit / status protocol state machine
//! - Storage implementations (memory, SQLite)
//! - `MemorySettings` - Runtime-rotatable encryption key

pub mod broker;
pub mod settings;
pub mod storage;

pub use broker::{AgentPoll, BrokerError, PollOutcome, SessionBroker, SessionStatus};
pub use settings::MemorySettings;
