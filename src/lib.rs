//! OnePay Ledger - Ledger Consistency Engine
//!
//! Moves money between user wallets across three independently
//! persisted aggregates (wallets, money tokens, history) with no
//! multi-store transaction primitive. Multi-step operations either
//! fully land or stay durably recoverable through the checkpoint log.
//!
//! # Modules
//!
//! - [`models`] - Wallets, money tokens, history records
//! - [`money`] - Minor-unit amount conversion
//! - [`stores`] - Collaborator store traits and memory implementations
//! - [`checkpoint`] - Durable before-image checkpoint log
//! - [`limits`] - Rolling 24-hour daily cap
//! - [`orchestrator`] - The transfer operations
//! - [`recovery`] - Checkpoint replay loop
//! - [`config`] - Explicit limit/fee configuration
//! - [`error`] - Caller-facing error taxonomy

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod limits;
pub mod logging;
pub mod models;
pub mod money;
pub mod orchestrator;
pub mod recovery;
pub mod stores;

// Convenient re-exports at crate root
pub use checkpoint::{CheckpointConfig, CheckpointEntry, CheckpointKind, CheckpointLog};
pub use config::{AppConfig, LedgerConfig, RecoveryConfig};
pub use error::LedgerError;
pub use limits::RateLimiter;
pub use models::{HistoryDraft, HistoryRecord, MoneyToken, TransferMethod, Wallet};
pub use orchestrator::Orchestrator;
pub use recovery::{
    PassStats, RecoverySignal, RecoveryWorker, ReloadTrigger, recovery_channel, spawn_periodic,
};
