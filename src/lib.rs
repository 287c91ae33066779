// duo - shared coordination store for multi-agent PR review
// This exposes the core components for the CLI and for integration tests

pub mod bus;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod liveness;
pub mod mirror;
pub mod telemetry;

// Re-export key types for easy access
pub use bus::{HistoryFilter, MessageBus};
pub use crate::config::{config, DuoConfig, RepoSlug, SessionIdentity};
pub use coordinator::{AgentStatus, Coordinator, PublishOutcome, StatusSnapshot};
pub use error::{DuoError, Result};
pub use ledger::{AgentRecord, Ledger, Message, MirrorRecord, Recipient, StateEntry, BROADCAST};
pub use liveness::{Liveness, LivenessMonitor, TailOptions};
pub use mirror::{GitHubMirror, MirrorAdapter, MirrorError, RemoteComment};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
