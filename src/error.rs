use std::path::PathBuf;
use thiserror::Error;

use crate::mirror::MirrorError;

/// Errors surfaced by the coordination store.
///
/// Every failure is produced before or instead of a commit, so a returned error
/// always means the ledger was left exactly as it was.
#[derive(Debug, Error)]
pub enum DuoError {
    #[error("storage error while {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger record corrupted: {0}")]
    Corrupted(String),

    #[error("timed out after {waited_ms}ms waiting for ledger lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown agent '{0}' (check 'duo agents')")]
    UnknownAgent(String),

    #[error("agent '{agent}' is not running{}", .pid.map(|p| format!(" (was pid={p})")).unwrap_or_default())]
    AgentNotRunning { agent: String, pid: Option<u32> },

    #[error("could not signal agent '{agent}': {reason}")]
    SignalDelivery { agent: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// The review thread was changed but the ledger could not record it.
    #[error("review thread changed (comment {remote_id}) but the ledger record was not saved: {source}")]
    MirrorRecordNotSaved {
        remote_id: String,
        #[source]
        source: Box<DuoError>,
    },
}

impl DuoError {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| DuoError::Storage { operation, source }
    }

    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DuoError::LockTimeout { .. } | DuoError::Storage { .. } | DuoError::Mirror(_)
        )
    }

    /// Validation and race outcomes that callers report rather than treat as crashes.
    pub fn is_reportable_outcome(&self) -> bool {
        matches!(
            self,
            DuoError::NotFound(_) | DuoError::UnknownAgent(_) | DuoError::AgentNotRunning { .. }
        )
    }

    /// Remote id of a change that already happened when the error was raised.
    pub fn committed_remote_id(&self) -> Option<&str> {
        match self {
            DuoError::MirrorRecordNotSaved { remote_id, .. } => Some(remote_id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DuoError {
    fn from(err: serde_json::Error) -> Self {
        DuoError::Corrupted(err.to_string())
    }
}

pub type Result<T, E = DuoError> = std::result::Result<T, E>;
