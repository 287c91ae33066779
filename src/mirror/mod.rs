//! One-way projection of ledger views onto the PR review thread.
//!
//! The ledger only remembers where a view was published and the hash of what was
//! sent; the remote thread is never read back into local state.

pub mod errors;
pub mod github;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

pub use self::errors::MirrorError;
pub use self::github::GitHubMirror;

/// Marker carried by the status snapshot comment.
pub const STATUS_MARKER: &str = "duo-status";

static MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!-- (duo-[a-z0-9-]+) -->").expect("static pattern compiles"));

/// A comment on the remote thread that carries a duo marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteComment {
    pub remote_id: String,
    pub marker: String,
    pub created_at: DateTime<Utc>,
    pub url: Option<String>,
    pub body: String,
}

/// Boundary to the external review thread.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait MirrorAdapter: Send + Sync {
    /// Create a new remote record and return its opaque id.
    async fn publish(&self, content: &str) -> Result<String, MirrorError>;

    async fn fetch(&self, remote_id: &str) -> Result<String, MirrorError>;

    async fn update(&self, remote_id: &str, content: &str) -> Result<(), MirrorError>;

    async fn delete(&self, remote_id: &str) -> Result<(), MirrorError>;

    /// Marker-bearing records, oldest first.
    async fn list(&self) -> Result<Vec<RemoteComment>, MirrorError>;
}

/// Hidden HTML comment identifying a duo-managed record.
pub fn marker_tag(marker: &str) -> String {
    format!("<!-- {marker} -->")
}

/// First duo marker found in `body`.
pub fn find_marker(body: &str) -> Option<String> {
    MARKER_PATTERN
        .captures(body)
        .map(|caps| caps[1].to_string())
}

/// Prefix `body` with the marker tag unless it already carries one.
pub fn with_marker(marker: &str, body: &str) -> String {
    if find_marker(body).is_some() {
        body.to_string()
    } else {
        format!("{}\n{body}", marker_tag(marker))
    }
}

/// Stable fingerprint of published content, used to skip no-op updates.
pub fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
