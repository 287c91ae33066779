use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Recipient value meaning "deliverable to all agents".
pub const BROADCAST: &str = "*";

/// Addressee of a message: one named agent or everyone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

impl Recipient {
    pub fn parse(raw: &str) -> Self {
        Recipient::from(raw.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    /// True when a message with this recipient belongs in `agent`'s inbox.
    pub fn reaches(&self, agent: &str) -> bool {
        match self {
            Recipient::Broadcast => true,
            Recipient::Agent(name) => name == agent,
        }
    }
}

impl From<String> for Recipient {
    fn from(raw: String) -> Self {
        if raw == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Agent(raw)
        }
    }
}

impl From<Recipient> for String {
    fn from(recipient: Recipient) -> Self {
        match recipient {
            Recipient::Agent(name) => name,
            Recipient::Broadcast => BROADCAST.to_string(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(name) => f.write_str(name),
            Recipient::Broadcast => f.write_str(BROADCAST),
        }
    }
}

/// One shared key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// An immutable entry in the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub from: String,
    pub to: Recipient,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Sent by or addressed to `agent` (broadcasts count as addressed to everyone).
    pub fn involves(&self, agent: &str) -> bool {
        self.from == agent || self.to.reaches(agent)
    }
}

/// A registered participant. The process handle is deliberately absent: it lives in
/// the liveness monitor's pid files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
}

/// Where a derived view was last published remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub remote_id: String,
    pub last_published_hash: String,
    pub published_at: DateTime<Utc>,
}

/// Metadata written when a review session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub repo: String,
    pub pr_number: u64,
    pub branch: Option<String>,
    pub base: Option<String>,
    pub runner: Option<String>,
}

impl SessionMeta {
    /// State pairs for the session: identity, optional refs, `stage=1` and `started_at`.
    pub fn to_pairs(&self, started_at: DateTime<Utc>) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("repo".to_string(), self.repo.clone()),
            ("pr".to_string(), self.pr_number.to_string()),
        ];
        for (key, value) in [
            ("branch", &self.branch),
            ("base", &self.base),
            ("runner", &self.runner),
        ] {
            if let Some(value) = value {
                pairs.push((key.to_string(), value.clone()));
            }
        }
        pairs.push(("stage".to_string(), "1".to_string()));
        pairs.push(("started_at".to_string(), started_at.to_rfc3339()));
        pairs
    }
}

/// Full contents of `state.json`; always replaced as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StateDocument {
    #[serde(default = "StateDocument::current_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,
    #[serde(default)]
    pub mirror: BTreeMap<String, MirrorRecord>,
}

impl StateDocument {
    pub const VERSION: u32 = 1;

    fn current_version() -> u32 {
        Self::VERSION
    }
}
