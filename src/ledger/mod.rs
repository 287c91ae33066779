//! Durable, lock-protected store for one review session.
//!
//! The ledger is a directory holding three things:
//!
//! - `state.json`: state entries, the agent registry and mirror records, always
//!   replaced as a whole (write temp file, fsync, rename) so readers see either the
//!   old or the new document, never a mix.
//! - `messages.jsonl`: the append-only message log (see [`messages`]).
//! - `ledger.lock`: the advisory lock every operation goes through (see [`lock`]).
//!
//! Nothing is created until the first write.

pub mod lock;
pub mod messages;
pub mod types;

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{LedgerConfig, SessionIdentity};
use crate::error::{DuoError, Result};
use self::lock::LedgerLock;
use self::messages::MessageLog;
use self::types::StateDocument;

pub use self::messages::MessageIter;
pub use self::types::{
    AgentRecord, Message, MirrorRecord, Recipient, SessionMeta, StateEntry, BROADCAST,
};

const STATE_FILE: &str = "state.json";
const MESSAGES_FILE: &str = "messages.jsonl";
const LOCK_FILE: &str = "ledger.lock";

#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
    lock: LedgerLock,
    log: MessageLog,
}

impl Ledger {
    /// Point at a ledger directory. Performs no I/O.
    pub fn open(dir: impl Into<PathBuf>, settings: &LedgerConfig) -> Self {
        let dir = dir.into();
        Self {
            lock: LedgerLock::new(
                dir.join(LOCK_FILE),
                settings.lock_timeout(),
                settings.lock_retry(),
            ),
            log: MessageLog::new(dir.join(MESSAGES_FILE)),
            dir,
        }
    }

    /// The ledger for a (repository, PR) session under `settings.root_dir`.
    pub fn for_session(identity: &SessionIdentity, settings: &LedgerConfig) -> Self {
        Self::open(identity.ledger_dir(&settings.root_dir), settings)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether anything has ever been written to this ledger.
    pub fn exists(&self) -> bool {
        self.dir.join(STATE_FILE).exists() || self.log.path().exists()
    }

    pub fn set_state(&self, key: &str, value: &str, agent: &str) -> Result<StateEntry> {
        if key.trim().is_empty() {
            return Err(DuoError::Configuration("state key must not be empty".into()));
        }

        let entry = self.mutate_document(|doc| {
            let entry = StateEntry {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
                updated_by: agent.to_string(),
            };
            doc.entries.insert(key.to_string(), entry.clone());
            Ok(entry)
        })?;

        debug!(key, agent, "State entry committed");
        Ok(entry)
    }

    pub fn get_state(&self, key: &str) -> Result<StateEntry> {
        self.read_document()?
            .entries
            .remove(key)
            .ok_or_else(|| DuoError::NotFound(format!("state key '{key}'")))
    }

    pub fn all_state(&self) -> Result<BTreeMap<String, StateEntry>> {
        Ok(self.read_document()?.entries)
    }

    /// Write several keys in one atomic replace.
    pub fn set_many(&self, pairs: &[(String, String)], agent: &str) -> Result<()> {
        self.mutate_document(|doc| {
            let now = Utc::now();
            for (key, value) in pairs {
                doc.entries.insert(
                    key.clone(),
                    StateEntry {
                        key: key.clone(),
                        value: value.clone(),
                        updated_at: now,
                        updated_by: agent.to_string(),
                    },
                );
            }
            Ok(())
        })
    }

    /// Record session metadata and reset `stage` to 1, all in one replace.
    pub fn init_session(&self, meta: &SessionMeta, agent: &str) -> Result<()> {
        self.set_many(&meta.to_pairs(Utc::now()), agent)?;
        info!(repo = %meta.repo, pr = meta.pr_number, "Session initialised");
        Ok(())
    }

    /// Add an agent, or refresh its registration while keeping existing settings
    /// that `settings` does not override.
    pub fn register_agent(
        &self,
        name: &str,
        settings: BTreeMap<String, String>,
    ) -> Result<AgentRecord> {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let record = self.mutate_document(|doc| {
            let now = Utc::now();
            let record = doc
                .agents
                .entry(name.to_string())
                .and_modify(|existing| {
                    existing.settings.extend(settings.clone());
                    existing.updated_at = now;
                    existing.hostname = hostname.clone();
                })
                .or_insert_with(|| AgentRecord {
                    name: name.to_string(),
                    settings: settings.clone(),
                    registered_at: now,
                    updated_at: now,
                    hostname: hostname.clone(),
                });
            Ok(record.clone())
        })?;

        info!(agent = name, "Agent registered");
        Ok(record)
    }

    pub fn agent(&self, name: &str) -> Result<AgentRecord> {
        self.read_document()?
            .agents
            .remove(name)
            .ok_or_else(|| DuoError::UnknownAgent(name.to_string()))
    }

    /// Registered agents, sorted by name.
    pub fn agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.read_document()?.agents.into_values().collect())
    }

    pub fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.read_document()?.agents.contains_key(name))
    }

    /// Merge `options` into an existing agent's settings.
    pub fn update_agent_settings(
        &self,
        name: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<AgentRecord> {
        self.mutate_document(|doc| {
            let record = doc
                .agents
                .get_mut(name)
                .ok_or_else(|| DuoError::UnknownAgent(name.to_string()))?;
            record.settings.extend(options.clone());
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
    }

    pub fn mirror_record(&self, marker: &str) -> Result<Option<MirrorRecord>> {
        Ok(self.read_document()?.mirror.remove(marker))
    }

    pub fn put_mirror_record(&self, marker: &str, record: MirrorRecord) -> Result<()> {
        self.mutate_document(|doc| {
            doc.mirror.insert(marker.to_string(), record);
            Ok(())
        })
    }

    pub fn forget_mirror_record(&self, marker: &str) -> Result<()> {
        self.mutate_document(|doc| {
            doc.mirror.remove(marker);
            Ok(())
        })
    }

    /// Append a message and return its sequence number.
    pub fn append_message(&self, from: &str, to: &Recipient, body: &str) -> Result<u64> {
        self.ensure_dir()?;
        let message = self.lock.exclusive(|| self.log.append(from, to, body))?;
        debug!(seq = message.id, from, to = %to, "Message appended");
        Ok(message.id)
    }

    /// Committed messages with id > `since`, optionally only those reaching `recipient`.
    pub fn read_messages(&self, since: u64, recipient: Option<&str>) -> Result<MessageIter> {
        let recipient = recipient.map(str::to_string);
        if !self.dir.exists() {
            return self.log.snapshot(since, recipient);
        }
        self.lock.shared(|| self.log.snapshot(since, recipient))
    }

    pub fn latest_sequence(&self) -> Result<u64> {
        if !self.dir.exists() {
            return Ok(0);
        }
        self.lock.shared(|| self.log.latest_id())
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(DuoError::storage("creating ledger directory"))
    }

    fn read_document(&self) -> Result<StateDocument> {
        if !self.dir.exists() {
            return Ok(StateDocument::default());
        }
        self.lock.shared(|| self.load_document())
    }

    /// Load, change and atomically replace the state document under the exclusive lock.
    /// When `f` fails nothing is written.
    fn mutate_document<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        self.ensure_dir()?;
        self.lock.exclusive(|| {
            let mut doc = self.load_document()?;
            let out = f(&mut doc)?;
            self.save_document(&doc)?;
            Ok(out)
        })
    }

    fn load_document(&self) -> Result<StateDocument> {
        let path = self.dir.join(STATE_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StateDocument {
                    version: StateDocument::VERSION,
                    ..StateDocument::default()
                })
            }
            Err(err) => return Err(DuoError::storage("reading state document")(err)),
        };

        let doc: StateDocument = serde_json::from_slice(&raw)
            .map_err(|err| DuoError::Corrupted(format!("{}: {err}", path.display())))?;
        if doc.version > StateDocument::VERSION {
            return Err(DuoError::Corrupted(format!(
                "{} has version {}, this build understands up to {}",
                path.display(),
                doc.version,
                StateDocument::VERSION
            )));
        }
        Ok(doc)
    }

    fn save_document(&self, doc: &StateDocument) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        let temp_path = self.dir.join(format!("{STATE_FILE}.tmp"));
        let serialized = serde_json::to_vec_pretty(doc)?;

        // Write to temporary file first, then rename (atomic operation)
        let written = File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&serialized)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&temp_path, &path));

        written.map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            DuoError::storage("replacing state document")(err)
        })
    }
}
