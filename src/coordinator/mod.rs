//! Composite operations over one review session.
//!
//! Every call opens the ledger, does its work under the ledger lock and releases it
//! before returning. Mirror traffic happens only after local work is committed, so a
//! slow or failing review thread never holds up other agents.

pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{HistoryFilter, MessageBus};
use crate::config::{validate_agent_name, DuoConfig, MirrorConfig, SessionIdentity};
use crate::error::{DuoError, Result};
use crate::ledger::{
    AgentRecord, Ledger, Message, MessageIter, MirrorRecord, Recipient, SessionMeta, StateEntry,
};
use crate::liveness::{Liveness, LivenessMonitor, TailOptions};
use crate::mirror::{
    content_hash, with_marker, GitHubMirror, MirrorAdapter, MirrorError, RemoteComment,
    STATUS_MARKER,
};

pub use self::status::{AgentStatus, StatusSnapshot};

/// What `publish_status` did on the remote thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Created { remote_id: String },
    Updated { remote_id: String },
    Unchanged { remote_id: String },
}

impl PublishOutcome {
    pub fn remote_id(&self) -> &str {
        match self {
            PublishOutcome::Created { remote_id }
            | PublishOutcome::Updated { remote_id }
            | PublishOutcome::Unchanged { remote_id } => remote_id,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    identity: SessionIdentity,
    ledger: Ledger,
    bus: MessageBus,
    liveness: LivenessMonitor,
    mirror_settings: MirrorConfig,
    mirror: Option<Arc<dyn MirrorAdapter>>,
    watch_interval: std::time::Duration,
}

impl Coordinator {
    /// Coordinator for the session's ledger. The GitHub mirror is built on first use.
    pub fn new(identity: SessionIdentity, config: &DuoConfig) -> Self {
        let ledger = Ledger::for_session(&identity, &config.ledger);
        let liveness = LivenessMonitor::new(
            ledger.dir(),
            std::time::Duration::from_millis(config.logs.poll_interval_ms),
        );
        Self {
            identity,
            bus: MessageBus::new(ledger.clone()),
            ledger,
            liveness,
            mirror_settings: config.mirror.clone(),
            mirror: None,
            watch_interval: config.ledger.watch_interval(),
        }
    }

    /// Use `mirror` instead of the GitHub thread.
    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorAdapter>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn send(&self, from: &str, to: &str, body: &str) -> Result<u64> {
        validate_agent_name(from)?;
        if !Recipient::parse(to).is_broadcast() {
            validate_agent_name(to)?;
        }
        self.bus.send(from, to, body)
    }

    pub fn set_state(&self, key: &str, value: &str, agent: &str) -> Result<StateEntry> {
        self.ledger.set_state(key, value, agent)
    }

    pub fn get_state(&self, key: &str) -> Result<StateEntry> {
        self.ledger.get_state(key)
    }

    /// Advisory snapshot: each part is read consistently, the whole is not.
    pub fn status(&self) -> Result<StatusSnapshot> {
        let state = self.ledger.all_state()?;
        let agents = self
            .ledger
            .agents()?
            .into_iter()
            .map(|record| {
                let liveness = self.probe(&record.name)?;
                Ok(AgentStatus { record, liveness })
            })
            .collect::<Result<Vec<_>>>()?;
        let latest_seq = self.ledger.latest_sequence()?;

        Ok(StatusSnapshot {
            repo: self.identity.repo.to_string(),
            pr_number: self.identity.pr_number,
            state,
            agents,
            latest_seq,
            observed_at: Utc::now(),
        })
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.ledger.agents()
    }

    /// Fresh liveness. Registered agents without a process handle are simply not running.
    pub fn is_alive(&self, agent: &str) -> Result<Liveness> {
        validate_agent_name(agent)?;
        match self.liveness.is_alive(agent) {
            Err(DuoError::UnknownAgent(name)) => {
                if self.ledger.is_registered(agent)? {
                    Ok(Liveness::no_process(agent))
                } else {
                    Err(DuoError::UnknownAgent(name))
                }
            }
            other => other,
        }
    }

    /// Signal the agent's process. Never touches the ledger.
    pub fn interrupt(&self, agent: &str) -> Result<u32> {
        validate_agent_name(agent)?;
        match self.liveness.interrupt(agent) {
            Err(DuoError::UnknownAgent(name)) => {
                if self.ledger.is_registered(agent)? {
                    Err(DuoError::AgentNotRunning {
                        agent: agent.to_string(),
                        pid: None,
                    })
                } else {
                    Err(DuoError::UnknownAgent(name))
                }
            }
            other => other,
        }
    }

    pub fn update_settings(
        &self,
        agent: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<AgentRecord> {
        if options.is_empty() {
            return Err(DuoError::Configuration(
                "no settings given (e.g. --model or --auto)".into(),
            ));
        }
        let record = self.ledger.update_agent_settings(agent, options)?;
        info!(agent, keys = ?options.keys().collect::<Vec<_>>(), "Agent settings updated");
        Ok(record)
    }

    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<Message>> {
        self.bus.history(filter)
    }

    pub fn inbox(&self, agent: &str, since: u64) -> Result<MessageIter> {
        validate_agent_name(agent)?;
        self.bus.inbox(agent, since)
    }

    pub fn tail_logs(
        &self,
        agent: &str,
        options: TailOptions,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        validate_agent_name(agent)?;
        match self.liveness.tail_logs(agent, options, cancel) {
            Err(DuoError::UnknownAgent(name)) => {
                if self.ledger.is_registered(agent)? {
                    Err(DuoError::NotFound(format!(
                        "log file for agent '{agent}' at {}",
                        self.liveness.log_path(agent).display()
                    )))
                } else {
                    Err(DuoError::UnknownAgent(name))
                }
            }
            other => other,
        }
    }

    /// Every change of `key`, starting with its current value, polled until `cancel` fires.
    /// A key that does not exist yet is waited for.
    pub fn watch_state(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StateEntry>> + Send + 'static {
        let ledger = self.ledger.clone();
        let key = key.to_string();
        let interval = self.watch_interval;

        async_stream::stream! {
            let mut last: Option<StateEntry> = None;
            loop {
                let polled = {
                    let ledger = ledger.clone();
                    let key = key.clone();
                    tokio::task::spawn_blocking(move || ledger.get_state(&key)).await
                };
                match polled {
                    Ok(Ok(entry)) => {
                        if last.as_ref().map(|seen| &seen.value) != Some(&entry.value) {
                            last = Some(entry.clone());
                            yield Ok(entry);
                        }
                    }
                    Ok(Err(DuoError::NotFound(_))) => {}
                    Ok(Err(err)) => {
                        yield Err(err);
                        break;
                    }
                    Err(join_err) => {
                        yield Err(DuoError::storage("polling ledger state")(
                            std::io::Error::other(join_err),
                        ));
                        break;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(key = %key, "State watch cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    /// Register (or re-register) an agent and, when given, its process id.
    pub fn register_agent(
        &self,
        name: &str,
        pid: Option<u32>,
        settings: BTreeMap<String, String>,
    ) -> Result<AgentRecord> {
        validate_agent_name(name)?;
        let record = self.ledger.register_agent(name, settings)?;
        if let Some(pid) = pid {
            self.liveness.register(name, pid)?;
        }
        Ok(record)
    }

    pub fn log_path(&self, agent: &str) -> Result<std::path::PathBuf> {
        validate_agent_name(agent)?;
        Ok(self.liveness.log_path(agent))
    }

    pub fn init_session(
        &self,
        branch: Option<String>,
        base: Option<String>,
        runner: Option<String>,
        agent: &str,
    ) -> Result<()> {
        let meta = SessionMeta {
            repo: self.identity.repo.to_string(),
            pr_number: self.identity.pr_number,
            branch,
            base,
            runner,
        };
        self.ledger.init_session(&meta, agent)
    }

    /// Publish the status snapshot to the review thread, or update the comment
    /// published earlier. Skips the remote call when nothing changed.
    pub async fn publish_status(&self) -> Result<PublishOutcome> {
        let content = self.status()?.to_markdown();
        let hash = content_hash(&content);
        let previous = self.ledger.mirror_record(STATUS_MARKER)?;

        if let Some(record) = &previous {
            if record.last_published_hash == hash {
                return Ok(PublishOutcome::Unchanged {
                    remote_id: record.remote_id.clone(),
                });
            }
        }

        // No ledger lock is held from here until the record is saved.
        let mirror = self.mirror()?;
        let outcome = match previous {
            Some(record) => match mirror.update(&record.remote_id, &content).await {
                Ok(()) => PublishOutcome::Updated {
                    remote_id: record.remote_id,
                },
                Err(err) if err.is_not_found() => {
                    warn!(remote_id = %record.remote_id, "Status comment vanished, publishing a new one");
                    PublishOutcome::Created {
                        remote_id: mirror.publish(&content).await.map_err(mirror_failed)?,
                    }
                }
                Err(err) => return Err(mirror_failed(err)),
            },
            None => PublishOutcome::Created {
                remote_id: mirror.publish(&content).await.map_err(mirror_failed)?,
            },
        };

        self.ledger
            .put_mirror_record(
                STATUS_MARKER,
                MirrorRecord {
                    remote_id: outcome.remote_id().to_string(),
                    last_published_hash: hash,
                    published_at: Utc::now(),
                },
            )
            .map_err(|err| record_not_saved(outcome.remote_id(), err))?;
        info!(remote_id = %outcome.remote_id(), "Status mirrored");
        Ok(outcome)
    }

    pub async fn mirror_list(&self) -> Result<Vec<RemoteComment>> {
        Ok(self.mirror()?.list().await?)
    }

    /// Body of a comment, addressed by remote id or by its `duo-*` marker.
    pub async fn mirror_get(&self, id_or_marker: &str) -> Result<String> {
        let mirror = self.mirror()?;
        let remote_id = resolve_remote_id(mirror.as_ref(), id_or_marker).await?;
        Ok(mirror.fetch(&remote_id).await?)
    }

    /// Post a comment, tagging it with `marker` when one is given.
    pub async fn mirror_post(&self, body: &str, marker: Option<&str>) -> Result<String> {
        if body.trim().is_empty() {
            return Err(DuoError::Configuration(
                "comment body required (use argument or --stdin)".into(),
            ));
        }
        let body = match marker {
            Some(marker) => with_marker(&normalize_marker(marker)?, body),
            None => body.to_string(),
        };
        Ok(self.mirror()?.publish(&body).await?)
    }

    /// Replace a comment body; returns the remote id that was edited.
    pub async fn mirror_edit(&self, id_or_marker: &str, body: &str) -> Result<String> {
        if body.trim().is_empty() {
            return Err(DuoError::Configuration(
                "comment body required (use argument or --stdin)".into(),
            ));
        }
        let mirror = self.mirror()?;
        let remote_id = resolve_remote_id(mirror.as_ref(), id_or_marker).await?;
        mirror.update(&remote_id, body).await?;
        Ok(remote_id)
    }

    /// Delete a comment; returns the remote id that was deleted.
    pub async fn mirror_delete(&self, id_or_marker: &str) -> Result<String> {
        let mirror = self.mirror()?;
        let remote_id = resolve_remote_id(mirror.as_ref(), id_or_marker).await?;
        mirror.delete(&remote_id).await?;

        let forget = || -> Result<()> {
            if let Some(record) = self.ledger.mirror_record(STATUS_MARKER)? {
                if record.remote_id == remote_id {
                    self.ledger.forget_mirror_record(STATUS_MARKER)?;
                }
            }
            Ok(())
        };
        forget().map_err(|err| record_not_saved(&remote_id, err))?;
        Ok(remote_id)
    }

    fn mirror(&self) -> Result<Arc<dyn MirrorAdapter>> {
        if let Some(mirror) = &self.mirror {
            return Ok(Arc::clone(mirror));
        }
        let github = GitHubMirror::new(
            &self.mirror_settings,
            self.identity.repo.clone(),
            self.identity.pr_number,
        )?;
        Ok(Arc::new(github))
    }

    /// Fresh liveness for a registered agent; agents without a pid file are simply not running.
    fn probe(&self, agent: &str) -> Result<Liveness> {
        match self.liveness.is_alive(agent) {
            Ok(liveness) => Ok(liveness),
            Err(DuoError::UnknownAgent(_)) => Ok(Liveness::no_process(agent)),
            Err(err) => Err(err),
        }
    }
}

fn record_not_saved(remote_id: &str, err: DuoError) -> DuoError {
    warn!(remote_id, error = %err, "Review thread changed but the ledger record was not saved");
    DuoError::MirrorRecordNotSaved {
        remote_id: remote_id.to_string(),
        source: Box::new(err),
    }
}

/// `duo-*` markers (any case) resolve to the newest comment carrying them; anything
/// else is taken as a remote id.
async fn resolve_remote_id(mirror: &dyn MirrorAdapter, id_or_marker: &str) -> Result<String> {
    let raw = id_or_marker.trim();
    if !raw.to_lowercase().starts_with("duo-") {
        return Ok(raw.to_string());
    }
    let marker = normalize_marker(raw)?;
    mirror
        .list()
        .await?
        .into_iter()
        .rev()
        .find(|comment| comment.marker == marker)
        .map(|comment| comment.remote_id)
        .ok_or_else(|| DuoError::NotFound(format!("comment with marker '{marker}'")))
}

fn mirror_failed(err: MirrorError) -> DuoError {
    warn!(error = %err, "Mirror publish failed, local state kept");
    DuoError::Mirror(err)
}

/// Accept `opus-r1` or `duo-opus-r1`; markers are lowercase.
fn normalize_marker(raw: &str) -> Result<String> {
    let lowered = raw.trim().to_lowercase();
    let marker = if lowered.starts_with("duo-") {
        lowered
    } else {
        format!("duo-{lowered}")
    };
    let valid = marker.len() > 4
        && marker
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(marker)
    } else {
        Err(DuoError::Configuration(format!(
            "marker '{raw}' may only contain letters, digits and '-'"
        )))
    }
}
