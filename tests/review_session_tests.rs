//! End-to-end review session scenarios driven through the `Coordinator`.

use async_trait::async_trait;
use duo_review::{
    Coordinator, DuoConfig, DuoError, HistoryFilter, MirrorAdapter, MirrorError, PublishOutcome,
    RemoteComment, SessionIdentity, TailOptions,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn coordinator(root: &Path) -> Coordinator {
    coordinator_with(root, |_| {})
}

fn coordinator_with(root: &Path, tweak: impl FnOnce(&mut DuoConfig)) -> Coordinator {
    let mut config = DuoConfig::default();
    config.ledger.root_dir = root.to_path_buf();
    config.ledger.watch_interval_ms = 10;
    config.mirror.token = None;
    config.logs.poll_interval_ms = 10;
    tweak(&mut config);
    let identity = SessionIdentity::resolve(Some("octo/widgets"), Some("42")).unwrap();
    Coordinator::new(identity, &config)
}

/// Everything an observer could read back from the ledger directory.
fn ledger_bytes(coord: &Coordinator) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let dir = coord.ledger().dir();
    (
        std::fs::read(dir.join("state.json")).ok(),
        std::fs::read(dir.join("messages.jsonl")).ok(),
    )
}

/// In-memory review thread.
#[derive(Default)]
struct FakeThread {
    comments: Mutex<Vec<(String, String)>>,
    calls: Mutex<Vec<&'static str>>,
    fail_publish: bool,
}

impl FakeThread {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MirrorAdapter for FakeThread {
    async fn publish(&self, content: &str) -> Result<String, MirrorError> {
        self.calls.lock().unwrap().push("publish");
        if self.fail_publish {
            return Err(MirrorError::Disabled);
        }
        let mut comments = self.comments.lock().unwrap();
        let id = (comments.len() + 100).to_string();
        comments.push((id.clone(), content.to_string()));
        Ok(id)
    }

    async fn fetch(&self, remote_id: &str) -> Result<String, MirrorError> {
        self.calls.lock().unwrap().push("fetch");
        self.comments
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == remote_id)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| MirrorError::NotFound {
                remote_id: remote_id.to_string(),
            })
    }

    async fn update(&self, remote_id: &str, content: &str) -> Result<(), MirrorError> {
        self.calls.lock().unwrap().push("update");
        let mut comments = self.comments.lock().unwrap();
        match comments.iter_mut().find(|(id, _)| id == remote_id) {
            Some((_, body)) => {
                *body = content.to_string();
                Ok(())
            }
            None => Err(MirrorError::NotFound {
                remote_id: remote_id.to_string(),
            }),
        }
    }

    async fn delete(&self, remote_id: &str) -> Result<(), MirrorError> {
        self.calls.lock().unwrap().push("delete");
        self.comments.lock().unwrap().retain(|(id, _)| id != remote_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteComment>, MirrorError> {
        Ok(Vec::new())
    }
}

/// Review thread that accepts the comment while another process holds the ledger lock,
/// so recording the new comment id cannot complete.
struct BusyLedgerThread {
    lock_path: PathBuf,
    holder: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl BusyLedgerThread {
    fn new(lock_path: PathBuf) -> Self {
        Self {
            lock_path,
            holder: Mutex::new(None),
        }
    }

    fn release(&self) {
        if let Some((release, handle)) = self.holder.lock().unwrap().take() {
            release.send(()).unwrap();
            handle.join().unwrap();
        }
    }
}

#[async_trait]
impl MirrorAdapter for BusyLedgerThread {
    async fn publish(&self, _content: &str) -> Result<String, MirrorError> {
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let lock_path = self.lock_path.clone();
        let handle = std::thread::spawn(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(lock_path)
                .unwrap();
            let mut lock = fd_lock::RwLock::new(file);
            let _guard = lock.try_write().unwrap();
            held_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        held_rx.recv().unwrap();
        *self.holder.lock().unwrap() = Some((release_tx, handle));
        Ok("555".to_string())
    }

    async fn fetch(&self, remote_id: &str) -> Result<String, MirrorError> {
        Err(MirrorError::NotFound {
            remote_id: remote_id.to_string(),
        })
    }

    async fn update(&self, _remote_id: &str, _content: &str) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn delete(&self, _remote_id: &str) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteComment>, MirrorError> {
        Ok(Vec::new())
    }
}

#[test]
fn reviewer_reports_done_to_orchestrator() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    coord.init_session(None, None, None, "orchestrator").unwrap();
    for agent in ["orchestrator", "opus", "codex"] {
        coord.register_agent(agent, None, BTreeMap::new()).unwrap();
    }

    coord.send("orchestrator", "*", "begin round 1").unwrap();
    coord.set_state("stage", "2", "opus").unwrap();
    let seq = coord.send("opus", "orchestrator", "done").unwrap();

    let last = coord
        .history(&HistoryFilter::involving("orchestrator").last(1))
        .unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].id, seq);
    assert_eq!(last[0].from, "opus");
    assert_eq!(last[0].body, "done");

    let codex_inbox: Vec<_> = coord
        .inbox("codex", 0)
        .unwrap()
        .map(|m| m.unwrap().body)
        .collect();
    assert_eq!(codex_inbox, vec!["begin round 1".to_string()]);

    let status = coord.status().unwrap();
    assert_eq!(status.state["stage"].value, "2");
    assert_eq!(status.state["stage"].updated_by, "opus");
    assert_eq!(status.latest_seq, seq);
    assert_eq!(status.agents.len(), 3);
}

#[test]
fn sending_to_unregistered_agent_is_rejected_without_writing() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    coord.register_agent("orchestrator", None, BTreeMap::new()).unwrap();
    let before = ledger_bytes(&coord);

    let err = coord.send("orchestrator", "gemini", "hello").unwrap_err();
    assert!(matches!(err, DuoError::UnknownAgent(name) if name == "gemini"));
    assert_eq!(ledger_bytes(&coord), before);
}

#[cfg(unix)]
#[test]
fn interrupting_stopped_agent_leaves_ledger_untouched() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    coord.set_state("stage", "2", "orchestrator").unwrap();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    coord.register_agent("opus", Some(pid), BTreeMap::new()).unwrap();
    coord.send("orchestrator", "opus", "review").unwrap();

    let before = ledger_bytes(&coord);
    let err = coord.interrupt("opus").unwrap_err();
    assert!(matches!(
        err,
        DuoError::AgentNotRunning { ref agent, pid: Some(p) } if agent == "opus" && p == pid
    ));
    assert!(err.is_reportable_outcome());
    assert_eq!(ledger_bytes(&coord), before);

    let liveness = coord.is_alive("opus").unwrap();
    assert!(!liveness.alive);
    assert_eq!(liveness.pid, Some(pid));
}

#[cfg(unix)]
#[tokio::test]
async fn following_logs_then_cancelling_mutates_nothing() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    coord.register_agent("codex", Some(std::process::id()), BTreeMap::new()).unwrap();
    let log = coord.log_path("codex").unwrap();
    std::fs::write(&log, "one\ntwo\nthree\n").unwrap();
    let before = ledger_bytes(&coord);

    let cancel = CancellationToken::new();
    let lines = coord
        .tail_logs(
            "codex",
            TailOptions {
                follow: true,
                last: Some(2),
            },
            cancel.clone(),
        )
        .unwrap();
    tokio::pin!(lines);

    let first = lines.next().await.unwrap().unwrap();
    let second = lines.next().await.unwrap().unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("two", "three"));

    cancel.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), lines.next())
        .await
        .expect("stream stops after cancellation");
    assert!(end.is_none());
    assert_eq!(ledger_bytes(&coord), before);
}

#[tokio::test]
async fn status_mirror_tracks_one_comment() {
    let dir = TempDir::new().unwrap();
    let thread = Arc::new(FakeThread::default());
    let coord = coordinator(dir.path()).with_mirror(thread.clone());
    coord.init_session(Some("feature/x".into()), Some("main".into()), None, "orchestrator").unwrap();
    coord.register_agent("opus", None, BTreeMap::new()).unwrap();

    let created = coord.publish_status().await.unwrap();
    assert!(matches!(created, PublishOutcome::Created { .. }));
    let unchanged = coord.publish_status().await.unwrap();
    assert!(matches!(unchanged, PublishOutcome::Unchanged { .. }));

    coord.set_state("stage", "3", "orchestrator").unwrap();
    let updated = coord.publish_status().await.unwrap();
    assert_eq!(updated.remote_id(), created.remote_id());
    assert!(matches!(updated, PublishOutcome::Updated { .. }));

    assert_eq!(thread.calls(), vec!["publish", "update"]);
    let body = coord.mirror_get(created.remote_id()).await.unwrap();
    assert!(body.contains("<!-- duo-status -->"));
    assert!(body.contains("feature/x"));
}

#[tokio::test]
async fn mirror_outage_does_not_block_local_work() {
    let dir = TempDir::new().unwrap();
    let thread = Arc::new(FakeThread {
        fail_publish: true,
        ..FakeThread::default()
    });
    let coord = coordinator(dir.path()).with_mirror(thread.clone());
    coord.register_agent("orchestrator", None, BTreeMap::new()).unwrap();

    assert!(matches!(
        coord.publish_status().await,
        Err(DuoError::Mirror(_))
    ));

    let seq = coord.send("codex", "orchestrator", "still here").unwrap();
    assert_eq!(seq, 1);
    coord.set_state("stage", "2", "codex").unwrap();
    assert_eq!(coord.get_state("stage").unwrap().value, "2");
}

#[test]
fn agent_registered_without_process_is_not_running() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    coord.register_agent("opus", None, BTreeMap::new()).unwrap();
    let before = ledger_bytes(&coord);

    let err = coord.interrupt("opus").unwrap_err();
    assert!(matches!(
        err,
        DuoError::AgentNotRunning { ref agent, pid: None } if agent == "opus"
    ));
    assert!(err.is_reportable_outcome());

    let liveness = coord.is_alive("opus").unwrap();
    assert!(!liveness.alive);
    assert_eq!(liveness.pid, None);

    let err = coord
        .tail_logs("opus", TailOptions::default(), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, DuoError::NotFound(_)));
    assert_eq!(ledger_bytes(&coord), before);

    assert!(matches!(coord.interrupt("gemini"), Err(DuoError::UnknownAgent(_))));
    assert!(matches!(coord.is_alive("gemini"), Err(DuoError::UnknownAgent(_))));
}

#[tokio::test]
async fn published_comment_is_reported_when_its_record_cannot_be_saved() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator_with(dir.path(), |config| {
        config.ledger.lock_timeout_ms = 50;
        config.ledger.lock_retry_ms = 5;
    });
    coord.set_state("stage", "2", "orchestrator").unwrap();
    let thread = Arc::new(BusyLedgerThread::new(coord.ledger().dir().join("ledger.lock")));
    let coord = coord.with_mirror(thread.clone());

    let err = coord.publish_status().await.unwrap_err();
    thread.release();

    assert!(
        matches!(err, DuoError::MirrorRecordNotSaved { ref remote_id, .. } if remote_id == "555"),
        "{err}"
    );
    assert_eq!(err.committed_remote_id(), Some("555"));
    assert!(!err.is_retryable());
    assert!(!err.is_reportable_outcome());
    assert!(coord.ledger().mirror_record("duo-status").unwrap().is_none());
}

#[tokio::test]
async fn watching_stage_reports_each_change_once() {
    let dir = TempDir::new().unwrap();
    let coord = coordinator(dir.path());
    let cancel = CancellationToken::new();
    let stages = coord.watch_state("stage", cancel.clone());
    tokio::pin!(stages);

    let nothing_yet = tokio::time::timeout(Duration::from_millis(60), stages.next()).await;
    assert!(nothing_yet.is_err(), "unset key yields nothing");

    coord.init_session(None, None, None, "orchestrator").unwrap();
    let first = stages.next().await.unwrap().unwrap();
    assert_eq!(first.value, "1");

    coord.set_state("stage", "1", "opus").unwrap();
    let repeat = tokio::time::timeout(Duration::from_millis(60), stages.next()).await;
    assert!(repeat.is_err(), "same value is not reported again");

    coord.set_state("stage", "done", "orchestrator").unwrap();
    let last = stages.next().await.unwrap().unwrap();
    assert_eq!(last.value, "done");
    assert_eq!(last.updated_by, "orchestrator");

    cancel.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), stages.next())
        .await
        .expect("watch stops after cancellation");
    assert!(end.is_none());
}
