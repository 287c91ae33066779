//! Process liveness, interrupts and log tailing for registered agents.
//!
//! Process handles live in `<ledger>/agents/<name>.pid`, beside the ledger rather than
//! inside it, so a probe or an interrupt never takes the ledger lock. Every probe is a
//! fresh observation; nothing here is cached.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::fs;
use std::io::{self, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::validate_agent_name;
use crate::error::{DuoError, Result};

const AGENTS_DIR: &str = "agents";

/// Point-in-time observation of an agent's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub agent: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub observed_at: DateTime<Utc>,
}

impl Liveness {
    /// Observation for an agent that never had a process registered.
    pub fn no_process(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            pid: None,
            alive: false,
            observed_at: Utc::now(),
        }
    }
}

/// Options for [`LivenessMonitor::tail_logs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailOptions {
    /// Keep polling for appended lines until cancelled
    pub follow: bool,
    /// Start with only the last N existing lines
    pub last: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    dir: PathBuf,
    poll_interval: Duration,
}

impl LivenessMonitor {
    /// Monitor for the ledger at `ledger_dir`.
    pub fn new(ledger_dir: &Path, poll_interval: Duration) -> Self {
        Self {
            dir: ledger_dir.join(AGENTS_DIR),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn pid_path(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}.pid"))
    }

    /// Where the agent is expected to write its log.
    pub fn log_path(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}.log"))
    }

    /// Record the process handle for `agent`, replacing any previous one.
    pub fn register(&self, agent: &str, pid: u32) -> Result<()> {
        validate_agent_name(agent)?;
        if pid == 0 {
            return Err(DuoError::Configuration("pid must be a positive integer".into()));
        }

        fs::create_dir_all(&self.dir).map_err(DuoError::storage("creating agents directory"))?;
        let path = self.pid_path(agent);
        let temp_path = self.dir.join(format!(".{agent}.pid.tmp"));

        let written = fs::File::create(&temp_path)
            .and_then(|mut file| {
                writeln!(file, "{pid}")?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&temp_path, &path));

        written.map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            DuoError::storage("writing pid file")(err)
        })?;

        info!(agent, pid, "Agent process registered");
        Ok(())
    }

    /// Probe whether the agent's process is running right now.
    pub fn is_alive(&self, agent: &str) -> Result<Liveness> {
        let pid = self.read_pid(agent)?;
        let alive = process_alive(pid);
        debug!(agent, pid, alive, "Liveness probe");
        Ok(Liveness {
            agent: agent.to_string(),
            pid: Some(pid),
            alive,
            observed_at: Utc::now(),
        })
    }

    /// Send SIGINT to the agent's process and return the pid that was signalled.
    pub fn interrupt(&self, agent: &str) -> Result<u32> {
        let pid = self.read_pid(agent)?;
        if !process_alive(pid) {
            return Err(DuoError::AgentNotRunning {
                agent: agent.to_string(),
                pid: Some(pid),
            });
        }

        send_interrupt(agent, pid)?;
        info!(agent, pid, "Interrupt delivered");
        Ok(pid)
    }

    /// Stream the agent's log lines.
    ///
    /// Without `follow` the stream ends after the existing content. With `follow` it
    /// polls for appended data until `cancel` fires or the stream is dropped. A log
    /// that shrinks is treated as rotated and read again from the start.
    pub fn tail_logs(
        &self,
        agent: &str,
        options: TailOptions,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        let path = self.log_path(agent);
        if !path.exists() {
            // Distinguish "never heard of it" from "registered but silent".
            self.read_pid(agent)?;
            return Err(DuoError::NotFound(format!(
                "log file for agent '{agent}' at {}",
                path.display()
            )));
        }

        let poll_interval = self.poll_interval;
        let agent = agent.to_string();

        Ok(async_stream::stream! {
            let mut cursor = LogCursor::new(path);

            match cursor.read_new(!options.follow).await {
                Ok(lines) => {
                    let skip = options
                        .last
                        .map(|n| lines.len().saturating_sub(n))
                        .unwrap_or(0);
                    for line in lines.into_iter().skip(skip) {
                        yield Ok(line);
                    }
                }
                Err(err) => yield Err(err),
            }

            while options.follow {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(agent = %agent, "Log follow cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                match cursor.read_new(false).await {
                    Ok(lines) => {
                        for line in lines {
                            yield Ok(line);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    fn read_pid(&self, agent: &str) -> Result<u32> {
        let path = self.pid_path(agent);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(DuoError::UnknownAgent(agent.to_string()))
            }
            Err(err) => return Err(DuoError::storage("reading pid file")(err)),
        };

        raw.trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| {
                DuoError::Corrupted(format!("{} does not hold a pid", path.display()))
            })
    }
}

/// Incremental reader over a growing log file.
struct LogCursor {
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
}

impl LogCursor {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            pending: Vec::new(),
        }
    }

    /// Complete lines appended since the last call. With `flush_partial` an
    /// unterminated trailing line is returned too.
    async fn read_new(&mut self, flush_partial: bool) -> Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            // Mid-rotation; try again on the next poll.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DuoError::storage("opening agent log")(err)),
        };

        let len = file
            .metadata()
            .await
            .map_err(DuoError::storage("reading agent log metadata"))?
            .len();
        if len < self.offset {
            warn!(log = %self.path.display(), "Agent log shrank, reading from the start");
            self.offset = 0;
            self.pending.clear();
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(DuoError::storage("seeking agent log"))?;
        let mut chunk = Vec::new();
        file.take(len - self.offset)
            .read_to_end(&mut chunk)
            .await
            .map_err(DuoError::storage("reading agent log"))?;
        self.offset += chunk.len() as u64;
        self.pending.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(decode_line(&raw[..newline]));
        }
        if flush_partial && !self.pending.is_empty() {
            lines.push(decode_line(&self.pending));
            self.pending.clear();
        }
        Ok(lines)
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_defunct(pid),
        // Exists, owned by someone else.
        Err(Errno::EPERM) => !is_defunct(pid),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Zombie or dead per `/proc/<pid>/stat`. The state field follows the parenthesised
/// command name, which may itself contain spaces or parentheses.
#[cfg(target_os = "linux")]
fn is_defunct(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next());
    matches!(state, Some("Z") | Some("X") | Some("x"))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_defunct(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_interrupt(agent: &str, pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| DuoError::SignalDelivery {
        agent: agent.to_string(),
        reason: format!("pid {pid} out of range"),
    })?;

    match kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => Ok(()),
        // Exited between the probe and the signal.
        Err(Errno::ESRCH) => Err(DuoError::AgentNotRunning {
            agent: agent.to_string(),
            pid: Some(pid),
        }),
        Err(errno) => Err(DuoError::SignalDelivery {
            agent: agent.to_string(),
            reason: errno.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_interrupt(agent: &str, _pid: u32) -> Result<()> {
    Err(DuoError::SignalDelivery {
        agent: agent.to_string(),
        reason: "signal delivery is not supported on this platform".into(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    fn monitor(dir: &TempDir) -> LivenessMonitor {
        LivenessMonitor::new(dir.path(), Duration::from_millis(10))
    }

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("sleep is available")
    }

    #[test]
    fn unregistered_agent_is_unknown() {
        let dir = TempDir::new().unwrap();
        let err = monitor(&dir).is_alive("ghost").unwrap_err();
        assert!(matches!(err, DuoError::UnknownAgent(name) if name == "ghost"));
    }

    #[test]
    fn running_process_is_alive_until_interrupted() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        let mut child = spawn_sleeper();
        monitor.register("opus", child.id()).unwrap();

        let probe = monitor.is_alive("opus").unwrap();
        assert!(probe.alive);
        assert_eq!(probe.pid, Some(child.id()));

        assert_eq!(monitor.interrupt("opus").unwrap(), child.id());
        let status = child.wait().unwrap();
        assert!(!status.success());

        assert!(!monitor.is_alive("opus").unwrap().alive);
    }

    #[test]
    fn interrupting_an_exited_agent_reports_not_running() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        monitor.register("codex", pid).unwrap();

        let err = monitor.interrupt("codex").unwrap_err();
        assert!(matches!(
            err,
            DuoError::AgentNotRunning { ref agent, pid: Some(p) } if agent == "codex" && p == pid
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_child_counts_as_dead() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        let mut child = Command::new("true").spawn().unwrap();
        monitor.register("droid", child.id()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while monitor.is_alive("droid").unwrap().alive {
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(20));
        }
        child.wait().unwrap();
    }

    #[test]
    fn register_rejects_unsafe_names_and_zero_pid() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        assert!(monitor.register("../etc", 10).is_err());
        assert!(monitor.register("opus", 0).is_err());
        assert!(!dir.path().join(AGENTS_DIR).join("opus.pid").exists());
    }

    #[tokio::test]
    async fn tail_returns_last_lines_including_unterminated_one() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        monitor.register("opus", std::process::id()).unwrap();
        fs::write(monitor.log_path("opus"), "one\ntwo\nthree\nfour").unwrap();

        let options = TailOptions {
            follow: false,
            last: Some(2),
        };
        let lines: Vec<String> = monitor
            .tail_logs("opus", options, CancellationToken::new())
            .unwrap()
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn tail_without_log_distinguishes_unknown_from_silent() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        let opts = TailOptions::default();

        assert!(matches!(
            monitor.tail_logs("ghost", opts, CancellationToken::new()),
            Err(DuoError::UnknownAgent(_))
        ));

        monitor.register("opus", std::process::id()).unwrap();
        assert!(matches!(
            monitor.tail_logs("opus", opts, CancellationToken::new()),
            Err(DuoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn follow_picks_up_appends_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        monitor.register("opus", std::process::id()).unwrap();
        let log = monitor.log_path("opus");
        fs::write(&log, "booting\n").unwrap();

        let cancel = CancellationToken::new();
        let options = TailOptions {
            follow: true,
            last: None,
        };
        let stream = monitor.tail_logs("opus", options, cancel.clone()).unwrap();
        tokio::pin!(stream);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "booting");

        fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .unwrap()
            .write_all(b"reviewing\n")
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("appended line arrives")
            .unwrap()
            .unwrap();
        assert_eq!(next, "reviewing");

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream ends after cancel");
        assert!(end.is_none());
        assert_eq!(fs::read_to_string(&log).unwrap(), "booting\nreviewing\n");
    }
}
