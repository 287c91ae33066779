use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::types::{Message, Recipient};
use crate::error::{DuoError, Result};

const SCAN_CHUNK: u64 = 4096;

/// Append-only JSON-lines log of messages.
///
/// A record is committed once its terminating newline is on disk. Anything after the
/// last newline is a torn append from a crashed writer: readers never see it, and the
/// next writer truncates it before appending, so sequence numbers stay gapless.
#[derive(Debug, Clone)]
pub(crate) struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message. Caller must hold the exclusive ledger lock.
    pub fn append(&self, from: &str, to: &Recipient, body: &str) -> Result<Message> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(DuoError::storage("opening message log"))?;

        let len = file
            .metadata()
            .map_err(DuoError::storage("reading message log metadata"))?
            .len();
        let committed = committed_len(&mut file, len)?;
        if committed < len {
            warn!(
                log = %self.path.display(),
                discarded_bytes = len - committed,
                "Discarding torn tail left by an interrupted append"
            );
            file.set_len(committed)
                .map_err(DuoError::storage("truncating torn message log tail"))?;
        }

        let message = Message {
            id: last_committed_id(&mut file, committed)? + 1,
            from: from.to_string(),
            to: to.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
        };

        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let written = file
            .seek(SeekFrom::Start(committed))
            .and_then(|_| file.write_all(&line))
            .and_then(|_| file.sync_data());
        if let Err(err) = written {
            // Roll back to the committed extent so the number is not consumed.
            let operation = if roll_back(&file, committed, &self.path) {
                "appending message"
            } else {
                "appending message (rollback failed, the message may still become visible)"
            };
            return Err(DuoError::storage(operation)(err));
        }

        Ok(message)
    }

    /// Highest committed sequence number, 0 when the log is empty or absent.
    /// Caller must hold at least a shared ledger lock.
    pub fn latest_id(&self) -> Result<u64> {
        match self.open_for_read()? {
            Some(mut file) => {
                let len = file
                    .metadata()
                    .map_err(DuoError::storage("reading message log metadata"))?
                    .len();
                let committed = committed_len(&mut file, len)?;
                last_committed_id(&mut file, committed)
            }
            None => Ok(0),
        }
    }

    /// Snapshot the committed extent and return a lazy iterator over it.
    /// Caller must hold at least a shared ledger lock while this runs; the iterator
    /// itself needs no lock because the committed prefix never changes.
    pub fn snapshot(&self, since: u64, recipient: Option<String>) -> Result<MessageIter> {
        let reader = match self.open_for_read()? {
            Some(mut file) => {
                let len = file
                    .metadata()
                    .map_err(DuoError::storage("reading message log metadata"))?
                    .len();
                let committed = committed_len(&mut file, len)?;
                file.seek(SeekFrom::Start(0))
                    .map_err(DuoError::storage("rewinding message log"))?;
                Some(BufReader::new(file).take(committed))
            }
            None => None,
        };

        Ok(MessageIter {
            reader,
            since,
            recipient,
            last_seen: since,
            line: String::new(),
        })
    }

    fn open_for_read(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DuoError::storage("opening message log")(err)),
        }
    }
}

/// Truncate back to `committed`; false when the file could not be shortened.
fn roll_back(file: &File, committed: u64, path: &Path) -> bool {
    match file.set_len(committed) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                log = %path.display(),
                committed,
                error = %err,
                "Could not roll back a failed append"
            );
            false
        }
    }
}

/// Finite, ascending, restartable sequence of committed messages.
///
/// Restart by asking the ledger again with `since = iter.last_seen()`.
#[derive(Debug)]
pub struct MessageIter {
    reader: Option<Take<BufReader<File>>>,
    since: u64,
    recipient: Option<String>,
    last_seen: u64,
    line: String,
}

impl MessageIter {
    /// Highest sequence number yielded so far (or the starting cursor).
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

impl Iterator for MessageIter {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            self.line.clear();
            match reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.reader = None;
                    return Some(Err(DuoError::storage("reading message log")(err)));
                }
            }

            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            let message: Message = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    self.reader = None;
                    return Some(Err(err.into()));
                }
            };

            if message.id <= self.since {
                continue;
            }
            self.last_seen = message.id;

            if let Some(agent) = &self.recipient {
                if !message.to.reaches(agent) {
                    continue;
                }
            }
            return Some(Ok(message));
        }
    }
}

/// Byte length of the committed prefix: everything up to and including the last newline.
fn committed_len(file: &mut File, len: u64) -> Result<u64> {
    Ok(find_newline_before(file, len)?.map(|pos| pos + 1).unwrap_or(0))
}

/// Parse the id of the last committed record (0 if none).
fn last_committed_id(file: &mut File, committed: u64) -> Result<u64> {
    if committed == 0 {
        return Ok(0);
    }
    let end = committed - 1; // position of the terminating newline
    let start = find_newline_before(file, end)?.map(|pos| pos + 1).unwrap_or(0);

    let mut buf = vec![0u8; (end - start) as usize];
    file.seek(SeekFrom::Start(start))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(DuoError::storage("reading last message"))?;

    let message: Message = serde_json::from_slice(&buf).map_err(|err| {
        DuoError::Corrupted(format!("last committed message at byte {start}: {err}"))
    })?;
    Ok(message.id)
}

/// Position of the last `\n` strictly before byte `before`, scanning backwards in chunks.
fn find_newline_before(file: &mut File, before: u64) -> Result<Option<u64>> {
    let mut end = before;
    let mut buf = vec![0u8; SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(chunk))
            .map_err(DuoError::storage("scanning message log"))?;
        if let Some(idx) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(Some(start + idx as u64));
        }
        end = start;
    }
    Ok(None)
}
