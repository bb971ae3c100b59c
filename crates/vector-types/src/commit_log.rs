//! Commit log collaborator.
//!
//! The graph appends one record per structural mutation. On restart the
//! records written since the last snapshot are replayed in order.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::VectorId;

/// A single graph mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CommitOp {
    /// Node inserted at `level`; the vector is re-fetched on replay.
    Insert { id: VectorId, level: usize },
    /// Nodes tombstoned.
    Delete { ids: Vec<VectorId> },
    /// Tombstoned nodes physically removed by a cleanup pass.
    Cleanup { ids: Vec<VectorId> },
    /// Graph switched to compressed mode; the codebook blob lives in the store.
    Compress { segments: usize, centroids: usize },
}

/// Append-only record of graph mutations.
pub trait CommitLog: Send + Sync {
    fn append(&self, op: CommitOp) -> Result<(), StoreError>;

    /// All records since the last truncate, oldest first.
    fn replay(&self) -> Result<Vec<CommitOp>, StoreError>;

    /// Drop every record. Called once a snapshot covering them is durable.
    fn truncate(&self) -> Result<(), StoreError>;
}

/// Discards everything. For tests and indexes rebuilt from the source of truth.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommitLog;

impl CommitLog for NoopCommitLog {
    fn append(&self, _op: CommitOp) -> Result<(), StoreError> {
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CommitOp>, StoreError> {
        Ok(Vec::new())
    }

    fn truncate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryCommitLog {
    ops: Mutex<Vec<CommitOp>>,
}

impl InMemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitLog for InMemoryCommitLog {
    fn append(&self, op: CommitOp) -> Result<(), StoreError> {
        self.ops.lock().push(op);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CommitOp>, StoreError> {
        Ok(self.ops.lock().clone())
    }

    fn truncate(&self) -> Result<(), StoreError> {
        self.ops.lock().clear();
        Ok(())
    }
}

/// JSON-lines file log.
///
/// A torn final line (crash mid-append) is cut off when the log is opened
/// and ignored on replay; a malformed line anywhere else is reported as a
/// serialization error.
#[derive(Debug)]
pub struct FileCommitLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileCommitLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        repair_tail(&path, &file)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Make the log end on a record boundary before anything is appended.
///
/// An unterminated tail that still parses is kept and terminated; anything
/// else after the last newline is truncated away.
fn repair_tail(path: &Path, file: &File) -> Result<(), StoreError> {
    let bytes = fs::read(path)?;
    let start = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let tail = &bytes[start..];
    if tail.iter().all(u8::is_ascii_whitespace) {
        if !tail.is_empty() {
            file.set_len(start as u64)?;
        }
        return Ok(());
    }

    if serde_json::from_slice::<CommitOp>(tail).is_ok() {
        let mut file = file;
        file.write_all(b"\n")?;
        file.flush()?;
        debug!(path = ?path, "Terminated unterminated commit log record");
    } else {
        warn!(path = ?path, offset = start, bytes = tail.len(), "Truncating torn commit log tail");
        file.set_len(start as u64)?;
    }
    Ok(())
}

impl CommitLog for FileCommitLog {
    fn append(&self, op: CommitOp) -> Result<(), StoreError> {
        let line = serde_json::to_string(&op)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CommitOp>, StoreError> {
        // Flush first so replay sees everything appended through this handle
        self.writer.lock().flush()?;

        let file = File::open(&self.path)?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut ops = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CommitOp>(line) {
                Ok(op) => ops.push(op),
                Err(e) if i == last => {
                    warn!(path = ?self.path, error = %e, "Ignoring torn commit log tail");
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(path = ?self.path, ops = ops.len(), "Replayed commit log");
        Ok(ops)
    }

    fn truncate(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().set_len(0)?;
        Ok(())
    }
}
