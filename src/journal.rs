//! Append-only write-ahead journal with a sidecar commit pointer.
//!
//! Layout at a configured path `P`:
//!
//! ```text
//! P         newline-delimited JSON entries {"seq": n, "record": {...}}
//! P.commit  single decimal integer: highest seq durable in the store
//! ```
//!
//! On open the journal compacts: entries with `seq <= committed` are dropped,
//! a torn or malformed trailing line ends the stream cleanly, and the next
//! sequence resumes at `max(max_seq_on_disk, committed) + 1`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::model::LogRecord;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("journal is closed")]
    Closed,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    seq: u64,
    record: &'a LogRecord,
}

#[derive(Deserialize)]
struct Entry {
    seq: u64,
    record: LogRecord,
}

struct Inner {
    file: Option<File>,
    next_seq: u64,
    committed: u64,
}

/// Durable journal. A mutex serializes `append`/`commit`/`close`; `replay`
/// snapshots the committed pointer under the lock and streams the file
/// without holding it.
pub struct Journal {
    path: PathBuf,
    commit_path: PathBuf,
    inner: Mutex<Inner>,
}

impl Journal {
    /// Open (or create) the journal at `path`, running startup compaction.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let commit_path = sidecar_path(&path);
        let committed = read_commit(&commit_path)?;
        let max_seq = compact(&path, committed)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            commit_path,
            inner: Mutex::new(Inner {
                file: Some(file),
                next_seq: max_seq.max(committed) + 1,
                committed,
            }),
        })
    }

    /// Append a record, assigning the next sequence number. The entry is
    /// fsynced before the call returns.
    pub fn append(&self, record: &LogRecord) -> Result<u64, JournalError> {
        let mut inner = self.inner.lock().expect("journal mutex poisoned");
        let seq = inner.next_seq;
        let mut line = serde_json::to_vec(&EntryRef { seq, record })?;
        line.push(b'\n');

        let file = inner.file.as_mut().ok_or(JournalError::Closed)?;
        file.write_all(&line)?;
        file.sync_all()?;

        inner.next_seq = seq + 1;
        Ok(seq)
    }

    /// Record that entries up to `seq` are durable in the store. Idempotent;
    /// a no-op when `seq` does not advance the pointer.
    pub fn commit(&self, seq: u64) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().expect("journal mutex poisoned");
        if seq <= inner.committed {
            return Ok(());
        }
        write_commit(&self.commit_path, seq)?;
        inner.committed = seq;
        Ok(())
    }

    /// Highest committed sequence number.
    pub fn committed(&self) -> u64 {
        self.inner.lock().expect("journal mutex poisoned").committed
    }

    /// Invoke `apply` for every uncommitted entry on disk in sequence order.
    ///
    /// Stops at the first callback error. A malformed or torn trailing line
    /// terminates replay cleanly.
    pub fn replay(
        &self,
        mut apply: impl FnMut(u64, LogRecord) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let committed = self.committed();

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(JournalError::Io(e).into()),
        };

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                break;
            };
            let Ok(entry) = serde_json::from_str::<Entry>(&line) else {
                break;
            };
            if entry.seq <= committed {
                continue;
            }
            apply(entry.seq, entry.record)?;
        }
        Ok(())
    }

    /// Flush and release the file handle. Idempotent.
    pub fn close(&self) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().expect("journal mutex poisoned");
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".commit");
    PathBuf::from(os)
}

fn read_commit(path: &Path) -> Result<u64, JournalError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse().unwrap_or(0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the commit sidecar: write temp, fsync, rename.
fn write_commit(path: &Path, seq: u64) -> Result<(), JournalError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    writeln!(file, "{seq}")?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

/// Stream surviving entries to a temp file, dropping committed ones, and
/// rename it over the journal. Returns the highest sequence seen.
fn compact(path: &Path, committed: u64) -> Result<u64, JournalError> {
    let src = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".compact");
    let tmp = PathBuf::from(tmp);

    let mut out = File::create(&tmp)?;
    let mut max_seq = 0u64;

    for line in BufReader::new(src).lines() {
        let Ok(line) = line else {
            break;
        };
        let Ok(entry) = serde_json::from_str::<Entry>(&line) else {
            break;
        };
        max_seq = max_seq.max(entry.seq);
        if entry.seq <= committed {
            continue;
        }
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
    }

    out.sync_all()?;
    drop(out);
    fs::rename(&tmp, path)?;
    Ok(max_seq)
}
