use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::sync::PassReport;

const JOURNAL_FILE: &str = "geocode-events.jsonl";
const ROTATED_FILE: &str = "geocode-events.1.jsonl";

/// What the sync loop reports to the journal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    PassCompleted(PassReport),
    PassSkipped { table_id: String },
}

#[derive(Debug, Serialize)]
struct JournalEntry {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: JournalEvent,
}

/// Sync outcomes, held in memory until a batch fills and then appended as
/// JSON lines. The file rolls over to a single `.1` generation when full.
#[derive(Clone)]
pub struct SyncJournal {
    enabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<JournalEntry>>>,
    path: PathBuf,
    batch_size: usize,
    max_bytes: u64,
}

impl SyncJournal {
    pub fn open<P: AsRef<Path>>(dir: P, config: &AppConfig) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled)),
            pending: Arc::new(Mutex::new(Vec::new())),
            path,
            batch_size: config.telemetry_batch_size.max(1),
            max_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn append(&self, event: JournalEvent) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut pending = self.pending.lock();
        pending.push(JournalEntry {
            at: Utc::now(),
            event,
        });
        if pending.len() < self.batch_size {
            return Ok(());
        }
        self.write_pending(&mut pending)
    }

    pub fn flush(&self) -> AppResult<()> {
        self.write_pending(&mut self.pending.lock())
    }

    /// Entries accepted but not yet on disk.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    // On error the entries stay pending and go out with the next write.
    fn write_pending(&self, pending: &mut Vec<JournalEntry>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for entry in pending.iter() {
            serde_json::to_writer(&mut lines, entry)?;
            lines.push(b'\n');
        }

        let existing = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if existing > 0 && existing + lines.len() as u64 > self.max_bytes {
            fs::rename(&self.path, self.path.with_file_name(ROTATED_FILE))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(&lines)?;
        pending.clear();
        Ok(())
    }
}
