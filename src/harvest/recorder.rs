//! Deduplicating, batched persistence of feed records.
//!
//! [`Recorder`] owns the seen-identity set and the in-memory batch; the
//! [`RecordSink`] it writes to only ever sees appends of whole batches.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::harvest::traits::{RecordSink, SinkError, RECORD_COLUMNS};
use crate::model::FeedRecord;

/// Outcome of [`Recorder::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Identity already seen; nothing changed.
    Duplicate,
    /// Added to the pending batch.
    Buffered,
    /// Added, and the batch of this many rows was appended to the sink.
    Flushed(usize),
    /// Added, but appending the full batch failed; rows stay pending.
    Deferred,
}

pub struct Recorder<S: RecordSink> {
    sink: S,
    batch_size: usize,
    seen: HashSet<String>,
    pending: Vec<FeedRecord>,
    stored: usize,
}

impl<S: RecordSink> Recorder<S> {
    pub fn new(sink: S, batch_size: usize) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            seen: HashSet::new(),
            pending: Vec::new(),
            stored: 0,
        }
    }

    /// Creates the sink and writes its header row.
    pub fn begin(&mut self) -> Result<(), SinkError> {
        self.sink.create_with_header()
    }

    pub fn accept(&mut self, record: FeedRecord) -> Acceptance {
        if !self.seen.insert(record.identity.clone()) {
            debug!(identity = %record.identity, "Duplicate record ignored");
            return Acceptance::Duplicate;
        }
        self.pending.push(record);

        if self.pending.len() < self.batch_size {
            return Acceptance::Buffered;
        }
        match self.flush() {
            Ok(rows) => Acceptance::Flushed(rows),
            Err(e) => {
                warn!(pending = self.pending.len(), error = %e, "Batch append failed, keeping rows");
                Acceptance::Deferred
            }
        }
    }

    /// Appends whatever is pending. On error the rows stay pending.
    pub fn flush(&mut self) -> Result<usize, SinkError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.sink.append(&self.pending)?;
        let rows = self.pending.len();
        self.stored += rows;
        self.pending.clear();
        debug!(rows, stored = self.stored, "Batch appended");
        Ok(rows)
    }

    /// Rows successfully appended to the sink.
    pub fn stored(&self) -> usize {
        self.stored
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Distinct identities accepted so far.
    pub fn accepted(&self) -> usize {
        self.seen.len()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

fn row(record: &FeedRecord) -> [String; 5] {
    [
        record.date.clone(),
        record.time.clone(),
        record.event_type.clone(),
        record.content.clone(),
        record.image_count().to_string(),
    ]
}

// ============================================================================
// CSV Sink
// ============================================================================

/// Comma-separated file with a header row.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    created: bool,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for CsvSink {
    fn create_with_header(&mut self) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_writer(File::create(&self.path)?);
        writer.write_record(RECORD_COLUMNS)?;
        writer.flush()?;
        self.created = true;
        Ok(())
    }

    fn append(&mut self, rows: &[FeedRecord]) -> Result<(), SinkError> {
        if !self.created {
            return Err(SinkError::NotInitialized);
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for record in rows {
            writer.write_record(row(record))?;
        }
        writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Memory Sink
// ============================================================================

#[derive(Debug, Default)]
struct MemorySinkState {
    created: bool,
    batches: Vec<Vec<FeedRecord>>,
    failures_remaining: usize,
}

/// Keeps appended batches in memory. Clones share the same storage, so a
/// test can hand one clone to a [`Recorder`] and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` appends fail.
    pub fn failing(self, count: usize) -> Self {
        self.lock().failures_remaining = count;
        self
    }

    pub fn batches(&self) -> Vec<Vec<FeedRecord>> {
        self.lock().batches.clone()
    }

    pub fn records(&self) -> Vec<FeedRecord> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    pub fn is_created(&self) -> bool {
        self.lock().created
    }

    fn lock(&self) -> MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordSink for MemorySink {
    fn create_with_header(&mut self) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.created = true;
        state.batches.clear();
        Ok(())
    }

    fn append(&mut self, rows: &[FeedRecord]) -> Result<(), SinkError> {
        let mut state = self.lock();
        if !state.created {
            return Err(SinkError::NotInitialized);
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SinkError::Io(std::io::Error::other("injected append failure")));
        }
        state.batches.push(rows.to_vec());
        Ok(())
    }
}
