//! Newline-delimited JSON event sink.
//!
//! Each event is written as one JSON object followed by `\n` and pushed to
//! the operating system before `log_event` returns, so a crash loses at most
//! the event being written.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{EventSink, SinkError};
use crate::types::Event;

/// Synchronous sink writing one JSON object per line.
#[derive(Debug)]
pub struct NdjsonSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl NdjsonSink {
    /// Opens (or creates) `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "Opened NDJSON event sink");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Returns the path of the output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for NdjsonSink {
    fn log_event(&self, event: Event) -> Result<(), SinkError> {
        let line = serde_json::to_vec(&event)?;

        let mut guard = self.lock();
        let writer = guard.as_mut().ok_or(SinkError::Closed)?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        match self.lock().as_mut() {
            Some(writer) => Ok(writer.flush()?),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), SinkError> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!(path = %self.path.display(), "Closed NDJSON event sink");
        Ok(())
    }
}

/// Reads every event from an NDJSON file. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`SinkError::Corrupt`] naming the first line that is not a valid
/// event.
pub fn read_ndjson(path: &Path) -> Result<Vec<Event>, SinkError> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .map_err(|e| SinkError::Corrupt(format!("line {}: {e}", index + 1)))?;
        events.push(event);
    }

    Ok(events)
}
