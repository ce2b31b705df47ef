//! Durable event sinks.
//!
//! Every backend implements [`EventSink`]: `log_event` persists one event and
//! `close` flushes and finalizes the underlying storage. `close` is idempotent;
//! logging to a closed sink returns [`SinkError::Closed`].
//!
//! # Backends
//!
//! | Backend | Encoding | Durability |
//! |---------|----------|------------|
//! | [`NdjsonSink`] | one JSON object per line | flushed to the OS on every event |
//! | [`ColumnarSink`] | Parquet, one ZSTD row group per batch | readable once closed |
//! | [`QueuedSink`] | wraps either of the above | periodic flush by a background worker |
//!
//! The queued backend never blocks the caller: when its queue is full the
//! event is dropped and counted.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

use crate::types::Event;

pub mod columnar;
pub mod ndjson;
pub mod queued;

pub use columnar::{event_schema, read_columnar, ColumnarSink, DEFAULT_BATCH_ROWS};
pub use ndjson::{read_ndjson, NdjsonSink};
pub use queued::{QueuedSink, DEFAULT_FLUSH_INTERVAL, DEFAULT_QUEUE_CAPACITY};

/// Errors that can occur while persisting events.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Opening, writing, flushing or syncing the output file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event or batch could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink has already been closed.
    #[error("event sink is closed")]
    Closed,

    /// The background writer of a queued sink panicked.
    #[error("event sink worker panicked")]
    WorkerPanicked,

    /// Building an Arrow record batch failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The Parquet writer failed.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// An encoded file could not be decoded.
    #[error("corrupt event file: {0}")]
    Corrupt(String),
}

/// Durable storage for the canonical event stream.
pub trait EventSink: Send + Sync {
    /// Persists one event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] after [`close`](Self::close), or the
    /// write/serialization error for synchronous backends.
    fn log_event(&self, event: Event) -> Result<(), SinkError>;

    /// Pushes any buffered events to storage.
    fn flush(&self) -> Result<(), SinkError>;

    /// Flushes and finalizes storage. Safe to call more than once.
    fn close(&self) -> Result<(), SinkError>;
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn log_event(&self, event: Event) -> Result<(), SinkError> {
        (**self).log_event(event)
    }

    fn flush(&self) -> Result<(), SinkError> {
        (**self).flush()
    }

    fn close(&self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// On-disk encoding of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkFormat {
    /// Newline-delimited JSON.
    Ndjson,
    /// Parquet row groups.
    #[value(alias = "parquet")]
    Columnar,
}

impl SinkFormat {
    /// File name of the event log inside the session data directory.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Ndjson => "events.ndjson",
            Self::Columnar => "events.parquet",
        }
    }
}

/// Queue settings for the asynchronous backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum number of events waiting for the writer.
    pub capacity: usize,
    /// Interval between periodic flushes.
    pub flush_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Everything needed to open an event sink.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub format: SinkFormat,
    pub path: PathBuf,
    /// Rows per columnar batch; ignored for NDJSON.
    pub batch_rows: usize,
    /// When set, writes go through a [`QueuedSink`].
    pub queue: Option<QueueOptions>,
}

/// Opens the sink described by `options`.
///
/// # Errors
///
/// Returns an error if the output file cannot be created or the writer
/// thread cannot be spawned.
pub fn open_sink(options: &SinkOptions) -> Result<Arc<dyn EventSink>, SinkError> {
    let storage: Box<dyn EventSink> = match options.format {
        SinkFormat::Ndjson => Box::new(NdjsonSink::open(&options.path)?),
        SinkFormat::Columnar => Box::new(ColumnarSink::open(&options.path, options.batch_rows)?),
    };

    let sink: Arc<dyn EventSink> = match options.queue {
        Some(queue) => Arc::new(QueuedSink::new(storage, queue.capacity, queue.flush_interval)?),
        None => Arc::from(storage),
    };
    Ok(sink)
}

/// Reads back every event from a file written with `format`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid for `format`.
pub fn read_events(path: &Path, format: SinkFormat) -> Result<Vec<Event>, SinkError> {
    match format {
        SinkFormat::Ndjson => read_ndjson(path),
        SinkFormat::Columnar => read_columnar(path),
    }
}

/// In-memory sink that keeps every event it receives.
///
/// Useful for embedding the normalizer without touching disk.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<Event>,
    closed: bool,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event logged so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for MemorySink {
    fn log_event(&self, event: Event) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.events.push(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&self) -> Result<(), SinkError> {
        self.lock().closed = true;
        Ok(())
    }
}
