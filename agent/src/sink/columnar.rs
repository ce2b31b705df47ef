//! Buffered columnar event sink.
//!
//! Rows are accumulated into an in-memory [`ColumnBatch`] and written to a
//! Parquet file as one ZSTD-compressed row group when the batch reaches its
//! row limit, on [`flush`], or on [`close`]. The file footer is written on
//! `close`; until then the file is not readable.
//!
//! # Schema
//!
//! | Column | Arrow type |
//! |--------|------------|
//! | `timestamp` | `Float64` (epoch seconds) |
//! | `eventType` | `Utf8` |
//! | `eventLevel` | `Utf8` |
//! | `content` | `Utf8` |
//! | `value` | `Float64` |
//!
//! [`flush`]: EventSink::flush
//! [`close`]: EventSink::close

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::{debug, trace};

use super::{EventSink, SinkError};
use crate::types::{Event, EventLevel, EventType};

/// Default number of rows per row group.
pub const DEFAULT_BATCH_ROWS: usize = 1024;

/// Arrow schema of the event file.
#[must_use]
pub fn event_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Float64, false),
        Field::new("eventType", DataType::Utf8, false),
        Field::new("eventLevel", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
    ]))
}

/// One batch of events stored column by column.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ColumnBatch {
    pub timestamp: Vec<f64>,
    pub event_type: Vec<EventType>,
    pub event_level: Vec<EventLevel>,
    pub content: Vec<String>,
    pub value: Vec<f64>,
}

impl ColumnBatch {
    fn with_capacity(rows: usize) -> Self {
        Self {
            timestamp: Vec::with_capacity(rows),
            event_type: Vec::with_capacity(rows),
            event_level: Vec::with_capacity(rows),
            content: Vec::with_capacity(rows),
            value: Vec::with_capacity(rows),
        }
    }

    fn push(&mut self, event: Event) {
        self.timestamp.push(event.timestamp);
        self.event_type.push(event.event_type);
        self.event_level.push(event.event_level);
        self.content.push(event.content);
        self.value.push(event.value);
    }

    /// Number of rows in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }

    fn clear(&mut self) {
        self.timestamp.clear();
        self.event_type.clear();
        self.event_level.clear();
        self.content.clear();
        self.value.clear();
    }

    /// Builds an Arrow record batch with [`event_schema`].
    ///
    /// # Errors
    ///
    /// Returns an [`ArrowError`] if the columns disagree in length.
    pub fn to_record_batch(&self, schema: &SchemaRef) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Float64Array::from(self.timestamp.clone())),
            Arc::new(StringArray::from_iter_values(
                self.event_type.iter().map(|t| t.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                self.event_level.iter().map(|l| l.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(&self.content)),
            Arc::new(Float64Array::from(self.value.clone())),
        ];
        RecordBatch::try_new(Arc::clone(schema), columns)
    }
}

struct ColumnarState {
    writer: Option<ArrowWriter<File>>,
    batch: ColumnBatch,
    row_groups: u64,
    rows_written: u64,
}

/// Sink that buffers rows and writes them as Parquet row groups.
pub struct ColumnarSink {
    path: PathBuf,
    batch_rows: usize,
    schema: SchemaRef,
    state: Mutex<ColumnarState>,
}

impl ColumnarSink {
    /// Creates `path` (truncating any previous file) for row groups of up to
    /// `batch_rows` rows. A `batch_rows` of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be created, or
    /// [`SinkError::Parquet`] if the writer cannot be initialized.
    pub fn open(path: &Path, batch_rows: usize) -> Result<Self, SinkError> {
        let batch_rows = batch_rows.max(1);
        let schema = event_schema();

        let properties = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .set_max_row_group_size(batch_rows)
            .build();
        let file = File::create(path)?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(properties))?;
        debug!(path = %path.display(), batch_rows, "Opened columnar event sink");

        Ok(Self {
            path: path.to_path_buf(),
            batch_rows,
            schema,
            state: Mutex::new(ColumnarState {
                writer: Some(writer),
                batch: ColumnBatch::with_capacity(batch_rows),
                row_groups: 0,
                rows_written: 0,
            }),
        })
    }

    /// Returns the number of rows currently buffered.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.lock().batch.len()
    }

    /// Returns the number of rows handed to the Parquet writer.
    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.lock().rows_written
    }

    /// Returns the number of row groups written so far.
    #[must_use]
    pub fn row_groups(&self) -> u64 {
        self.lock().row_groups
    }

    fn lock(&self) -> MutexGuard<'_, ColumnarState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ColumnarState {
    /// Writes the pending batch as one row group. The batch is only cleared
    /// once the writer has accepted it.
    fn write_pending(&mut self, schema: &SchemaRef) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let record_batch = self.batch.to_record_batch(schema)?;
        writer.write(&record_batch)?;
        writer.flush()?;

        let rows = self.batch.len();
        trace!(rows, "Wrote row group");
        self.batch.clear();
        self.row_groups += 1;
        self.rows_written += rows as u64;
        Ok(())
    }
}

impl EventSink for ColumnarSink {
    fn log_event(&self, event: Event) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.writer.is_none() {
            return Err(SinkError::Closed);
        }

        state.batch.push(event);
        if state.batch.len() >= self.batch_rows {
            state.write_pending(&self.schema)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.writer.is_none() {
            return Ok(());
        }
        state.write_pending(&self.schema)
    }

    fn close(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.writer.is_none() {
            return Ok(());
        }

        state.write_pending(&self.schema)?;
        if let Some(writer) = state.writer.take() {
            // Writes the footer.
            let file = writer.into_inner()?;
            file.sync_all()?;
        }

        debug!(
            path = %self.path.display(),
            row_groups = state.row_groups,
            rows = state.rows_written,
            "Closed columnar event sink"
        );
        Ok(())
    }
}

/// Reads every event from a Parquet event file.
///
/// # Errors
///
/// Returns [`SinkError::Corrupt`] if the file is not valid Parquet, a column
/// is missing or mistyped, or a row holds an unknown type or level.
pub fn read_columnar(path: &Path) -> Result<Vec<Event>, SinkError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| SinkError::Corrupt(e.to_string()))?;

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| SinkError::Corrupt(e.to_string()))?;
        append_events(&batch, &mut events)?;
    }
    Ok(events)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, SinkError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<T>())
        .ok_or_else(|| SinkError::Corrupt(format!("missing or mistyped column {name}")))
}

fn append_events(batch: &RecordBatch, events: &mut Vec<Event>) -> Result<(), SinkError> {
    let timestamp = column::<Float64Array>(batch, "timestamp")?;
    let event_type = column::<StringArray>(batch, "eventType")?;
    let event_level = column::<StringArray>(batch, "eventLevel")?;
    let content = column::<StringArray>(batch, "content")?;
    let value = column::<Float64Array>(batch, "value")?;

    for row in 0..batch.num_rows() {
        let type_name = event_type.value(row);
        let level_name = event_level.value(row);
        events.push(Event {
            timestamp: timestamp.value(row),
            event_type: EventType::from_name(type_name)
                .ok_or_else(|| SinkError::Corrupt(format!("unknown event type {type_name:?}")))?,
            event_level: EventLevel::from_name(level_name)
                .ok_or_else(|| SinkError::Corrupt(format!("unknown event level {level_name:?}")))?,
            content: content.value(row).to_string(),
            value: value.value(row),
        });
    }
    Ok(())
}
