//! Bounded-queue asynchronous event sink.
//!
//! [`QueuedSink`] wraps a synchronous sink with a fixed-capacity queue and a
//! single writer thread. `log_event` never blocks: when the queue is full the
//! event is dropped and counted. The writer flushes the inner sink on a fixed
//! tick whether or not events are arriving.
//!
//! On [`close`](EventSink::close) the queue is disconnected, the writer drains
//! everything already enqueued, performs a final flush and closes the inner
//! sink, and only then does `close` return.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use super::{EventSink, SinkError};
use crate::types::Event;

/// Default number of events the queue can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Default interval between periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Asynchronous sink with a bounded queue in front of a synchronous backend.
pub struct QueuedSink {
    tx: RwLock<Option<Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<Result<(), SinkError>>>>,
    dropped: AtomicU64,
}

impl QueuedSink {
    /// Starts the writer thread for `inner`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the writer thread cannot be spawned.
    pub fn new(
        inner: Box<dyn EventSink>,
        capacity: usize,
        flush_interval: Duration,
    ) -> Result<Self, SinkError> {
        let (tx, rx) = bounded(capacity.max(1));

        let worker = thread::Builder::new()
            .name("event-sink-writer".to_string())
            .spawn(move || run_writer(inner.as_ref(), &rx, flush_interval))?;

        debug!(
            capacity,
            flush_interval_ms = flush_interval.as_millis() as u64,
            "Started queued event sink"
        );

        Ok(Self {
            tx: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Returns how many events were dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn run_writer(inner: &dyn EventSink, rx: &Receiver<Event>, flush_interval: Duration) -> Result<(), SinkError> {
    let ticker = tick(flush_interval);

    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(event) => {
                    if let Err(e) = inner.log_event(event) {
                        error!(error = %e, "Failed to write queued event");
                    }
                }
                // Every sender is gone and the queue is drained.
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Err(e) = inner.flush() {
                    warn!(error = %e, "Periodic event sink flush failed");
                }
            }
        }
    }

    if let Err(e) = inner.flush() {
        error!(error = %e, "Final event sink flush failed");
    }
    inner.close()
}

impl EventSink for QueuedSink {
    fn log_event(&self, event: Event) -> Result<(), SinkError> {
        let guard = self.tx.read().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;

        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "Event queue full, dropping events");
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Closed),
        }
    }

    /// Flushing is owned by the writer thread's tick.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&self) -> Result<(), SinkError> {
        // Dropping the only sender disconnects the queue once it is drained.
        drop(self.tx.write().unwrap_or_else(PoisonError::into_inner).take());

        // Held across the join: a concurrent close returns only once the
        // inner sink has been finalized.
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else {
            return Ok(());
        };

        let result = handle.join().map_err(|_| SinkError::WorkerPanicked)?;
        let dropped = self.dropped_count();
        if dropped > 0 {
            warn!(dropped, "Event sink closed after dropping events");
        }
        debug!("Queued event sink closed");
        result
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close queued event sink");
        }
    }
}
