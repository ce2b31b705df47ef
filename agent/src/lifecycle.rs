//! Session lifecycle.
//!
//! [`Agent`] wires the components together, starts them in order and tears
//! them down in one fixed sequence.
//!
//! # Startup
//!
//! 1. The diagnostic log is already open (the caller installs it as a
//!    tracing writer before anything else logs).
//! 2. Session metadata is collected.
//! 3. The event sink is opened.
//! 4. The capture process is started and the start marker is recorded.
//! 5. Producers start: the input dispatcher and the console listener.
//! 6. The session is registered and the periodic upload scan starts.
//!
//! A failure after step 3 aborts: cancellation is signalled, the capture
//! process is stopped, and the sink and diagnostic log are closed.
//!
//! # Shutdown
//!
//! 1. Signal cancellation and wait for producers to stop.
//! 2. Close the event sink.
//! 3. Upload every remaining file except the diagnostic log, and wait.
//! 4. Close the diagnostic log.
//! 5. Upload the diagnostic log.
//! 6. Wait for that upload.
//!
//! The diagnostic log therefore contains the record of every other upload.

use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::console::spawn_console_listener;
use crate::diagnostics::DiagnosticLog;
use crate::error::{AgentError, Result};
use crate::normalizer::{spawn_dispatcher, Normalizer};
use crate::recorder::Recorder;
use crate::sink::{open_sink, EventSink};
use crate::types::{RawSignal, SessionInfo};
use crate::uploader::UploadTracker;
use crate::utils::ShutdownSignal;

/// Capacity of the channel between input adapters and the dispatcher.
const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// Source of console lines, usually the agent's stdin.
pub type ConsoleInput = Box<dyn AsyncRead + Unpin + Send>;

/// Creates the output directory and an empty session data directory.
///
/// Anything left in the data directory by an earlier run is removed so it
/// is not uploaded under the new session.
///
/// # Errors
///
/// Returns an error if a directory cannot be created or an entry cannot be
/// removed.
pub fn prepare_data_dir(config: &Config) -> io::Result<()> {
    fs::create_dir_all(&config.out_dir)?;
    fs::create_dir_all(&config.data_dir)?;
    wipe_dir(&config.data_dir)
}

fn wipe_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// A running session.
pub struct Agent<R: Recorder> {
    shutdown: ShutdownSignal,
    sink: Arc<dyn EventSink>,
    diagnostics: DiagnosticLog,
    uploader: Arc<UploadTracker>,
    recorder: R,
    signals: Option<mpsc::Sender<RawSignal>>,
    producers: Vec<(&'static str, JoinHandle<u64>)>,
    scanner: Option<JoinHandle<()>>,
}

impl<R: Recorder> Agent<R> {
    /// Starts every component in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be opened, the capture process
    /// fails to start, or the session cannot be registered. Components that
    /// were already started are stopped before returning.
    pub async fn start(
        config: &Config,
        diagnostics: DiagnosticLog,
        recorder: R,
        console: Option<ConsoleInput>,
    ) -> Result<Self> {
        info!(
            path = %diagnostics.path().display(),
            session_id = %config.session_id,
            "Diagnostic log opened"
        );

        let session = SessionInfo::collect(
            config.app_name.clone(),
            config.app_version.clone(),
            config.tags.clone(),
        );
        info!(
            app_name = %session.app_name,
            app_version = %session.app_version,
            tags = ?session.tags,
            os = %session.os,
            hostname = %session.hostname,
            "Session metadata collected"
        );

        let prepared = UploadTracker::new(config.upload_settings())
            .map_err(AgentError::from)
            .and_then(|uploader| Ok((uploader, open_sink(&config.sink)?)));
        let (uploader, sink) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Startup failed");
                close_diagnostics(&diagnostics);
                return Err(e);
            }
        };
        info!(path = %config.sink.path.display(), format = ?config.sink.format, "Event sink opened");

        let mut agent = Self {
            shutdown: ShutdownSignal::new(),
            sink,
            diagnostics,
            uploader: Arc::new(uploader),
            recorder,
            signals: None,
            producers: Vec::new(),
            scanner: None,
        };

        if let Err(e) = agent.launch(config, &session, console).await {
            error!(error = %e, "Startup failed");
            agent.abort().await;
            return Err(e);
        }

        info!("Agent running");
        Ok(agent)
    }

    async fn launch(
        &mut self,
        config: &Config,
        session: &SessionInfo,
        console: Option<ConsoleInput>,
    ) -> Result<()> {
        self.recorder.start()?;
        self.recorder.notify_started(self.sink.as_ref())?;
        info!("Capture process started");

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        self.signals = Some(tx);
        self.producers.push((
            "input dispatcher",
            spawn_dispatcher(
                Normalizer::new(config.analog_threshold),
                rx,
                Arc::clone(&self.sink),
                self.shutdown.clone(),
            ),
        ));

        if let Some(input) = console {
            self.producers.push((
                "console listener",
                spawn_console_listener(input, Arc::clone(&self.sink), self.shutdown.clone()),
            ));
        }

        self.uploader.register_session(session).await?;
        self.scanner = Some(spawn_upload_scan(
            Arc::clone(&self.uploader),
            config.poll_interval,
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Returns a sender through which input adapters deliver device signals,
    /// or `None` once shutdown has begun.
    #[must_use]
    pub fn signal_sender(&self) -> Option<mpsc::Sender<RawSignal>> {
        self.signals.clone()
    }

    /// Returns the shared event sink.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Returns the upload tracker.
    #[must_use]
    pub fn uploader(&self) -> &Arc<UploadTracker> {
        &self.uploader
    }

    /// Runs until the capture process exits or `stop` resolves, whichever
    /// happens first. In the latter case the capture process is stopped.
    pub async fn run_until<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.recorder.wait() => match result {
                Ok(()) => info!("Capture process exited normally"),
                Err(e) => warn!(error = %e, "Capture process exited with error"),
            },
            () = stop => {
                info!("Shutdown signal received");
                if let Err(e) = self.recorder.stop().await {
                    warn!(error = %e, "Failed to stop capture process");
                }
            }
        }
    }

    /// Runs the shutdown sequence.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first error from closing the sink or the diagnostic log.
    /// Upload failures are logged only.
    pub async fn shutdown(mut self) -> Result<()> {
        let mut first_error: Option<AgentError> = None;

        // 1. Cancellation. No producer writes after this returns.
        info!("Shutting down");
        self.stop_producers().await;
        if let Err(e) = self.recorder.stop().await {
            warn!(error = %e, "Failed to stop capture process");
        }

        // 2. Finalize the event file.
        match self.sink.close() {
            Ok(()) => info!("Event sink closed"),
            Err(e) => {
                error!(error = %e, "Failed to close event sink");
                first_error.get_or_insert(e.into());
            }
        }

        // 3. Everything except the diagnostic log. Scan uploads still in
        // flight settle first so a failed one is scheduled again here.
        info!("Uploading remaining files");
        let scheduled = self
            .uploader
            .upload_all_remaining(self.diagnostics.path())
            .await;
        let joined = self.uploader.wait_for_uploads().await;
        info!(scheduled, joined, "Remaining uploads finished");

        // 4. Nothing reaches the file after this.
        info!("Closing diagnostic log");
        if let Err(e) = self.diagnostics.close() {
            error!(error = %e, "Failed to close diagnostic log");
            first_error.get_or_insert(e.into());
        }

        // 5 and 6.
        if self.uploader.schedule_upload(self.diagnostics.path()) {
            self.uploader.wait_for_uploads().await;
        }
        if self.uploader.is_uploaded(self.diagnostics.path()) {
            debug!("Diagnostic log uploaded");
        } else {
            warn!(path = %self.diagnostics.path().display(), "Diagnostic log was not uploaded");
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Tears down after a failed startup without uploading anything.
    async fn abort(&mut self) {
        self.stop_producers().await;
        if let Err(e) = self.recorder.stop().await {
            warn!(error = %e, "Failed to stop capture process");
        }
        if let Err(e) = self.sink.close() {
            error!(error = %e, "Failed to close event sink");
        }
        close_diagnostics(&self.diagnostics);
    }

    async fn stop_producers(&mut self) {
        self.shutdown.trigger();
        self.signals = None;

        for (name, handle) in self.producers.drain(..) {
            match handle.await {
                Ok(events) => debug!(producer = name, events, "Producer stopped"),
                Err(e) => error!(producer = name, error = %e, "Producer task failed"),
            }
        }
        if let Some(scanner) = self.scanner.take() {
            if let Err(e) = scanner.await {
                error!(error = %e, "Upload scan task failed");
            }
        }
    }
}

fn close_diagnostics(diagnostics: &DiagnosticLog) {
    if let Err(e) = diagnostics.close() {
        error!(error = %e, "Failed to close diagnostic log");
    }
}

/// Spawns the periodic segment scan. The first scan happens one `interval`
/// after start; no scan is scheduled after cancellation.
fn spawn_upload_scan(
    uploader: Arc<UploadTracker>,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Upload scan started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    uploader.scan_and_upload_segments();
                }
            }
        }
        info!("Upload scan stopped");
    })
}
