//! Capture process supervision.
//!
//! The agent does not encode video itself. It runs a capture program for the
//! duration of the session and uploads whatever segments that program writes
//! into the data directory. [`Recorder`] is the seam the lifecycle drives;
//! [`CaptureProcess`] is the subprocess-backed implementation.

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RecorderCommand;
use crate::sink::{EventSink, SinkError};
use crate::types::Event;

/// Errors that can occur while running the capture process.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// The program could not be spawned.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// `start` was called twice.
    #[error("capture process already started")]
    AlreadyStarted,

    /// `wait` was called before `start`.
    #[error("capture process not started")]
    NotStarted,

    /// The program exited unsuccessfully.
    #[error("capture process exited with {0}")]
    Exited(ExitStatus),

    /// Waiting on or signalling the process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The start marker could not be written.
    #[error("failed to record start event: {0}")]
    Sink(#[from] SinkError),
}

/// A process that records the session while the agent runs.
pub trait Recorder: Send {
    /// Starts recording. Only the first call can succeed.
    fn start(&mut self) -> Result<(), RecorderError>;

    /// Resolves when recording ends on its own. Cancel-safe.
    fn wait(&mut self) -> impl Future<Output = Result<(), RecorderError>> + Send;

    /// Ends recording early, for example on a shutdown signal.
    fn stop(&mut self) -> impl Future<Output = Result<(), RecorderError>> + Send;

    /// Writes the `RECORDING_STARTED` marker to `sink`.
    fn notify_started(&self, sink: &dyn EventSink) -> Result<(), RecorderError> {
        sink.log_event(Event::recording_started())?;
        Ok(())
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Running {
        child: Child,
        pipes: Vec<JoinHandle<()>>,
    },
    Finished,
}

/// Recorder backed by a child process.
///
/// Standard output is logged line by line at INFO and standard error at
/// WARN. The child is killed if the handle is dropped while it runs.
#[derive(Debug)]
pub struct CaptureProcess {
    program: String,
    args: Vec<String>,
    state: State,
}

impl CaptureProcess {
    /// Prepares `command`, replacing `{title}` and `{dir}` in its arguments.
    #[must_use]
    pub fn new(command: &RecorderCommand, title: &str, dir: &Path) -> Self {
        let dir = dir.display().to_string();
        let args = command
            .args
            .iter()
            .map(|arg| arg.replace("{title}", title).replace("{dir}", &dir))
            .collect();

        Self {
            program: command.program.clone(),
            args,
            state: State::Idle,
        }
    }

    /// Arguments after placeholder substitution.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Waits for the child and its output pipes, then marks the process
    /// finished.
    async fn finish(&mut self) -> Result<ExitStatus, RecorderError> {
        let State::Running { child, pipes } = &mut self.state else {
            return Err(RecorderError::NotStarted);
        };

        let status = child.wait().await?;
        for pipe in pipes.drain(..) {
            let _ = pipe.await;
        }
        self.state = State::Finished;
        Ok(status)
    }
}

impl Recorder for CaptureProcess {
    fn start(&mut self) -> Result<(), RecorderError> {
        if !matches!(self.state, State::Idle) {
            return Err(RecorderError::AlreadyStarted);
        }

        info!(program = %self.program, args = ?self.args, "Starting capture process");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                self.state = State::Finished;
                RecorderError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            })?;

        let mut pipes = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pipes.push(tokio::spawn(pipe_to_log(stdout, false)));
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.push(tokio::spawn(pipe_to_log(stderr, true)));
        }

        debug!(pid = child.id(), "Capture process running");
        self.state = State::Running { child, pipes };
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), RecorderError> {
        if matches!(self.state, State::Finished) {
            return Ok(());
        }
        let status = self.finish().await?;
        if status.success() {
            info!("Capture process completed");
            Ok(())
        } else {
            warn!(%status, "Capture process exited with error");
            Err(RecorderError::Exited(status))
        }
    }

    async fn stop(&mut self) -> Result<(), RecorderError> {
        let State::Running { child, .. } = &mut self.state else {
            return Ok(());
        };

        info!("Stopping capture process");
        if let Err(e) = child.start_kill() {
            // Already exited; the wait below reaps it.
            debug!(error = %e, "Capture process kill failed");
        }
        let status = self.finish().await?;
        debug!(%status, "Capture process stopped");
        Ok(())
    }
}

async fn pipe_to_log(stream: impl AsyncRead + Unpin, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(target: "replay_agent::capture", "{line}"),
            Ok(Some(line)) => info!(target: "replay_agent::capture", "{line}"),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Capture output reader failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::types::EventType;

    fn command(program: &str, args: &[&str]) -> RecorderCommand {
        RecorderCommand {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let process = CaptureProcess::new(
            &command("ffmpeg", &["-i", "title={title}", "{dir}/playlist.m3u8"]),
            "My Game",
            Path::new("/tmp/out/data"),
        );
        assert_eq!(
            process.args(),
            ["-i", "title=My Game", "/tmp/out/data/playlist.m3u8"]
        );
    }

    #[test]
    fn test_notify_started_logs_marker() {
        let process = CaptureProcess::new(&command("true", &[]), "t", Path::new("/tmp"));
        let sink = MemorySink::new();
        process.notify_started(&sink).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RecordingStarted);
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let mut process = CaptureProcess::new(&command("true", &[]), "t", Path::new("/tmp"));
        assert!(matches!(process.wait().await, Err(RecorderError::NotStarted)));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let mut process = CaptureProcess::new(
            &command("/nonexistent/replay-capture", &[]),
            "t",
            Path::new("/tmp"),
        );
        assert!(matches!(process.start(), Err(RecorderError::Spawn { .. })));
        assert!(matches!(process.start(), Err(RecorderError::AlreadyStarted)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_exit() {
        let mut process = CaptureProcess::new(&command("sh", &["-c", "echo recording"]), "t", Path::new("/tmp"));
        process.start().unwrap();
        process.wait().await.unwrap();
        // Once-only: a second wait reports the same clean finish.
        process.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let mut process = CaptureProcess::new(&command("sh", &["-c", "echo oops >&2; exit 3"]), "t", Path::new("/tmp"));
        process.start().unwrap();
        assert!(matches!(process.wait().await, Err(RecorderError::Exited(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let mut process = CaptureProcess::new(&command("sleep", &["30"]), "t", Path::new("/tmp"));
        process.start().unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), process.stop())
            .await
            .expect("stop should not hang")
            .unwrap();
        process.wait().await.unwrap();
    }
}
