//! Console line capture.
//!
//! When the recorded application's output is piped into the agent, every
//! non-empty line becomes a `CONSOLE_LOG` event.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sink::EventSink;
use crate::types::Event;
use crate::utils::ShutdownSignal;

/// Spawns a task that records each line of `input` until EOF or shutdown.
///
/// Lines are trimmed; blank lines are skipped. The task resolves to the
/// number of events handed to the sink.
pub fn spawn_console_listener<R>(
    input: R,
    sink: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        let mut recorded = 0u64;

        info!("Console listener started");

        loop {
            let line = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Console listener observed cancellation");
                    break;
                }

                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match sink.log_event(Event::console(line)) {
                        Ok(()) => recorded += 1,
                        Err(e) => warn!(error = %e, "Failed to log console event"),
                    }
                }
                Ok(None) => {
                    info!("Console input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    break;
                }
            }
        }

        info!(recorded, "Console listener stopped");
        recorded
    })
}
