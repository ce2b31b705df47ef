//! Replay Agent - session telemetry capture and upload.
//!
//! This crate runs alongside an interactive application while a capture
//! process records it. It turns raw device signals and console output into a
//! canonical event stream, persists that stream durably, and ships every
//! session artifact to a collection endpoint.
//!
//! # Overview
//!
//! Device signals pass through the [`normalizer`], which drops repeats and
//! analog jitter, into an [`sink::EventSink`]. The [`uploader`] periodically
//! uploads finished recorder segments. At the end of the session the
//! [`lifecycle`] closes everything in a fixed order so the diagnostic log,
//! uploaded last, records the fate of every other file.
//!
//! # Modules
//!
//! - [`types`]: Event record, enumerations and session metadata
//! - [`normalizer`]: Deduplication of device signals
//! - [`sink`]: NDJSON, columnar and queued event sinks
//! - [`uploader`]: Session registration and artifact uploads
//! - [`recorder`]: Capture process supervision
//! - [`console`]: Console line capture
//! - [`diagnostics`]: Closeable diagnostic log writer
//! - [`lifecycle`]: Startup and ordered shutdown
//! - [`config`]: Command-line and environment configuration
//! - [`error`]: Error types for agent operations
//! - [`utils`]: Shared utilities (cancellation, clock)

pub mod config;
pub mod console;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod normalizer;
pub mod recorder;
pub mod sink;
pub mod types;
pub mod uploader;
pub mod utils;

pub use config::{Cli, Config, ConfigError};
pub use diagnostics::DiagnosticLog;
pub use error::{AgentError, Result};
pub use lifecycle::{prepare_data_dir, Agent, ConsoleInput};
pub use normalizer::Normalizer;
pub use recorder::{CaptureProcess, Recorder, RecorderError};
pub use sink::{open_sink, read_events, EventSink, SinkError, SinkFormat, SinkOptions};
pub use types::{Event, EventLevel, EventType, RawSignal, SessionInfo};
pub use uploader::{UploadError, UploadTracker};
pub use utils::ShutdownSignal;
