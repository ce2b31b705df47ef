//! Configuration module for the Replay agent.
//!
//! Every option is a command-line flag that can also be supplied through an
//! environment variable. [`Config::from_cli`] validates the parsed flags once
//! and produces the immutable [`Config`] handed to each component.
//!
//! # Options
//!
//! | Flag | Variable | Default | Description |
//! |------|----------|---------|-------------|
//! | `--title` | `REPLAY_TITLE` | - | Title of the window being recorded (required) |
//! | `--out` | `REPLAY_OUT` | `<data-local-dir>/replay` | Output directory |
//! | `--endpoint` | `REPLAY_ENDPOINT` | `https://polytube.io` | Collection endpoint |
//! | `--api-id` | `REPLAY_API_ID` | - | API id (required) |
//! | `--api-key` | `REPLAY_API_KEY` | - | API key (required) |
//! | `--session-id` | `REPLAY_SESSION_ID` | random UUID | Session identifier |
//! | `--tags` | `REPLAY_TAGS` | - | Comma-separated session tags |
//! | `--app-name` | `REPLAY_APP_NAME` | `<Unassigned>` | Application name |
//! | `--app-version` | `REPLAY_APP_VERSION` | `<Unassigned>` | Application version |
//! | `--poll` | `REPLAY_POLL_SECS` | 5 | Seconds between upload scans |
//! | `--format` | `REPLAY_FORMAT` | `columnar` | Event file encoding |
//! | `--batch-rows` | `REPLAY_BATCH_ROWS` | 1024 | Rows per columnar batch |
//! | `--sync-sink` | `REPLAY_SYNC_SINK` | off | Write events synchronously |
//! | `--queue-capacity` | `REPLAY_QUEUE_CAPACITY` | 4096 | Asynchronous sink queue size |
//! | `--flush-ms` | `REPLAY_FLUSH_MS` | 1000 | Asynchronous sink flush tick |
//! | `--analog-threshold` | `REPLAY_ANALOG_THRESHOLD` | 0.1 | Minimum analog change |
//! | `--segment-ext` | `REPLAY_SEGMENT_EXT` | `ts` | Recorder segment extension |
//! | `--recorder` | `REPLAY_RECORDER` | `ffmpeg` | Capture program |
//! | `--no-console` | `REPLAY_NO_CONSOLE` | off | Do not read stdin |
//!
//! Arguments after `--` are passed to the capture program, with `{title}` and
//! `{dir}` replaced by the window title and the session data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use directories::BaseDirs;
use reqwest::Url;
use thiserror::Error;
use uuid::Uuid;

use crate::normalizer::DEFAULT_ANALOG_THRESHOLD;
use crate::sink::{QueueOptions, SinkFormat, SinkOptions, DEFAULT_BATCH_ROWS};
use crate::types::parse_tags;
use crate::uploader::{UploadSettings, DEFAULT_STABLE_AGE};

/// Default collection endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://polytube.io";

/// Placeholder for unset application name and version.
pub const UNASSIGNED: &str = "<Unassigned>";

/// Directory under the output directory holding session artifacts.
const DATA_DIR_NAME: &str = "data";

/// Default output directory name under the platform data directory.
const DEFAULT_OUT_DIR: &str = "replay";

/// File name of the diagnostic log inside the data directory.
const DIAGNOSTIC_LOG_NAME: &str = "internal.log";

/// Errors that can occur during configuration validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required option is missing or empty.
    #[error("missing required option: {0}")]
    MissingValue(String),

    /// Option has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// No output directory was given and none could be derived.
    #[error("failed to determine a default output directory")]
    NoDataDirectory,
}

/// Replay agent - records a session and uploads its telemetry.
#[derive(Parser, Debug, Clone)]
#[command(name = "replay-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
EXAMPLES:
    # Record a window and upload to the default endpoint
    replay-agent --title \"My Game\" --api-id abc --api-key s3cr3t

    # Custom capture command
    replay-agent --title \"My Game\" --api-id abc --api-key s3cr3t \\
        --recorder ffmpeg -- -f x11grab -i :0 -f hls {dir}/playlist.m3u8
")]
pub struct Cli {
    /// Title of the window being recorded.
    #[arg(long, env = "REPLAY_TITLE")]
    pub title: Option<String>,

    /// Output directory; session artifacts go to `<out>/data`.
    #[arg(long, env = "REPLAY_OUT")]
    pub out: Option<PathBuf>,

    /// Collection endpoint base URL.
    #[arg(long, env = "REPLAY_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// API id used to authenticate with the endpoint.
    #[arg(long, env = "REPLAY_API_ID", hide_env_values = true)]
    pub api_id: Option<String>,

    /// API key used to authenticate with the endpoint.
    #[arg(long, env = "REPLAY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Session identifier; generated when omitted.
    #[arg(long, env = "REPLAY_SESSION_ID")]
    pub session_id: Option<String>,

    /// Comma-separated session tags (e.g. `test,debug,build42`).
    #[arg(long, env = "REPLAY_TAGS", default_value = "")]
    pub tags: String,

    /// Name of the recorded application.
    #[arg(long, env = "REPLAY_APP_NAME", default_value = UNASSIGNED)]
    pub app_name: String,

    /// Version of the recorded application.
    #[arg(long, env = "REPLAY_APP_VERSION", default_value = UNASSIGNED)]
    pub app_version: String,

    /// Seconds between upload scans.
    #[arg(long = "poll", env = "REPLAY_POLL_SECS", default_value_t = 5)]
    pub poll_secs: u64,

    /// Encoding of the event file.
    #[arg(long, env = "REPLAY_FORMAT", value_enum, default_value_t = SinkFormat::Columnar)]
    pub format: SinkFormat,

    /// Rows per columnar batch.
    #[arg(long, env = "REPLAY_BATCH_ROWS", default_value_t = DEFAULT_BATCH_ROWS)]
    pub batch_rows: usize,

    /// Write events synchronously instead of through the bounded queue.
    #[arg(long, env = "REPLAY_SYNC_SINK")]
    pub sync_sink: bool,

    /// Capacity of the asynchronous sink queue.
    #[arg(long, env = "REPLAY_QUEUE_CAPACITY", default_value_t = crate::sink::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Milliseconds between periodic flushes of the asynchronous sink.
    #[arg(long = "flush-ms", env = "REPLAY_FLUSH_MS", default_value_t = 1000)]
    pub flush_ms: u64,

    /// Minimum change of an analog axis that produces an event.
    #[arg(long, env = "REPLAY_ANALOG_THRESHOLD", default_value_t = DEFAULT_ANALOG_THRESHOLD)]
    pub analog_threshold: f64,

    /// Extension of the recorder's segment files.
    #[arg(long = "segment-ext", env = "REPLAY_SEGMENT_EXT", default_value = "ts")]
    pub segment_ext: String,

    /// Capture program to run for the duration of the session.
    #[arg(long, env = "REPLAY_RECORDER", default_value = "ffmpeg")]
    pub recorder: String,

    /// Do not read console lines from stdin.
    #[arg(long, env = "REPLAY_NO_CONSOLE")]
    pub no_console: bool,

    /// Arguments for the capture program.
    #[arg(last = true)]
    pub recorder_args: Vec<String>,
}

/// Capture program and its arguments, before placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Validated configuration for one agent run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Title of the recorded window.
    pub title: String,

    /// Output directory.
    pub out_dir: PathBuf,

    /// Session data directory, `<out_dir>/data`.
    pub data_dir: PathBuf,

    /// Collection endpoint base URL.
    pub endpoint: Url,

    pub api_id: String,
    pub api_key: String,
    pub session_id: String,

    pub tags: Vec<String>,
    pub app_name: String,
    pub app_version: String,

    /// Interval between upload scans.
    pub poll_interval: Duration,

    /// Event sink settings, with the path inside `data_dir`.
    pub sink: SinkOptions,

    /// Minimum analog change that produces an event.
    pub analog_threshold: f64,

    /// Extension of recorder segments, without the dot.
    pub segment_extension: String,

    /// Minimum age before a segment is uploaded.
    pub stable_age: Duration,

    pub recorder: RecorderCommand,

    /// Whether stdin lines are recorded as console events.
    pub console: bool,
}

impl Config {
    /// Validates parsed flags into a `Config`.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `--title`, `--api-id` or `--api-key` is missing or blank
    /// - `--endpoint` is not an absolute http(s) URL
    /// - `--poll`, `--batch-rows`, `--queue-capacity` or `--flush-ms` is zero
    /// - `--analog-threshold` is outside `(0, 1]`
    /// - `--segment-ext` is empty or matches the diagnostic log or event file
    /// - no `--out` was given and the platform data directory is unknown
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let title = required(cli.title, "--title")?;
        let api_id = required(cli.api_id, "--api-id")?;
        let api_key = required(cli.api_key, "--api-key")?;

        let endpoint = parse_endpoint(&cli.endpoint)?;

        if cli.poll_secs == 0 {
            return Err(invalid("--poll", "poll interval must be at least 1 second"));
        }
        if cli.batch_rows == 0 {
            return Err(invalid("--batch-rows", "batch must hold at least 1 row"));
        }
        if cli.queue_capacity == 0 {
            return Err(invalid("--queue-capacity", "queue capacity must be greater than 0"));
        }
        if cli.flush_ms == 0 {
            return Err(invalid("--flush-ms", "flush interval must be greater than 0"));
        }
        if !(cli.analog_threshold > 0.0 && cli.analog_threshold <= 1.0) {
            return Err(invalid(
                "--analog-threshold",
                &format!("expected a value in (0, 1], got {}", cli.analog_threshold),
            ));
        }

        let segment_extension = cli.segment_ext.trim().trim_start_matches('.').to_string();
        if segment_extension.is_empty() {
            return Err(invalid("--segment-ext", "extension must not be empty"));
        }
        // The periodic scan would ship these while they are still being written.
        for reserved in [DIAGNOSTIC_LOG_NAME, cli.format.file_name()] {
            let extension = Path::new(reserved).extension();
            if extension.is_some_and(|ext| ext == segment_extension.as_str()) {
                return Err(invalid(
                    "--segment-ext",
                    &format!("extension would match the agent's own {reserved}"),
                ));
            }
        }

        let out_dir = match cli.out {
            Some(out) => out,
            None => BaseDirs::new()
                .ok_or(ConfigError::NoDataDirectory)?
                .data_local_dir()
                .join(DEFAULT_OUT_DIR),
        };
        let data_dir = out_dir.join(DATA_DIR_NAME);

        let session_id = cli
            .session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let queue = (!cli.sync_sink).then(|| QueueOptions {
            capacity: cli.queue_capacity,
            flush_interval: Duration::from_millis(cli.flush_ms),
        });

        Ok(Self {
            title,
            sink: SinkOptions {
                format: cli.format,
                path: data_dir.join(cli.format.file_name()),
                batch_rows: cli.batch_rows,
                queue,
            },
            out_dir,
            data_dir,
            endpoint,
            api_id,
            api_key,
            session_id,
            tags: parse_tags(&cli.tags),
            app_name: cli.app_name,
            app_version: cli.app_version,
            poll_interval: Duration::from_secs(cli.poll_secs),
            analog_threshold: cli.analog_threshold,
            segment_extension,
            stable_age: DEFAULT_STABLE_AGE,
            recorder: RecorderCommand {
                program: cli.recorder,
                args: cli.recorder_args,
            },
            console: !cli.no_console,
        })
    }

    /// Path of the diagnostic log inside the data directory.
    #[must_use]
    pub fn diagnostic_log_path(&self) -> PathBuf {
        self.data_dir.join(DIAGNOSTIC_LOG_NAME)
    }

    /// Settings for the upload tracker.
    #[must_use]
    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            endpoint: self.endpoint.clone(),
            api_id: self.api_id.clone(),
            api_key: self.api_key.clone(),
            session_id: self.session_id.clone(),
            data_dir: self.data_dir.clone(),
            segment_extension: self.segment_extension.clone(),
            stable_age: self.stable_age,
        }
    }
}

fn required(value: Option<String>, flag: &str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| invalid("--endpoint", &format!("'{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(invalid(
            "--endpoint",
            &format!("expected an http(s) URL, got '{raw}'"),
        ));
    }
    Ok(url)
}
