//! Event types for Replay session telemetry.
//!
//! This module defines the canonical event record written by every event sink
//! backend, the raw device signal consumed by the normalizer, and the session
//! metadata posted to the collection endpoint. All enumerations serialize to a
//! fixed upper snake case string.

use serde::{Deserialize, Serialize};

use crate::utils::time::epoch_seconds;

/// Type classification for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    InputLog,
    ConsoleLog,
    RecordingStarted,
}

impl EventType {
    const ALL: [Self; 3] = [Self::InputLog, Self::ConsoleLog, Self::RecordingStarted];

    /// Looks up a type by its canonical string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Returns the canonical string this type serializes to.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputLog => "INPUT_LOG",
            Self::ConsoleLog => "CONSOLE_LOG",
            Self::RecordingStarted => "RECORDING_STARTED",
        }
    }
}

/// Severity for console events, or the originating device for input events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Log,
    Warning,
    Error,
    Mouse,
    Keyboard,
    Joypad,
    #[serde(rename = "UNKNOWN")]
    UnknownDevice,
}

impl EventLevel {
    const ALL: [Self; 7] = [
        Self::Log,
        Self::Warning,
        Self::Error,
        Self::Mouse,
        Self::Keyboard,
        Self::Joypad,
        Self::UnknownDevice,
    ];

    /// Looks up a level by its canonical string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == name)
    }

    /// Returns the canonical string this level serializes to.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Mouse => "MOUSE",
            Self::Keyboard => "KEYBOARD",
            Self::Joypad => "JOYPAD",
            Self::UnknownDevice => "UNKNOWN",
        }
    }

    /// Returns true for levels that identify an input device.
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(
            self,
            Self::Mouse | Self::Keyboard | Self::Joypad | Self::UnknownDevice
        )
    }
}

/// A single telemetry record.
///
/// Events are created by producers at signal time and never mutated. The
/// timestamp is seconds since the Unix epoch and always serializes as a
/// plain number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Wall-clock time the event was observed, in epoch seconds.
    pub timestamp: f64,

    /// Classification of the event.
    pub event_type: EventType,

    /// Severity or originating device.
    pub event_level: EventLevel,

    /// Key name, axis name, or free text.
    pub content: String,

    /// 1/0 for digital state, normalized magnitude for analog state, 0 otherwise.
    pub value: f64,
}

impl Event {
    /// Creates an event stamped with the current wall-clock time.
    #[must_use]
    pub fn new(
        event_type: EventType,
        event_level: EventLevel,
        content: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp: epoch_seconds(),
            event_type,
            event_level,
            content: content.into(),
            value,
        }
    }

    /// Creates an input event for a device key or axis.
    ///
    /// # Examples
    ///
    /// ```
    /// use replay_agent::types::{Event, EventLevel, EventType};
    ///
    /// let event = Event::input(EventLevel::Keyboard, "Key_65", 1.0);
    /// assert_eq!(event.event_type, EventType::InputLog);
    /// assert_eq!(event.content, "Key_65");
    /// ```
    #[must_use]
    pub fn input(level: EventLevel, key: impl Into<String>, value: f64) -> Self {
        Self::new(EventType::InputLog, level, key, value)
    }

    /// Creates a console event carrying one line of application output.
    #[must_use]
    pub fn console(line: impl Into<String>) -> Self {
        Self::new(EventType::ConsoleLog, EventLevel::Log, line, 0.0)
    }

    /// Creates the marker event written once the capture process is running.
    #[must_use]
    pub fn recording_started() -> Self {
        Self::new(EventType::RecordingStarted, EventLevel::Log, "", 0.0)
    }
}

/// A decoded device signal as delivered by a platform input adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    /// Originating device class.
    pub level: EventLevel,
    /// Key, button or axis name.
    pub key: String,
    /// Raw state value.
    pub value: f64,
}

impl RawSignal {
    #[must_use]
    pub fn new(level: EventLevel, key: impl Into<String>, value: f64) -> Self {
        Self {
            level,
            key: key.into(),
            value,
        }
    }
}

/// Metadata describing the recorded session.
///
/// Posted verbatim to the collection endpoint when the session is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub app_name: String,
    pub app_version: String,
    pub tags: Vec<String>,
    pub os: String,
    pub hostname: String,
}

impl SessionInfo {
    /// Builds session metadata for this host.
    #[must_use]
    pub fn collect(app_name: String, app_version: String, tags: Vec<String>) -> Self {
        Self {
            app_name,
            app_version,
            tags,
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            hostname: gethostname::gethostname()
                .into_string()
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Splits a comma-separated tag list, trimming whitespace and dropping empties.
#[must_use]
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
