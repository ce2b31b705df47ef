//! Signal normalization for device input.
//!
//! Platform input adapters push decoded [`RawSignal`]s as fast as the device
//! reports them. Most of those observations repeat the previous state, so the
//! normalizer keeps the last emitted value for every `(level, key)` pair and
//! only lets meaningful state changes through to the event sink.
//!
//! # Policy
//!
//! - **Digital** inputs (keyboard keys, mouse buttons, gamepad buttons) emit on
//!   any exact change of value. The first observation of a key always emits.
//! - **Analog** inputs (joystick and trigger axes) emit when the value moved at
//!   least `threshold` away from the last emitted value.
//! - Signals with an empty key or a non-finite value are ignored.
//!
//! The cache is updated before the event is handed off, so a rapid repeat of
//! the same value is suppressed immediately.
//!
//! # Architecture
//!
//! [`Normalizer`] itself is a plain state machine with no I/O. The cache is
//! owned by a single dispatching task ([`spawn_dispatcher`]) that receives
//! signals from every adapter over one bounded channel, so no lock is needed
//! and per-adapter ordering is preserved.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::sink::EventSink;
use crate::types::{Event, EventLevel, RawSignal};
use crate::utils::ShutdownSignal;

/// Default minimum change for analog axes to produce an event.
pub const DEFAULT_ANALOG_THRESHOLD: f64 = 0.1;

/// Axis names reported by gamepad adapters that do not carry an `Axis` token.
const ANALOG_SUFFIXES: [&str; 6] = ["LeftX", "LeftY", "RightX", "RightY", "LT", "RT"];

/// Returns true if a signal on `key` carries analog state.
///
/// Only gamepads report analog state; their axes are named with an `Axis`
/// token (`XInput_0_Axis_LeftX`, `Axis3`) or by one of the standard stick and
/// trigger names.
#[must_use]
pub fn is_analog(level: EventLevel, key: &str) -> bool {
    level == EventLevel::Joypad
        && (key.contains("Axis") || ANALOG_SUFFIXES.iter().any(|s| key.ends_with(s)))
}

/// Last-value cache and dedup policy for device signals.
#[derive(Debug)]
pub struct Normalizer {
    threshold: f64,
    last_values: HashMap<EventLevel, HashMap<String, f64>>,
}

impl Normalizer {
    /// Creates a normalizer with the given analog threshold.
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last_values: HashMap::new(),
        }
    }

    /// Returns the analog threshold in use.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Observes one signal and returns the event to record, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use replay_agent::normalizer::Normalizer;
    /// use replay_agent::types::EventLevel;
    ///
    /// let mut normalizer = Normalizer::new(0.1);
    /// assert!(normalizer.observe(EventLevel::Keyboard, "A", 1.0).is_some());
    /// assert!(normalizer.observe(EventLevel::Keyboard, "A", 1.0).is_none());
    /// assert!(normalizer.observe(EventLevel::Keyboard, "A", 0.0).is_some());
    /// ```
    pub fn observe(&mut self, level: EventLevel, key: &str, value: f64) -> Option<Event> {
        if key.is_empty() {
            trace!(level = level.as_str(), "Ignoring signal with empty key");
            return None;
        }
        if !value.is_finite() {
            debug!(level = level.as_str(), key, "Ignoring non-finite signal value");
            return None;
        }

        let per_level = self.last_values.entry(level).or_default();

        if let Some(&last) = per_level.get(key) {
            if is_analog(level, key) {
                if (value - last).abs() < self.threshold {
                    return None;
                }
            } else if last == value {
                return None;
            }
        }

        per_level.insert(key.to_string(), value);
        Some(Event::input(level, key, value))
    }

    /// Returns the number of distinct `(level, key)` pairs seen so far.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.last_values.values().map(HashMap::len).sum()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_ANALOG_THRESHOLD)
    }
}

/// Spawns the task that owns `normalizer` and feeds its output into `sink`.
///
/// The task ends when `shutdown` is triggered or every signal sender has been
/// dropped. It resolves to the number of events handed to the sink.
pub fn spawn_dispatcher(
    mut normalizer: Normalizer,
    mut signals: mpsc::Receiver<RawSignal>,
    sink: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut emitted = 0u64;

        debug!(
            threshold = normalizer.threshold(),
            "Starting input signal dispatcher"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    // Signals already queued were observed before shutdown.
                    let mut drained = 0u64;
                    while let Ok(signal) = signals.try_recv() {
                        drained += dispatch(&mut normalizer, sink.as_ref(), &signal);
                    }
                    emitted += drained;
                    debug!(drained, "Input dispatcher observed cancellation");
                    break;
                }

                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        debug!("All input sources closed");
                        break;
                    };
                    emitted += dispatch(&mut normalizer, sink.as_ref(), &signal);
                }
            }
        }

        debug!(
            emitted,
            tracked_keys = normalizer.tracked_keys(),
            "Input signal dispatcher stopped"
        );
        emitted
    })
}

/// Normalizes one signal into `sink`. Returns 1 if an event was logged.
fn dispatch(normalizer: &mut Normalizer, sink: &dyn EventSink, signal: &RawSignal) -> u64 {
    let Some(event) = normalizer.observe(signal.level, &signal.key, signal.value) else {
        return 0;
    };
    match sink.log_event(event) {
        Ok(()) => 1,
        Err(e) => {
            warn!(error = %e, key = %signal.key, "Failed to log input event");
            0
        }
    }
}
