//! Utility modules for the Replay agent.
//!
//! # Modules
//!
//! - [`shutdown`]: Shared cooperative cancellation signal
//! - [`time`]: Wall-clock epoch timestamps

pub mod shutdown;
pub mod time;

pub use shutdown::ShutdownSignal;
pub use time::epoch_seconds;
