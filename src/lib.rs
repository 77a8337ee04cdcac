//! # meshline
//!
//! A distributed messaging middleware core for interactive media ensembles:
//! a service directory with OSC-compatible address dispatch, TCP/UDP
//! transport with non-blocking send queues, a timing-wheel scheduler, a
//! clock-synchronization protocol, and tap-based publish/subscribe fan-out,
//! all driven by a single-threaded, non-re-entrant poll loop.

pub mod address;
pub mod bridge;
pub mod clock;
pub mod cli;
pub mod codec;
pub mod context;
pub mod diagnostics;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod process;
pub mod scheduler;
pub mod tap;
pub mod transport;

pub use codec::{Bundle, Message, MessageBuilder, MessageReader, Packet, Value};
pub use context::Context;
pub use error::{CoreError, Result};
pub use process::ProcessName;
pub use tap::{Tap, TapMode, MAX_TAP_TTL};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values for the demo process binary.
pub mod defaults {
    /// Default TCP port an ensemble process listens on.
    pub const TCP_PORT: u16 = 0;

    /// Default UDP port an ensemble process listens on.
    pub const UDP_PORT: u16 = 0;

    /// Default ensemble name used when none is given on the command line.
    pub const ENSEMBLE_NAME: &str = "default";

    /// Default clock ping interval, in seconds.
    pub const PING_INTERVAL_SECS: f64 = crate::clock::PING_INTERVAL;
}
