//! Typed error vocabulary for the messaging core.
//!
//! Every fallible public operation returns [`Result`]. Internal diagnostics
//! that are not fatal to the caller (dropped messages, unknown services) are
//! reported through the drop-warning callback instead — see [`crate::context`].

use std::net::{AddrParseError, SocketAddr};

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The error kinds a caller of this crate can observe.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("service '{0}' is already offered by a higher-priority process")]
    ServiceConflict(String),

    #[error("no service bound to address '{0}'")]
    NoService(String),

    #[error("message type tag mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: char, found: char },

    #[error("malformed address '{0}'")]
    BadAddress(String),

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("send would block")]
    Blocked,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("duplicate tap: '{tapper}' already taps '{tappee}'")]
    DuplicateTap { tappee: String, tapper: String },

    #[error("clock is not yet synchronized")]
    ClockNotSynchronized,

    #[error("process name '{0}' is malformed")]
    BadProcessName(String),

    #[error("scheduler table is out of range: {0}")]
    ScheduleOutOfRange(i64),

    #[error("bridge '{0}' rejected the message")]
    BridgeRejected(String),

    #[error("failed to connect to {0}")]
    TcpConnectFail(SocketAddr),

    #[error("tcp peer hung up")]
    TcpHup,

    #[error("no free port available")]
    NoPort,

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("context not initialized")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid network address: {0}")]
    Addr(#[from] AddrParseError),
}
