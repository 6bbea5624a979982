use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use thiserror::Error;

/// Failure to establish the LED controller connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The endpoint could not be parsed (bad IPv4 octets, empty fields).
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A connection is already open; it must be closed first.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddrV4),

    /// The controller did not accept the connection in time.
    #[error("timed out after {timeout:?} connecting to {addr}")]
    Timeout { addr: SocketAddrV4, timeout: Duration },

    /// Refused, unreachable or any other socket-level failure.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

/// A command that cannot be expressed on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("too many regions for a single frame: {0} (max 255)")]
    TooManyRegions(usize),
}

/// Failure while writing a frame to the controller.
#[derive(Debug, Error)]
pub enum ProtocolWriteError {
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The socket rejected the write; the connection has been torn down.
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Failure to grab a screen snapshot. The sampling tick is skipped.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitors available")]
    NoMonitor,

    #[error("captured an empty frame")]
    EmptyFrame,

    #[error("screen capture failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    /// Capture or reduction did not run to completion on the blocking pool.
    #[error("capture task failed: {0}")]
    Task(String),
}

/// Failure inside the color reduction pipeline.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("cannot reduce an empty frame")]
    EmptyFrame,

    #[error("column range {start}..{end} is outside a {width}px frame")]
    ColumnRange { start: u32, end: u32, width: u32 },

    #[error("downsample failed: {0}")]
    Resize(String),
}
