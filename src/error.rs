use std::io;

use thiserror::Error;

use crate::protocol::MAX_STRING_SIZE;

/// Error type for pipekv operations.
#[derive(Error, Debug)]
pub enum KvsError {
    /// IO error from file or FIFO operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A system call failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Malformed framing or a short read on a fixed-length record.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// An op-code outside the known set.
    #[error("unknown op-code {0:#04x}")]
    UnknownOpCode(u8),

    /// Empty key, or a key longer than the wire limit.
    #[error("invalid key (must be 1..={MAX_STRING_SIZE} bytes)")]
    InvalidKey,

    /// The server tore the session down; its pipes are gone.
    #[error("session closed by server")]
    SessionClosed,

    /// Rejected command-line or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server rejected the request (status byte `'1'`).
    #[error("server refused {0}")]
    Refused(&'static str),
}

/// Result type alias for pipekv operations.
pub type Result<T> = std::result::Result<T, KvsError>;
