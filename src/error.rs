//! Error types for the filecast transfer system.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while broadcasting or receiving files.
///
/// The protocol recovers locally from most wire-level trouble (short
/// datagrams, unknown peers, stale acknowledgments); the variants here are
/// the conditions that bubble up to a caller.
#[derive(Debug, Error)]
pub enum TransferError {
    /// An I/O error occurred during file or socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize configuration to TOML.
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Failed to deserialize configuration from TOML.
    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// A datagram was too short to contain a segment header.
    #[error("malformed segment: {len} bytes, need at least {min}")]
    MalformedSegment { len: usize, min: usize },

    /// More segments were offered to the window than it has slots.
    #[error("window overflow: {given} segments into {capacity} slots")]
    WindowOverflow { given: usize, capacity: usize },

    /// Every receiver was evicted; there is no one left to send to.
    #[error("all receivers became unresponsive")]
    NoReceivers,

    /// The requested file was not found.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The drop-chance knob must be a percentage.
    #[error("drop chance {0} out of range, expected 0-100")]
    DropChanceOutOfRange(u8),

    /// The transfer was cancelled before completion.
    #[error("transfer cancelled")]
    Cancelled,

    /// A protocol-level violation that cannot be recovered locally.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: TransferError = io_error.into();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn malformed_segment_message() {
        let err = TransferError::MalformedSegment { len: 3, min: 5 };
        let msg = err.to_string();
        assert!(msg.contains("3 bytes"));
        assert!(msg.contains("at least 5"));
    }

    #[test]
    fn window_overflow_message() {
        let err = TransferError::WindowOverflow {
            given: 12,
            capacity: 10,
        };
        assert!(err.to_string().contains("12 segments into 10 slots"));
    }
}
