//! Error types for Pipedrop.
//!
//! This module provides a unified error type for all Pipedrop operations,
//! with specific error variants for different failure modes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A specialized `Result` type for Pipedrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, used to decide how a pipeline reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The peer sent something that does not fit the protocol.
    /// The offending unit is dropped, the transfer continues.
    ProtocolViolation,
    /// Local storage failed. The active reception is aborted but bytes already
    /// flushed stay on disk for a later resume.
    Resource,
    /// The channel failed or the peer went away. The in-flight loop stops.
    Transport,
    /// Late or repeated input that is ignored.
    DuplicateOrStale,
    /// Anything else (configuration, internal).
    Other,
}

/// The main error type for Pipedrop.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic protocol violation
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A request or packet referenced a file that was never announced
    #[error("unknown file id '{0}'")]
    UnknownFile(String),

    /// A chunk arrived for a different file than the active reception
    #[error("chunk for file '{actual}' does not match active file '{expected}'")]
    FileMismatch {
        /// File id of the active reception
        expected: String,
        /// File id carried by the packet
        actual: String,
    },

    /// Binary packet could not be parsed
    #[error("malformed chunk packet: {0}")]
    MalformedPacket(String),

    /// Disk write, seek or close failed
    #[error("storage error on '{}': {source}", path.display())]
    Resource {
        /// Path of the affected file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Sending on the channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer disconnected while work was pending
    #[error("peer '{0}' is gone")]
    PeerGone(String),

    /// A send to this peer is already in flight
    #[error("peer '{peer}' is already receiving '{file}'")]
    AlreadySending {
        /// Peer identifier
        peer: String,
        /// File currently in flight
        file: String,
    },

    /// A reception from this peer is already active
    #[error("a file from peer '{0}' is already being received")]
    ReceptionInProgress(String),

    /// Assembled file size does not match the announced size
    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        /// Announced size
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Transfer was cancelled (session closed)
    #[error("transfer cancelled")]
    Cancelled,

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error that happened on a specific storage path.
    pub fn resource(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }

    /// Returns the failure class of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ProtocolViolation(_)
            | Self::UnknownFile(_)
            | Self::FileMismatch { .. }
            | Self::MalformedPacket(_)
            | Self::SizeMismatch { .. } => ErrorCategory::ProtocolViolation,
            Self::Resource { .. } | Self::Io(_) => ErrorCategory::Resource,
            Self::Transport(_) | Self::PeerGone(_) | Self::Timeout(_) => ErrorCategory::Transport,
            Self::AlreadySending { .. } | Self::ReceptionInProgress(_) => {
                ErrorCategory::DuplicateOrStale
            }
            _ => ErrorCategory::Other,
        }
    }

    /// Returns whether re-requesting the file later can recover from this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::UnknownFile("abc".into()).category(),
            ErrorCategory::ProtocolViolation
        );
        assert_eq!(
            Error::resource("a.bin", io::Error::other("disk full")).category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            Error::PeerGone("bob".into()).category(),
            ErrorCategory::Transport
        );
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Other);
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::Transport("closed".into()).is_recoverable());
        assert!(Error::resource("x", io::Error::other("boom")).is_recoverable());
        assert!(!Error::MalformedPacket("short".into()).is_recoverable());
    }

    #[test]
    fn test_resource_display_includes_path() {
        let err = Error::resource("dir/file.bin", io::Error::other("no space"));
        let text = err.to_string();
        assert!(text.contains("dir/file.bin"));
        assert!(text.contains("no space"));
    }
}
