//! Error types for layerscope-core.
//!
//! This module provides structured error types for all layerscope-core operations:
//!
//! - [`enum@Error`] - Main error enum returned by registries, factories and sessions
//! - [`CaptureError`] - Errors from capture files and capture streams
//! - [`DissectError`] - Faults raised by an individual dissector
//!
//! A dissector declining its input is not an error; see
//! [`Dissection::Decline`](crate::dissector::Dissection::Decline).

use thiserror::Error;

use crate::filter::FilterError;
use crate::session::SessionState;

/// Main error type for layerscope-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Neither a live interface nor a file source, or conflicting sources.
    #[error("Invalid capture parameters: {reason}")]
    InvalidParameters { reason: String },

    /// The filter expression could not be compiled.
    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(#[from] FilterError),

    /// The platform lacks the rights needed for live capture.
    #[error("Live capture not permitted on {platform}: {detail}")]
    PermissionDenied {
        platform: &'static str,
        detail: String,
    },

    /// The capture device could not be opened.
    #[error("Capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// The session has failed and only teardown is legal.
    #[error("Session {id} has failed; create a new session to retry")]
    SessionFailed { id: u64 },

    /// A token identifier was registered twice with different names.
    #[error("Token {id} is already registered as {existing:?} (requested {requested:?})")]
    DuplicateIdentifier {
        id: String,
        existing: String,
        requested: String,
    },

    /// A lifecycle operation is not legal in the current state.
    #[error("Cannot {operation} a session in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// A pending task was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Error reading frames from a capture source.
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture files and capture streams.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid capture format
    #[error("Invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    /// The capture stream ended in the middle of a record.
    #[error("Truncated capture stream after frame {frame}")]
    Truncated { frame: u64 },
}

/// Faults raised by a dissector while decoding its input.
///
/// The pipeline catches these at the step boundary and marks the
/// offending layer corrupt; they never halt a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DissectError {
    /// Input too short for the protocol header
    #[error("{dissector}: input too short (need {needed} bytes, have {have})")]
    TooShort {
        dissector: &'static str,
        needed: usize,
        have: usize,
    },

    /// Invalid header field value
    #[error("{dissector}: invalid {field}: {reason}")]
    InvalidField {
        dissector: &'static str,
        field: &'static str,
        reason: String,
    },

    /// The dissector panicked.
    #[error("{dissector}: panicked: {message}")]
    Panicked {
        dissector: &'static str,
        message: String,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PermissionDenied {
            platform: "linux",
            detail: "missing CAP_NET_RAW".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Live capture not permitted on linux: missing CAP_NET_RAW"
        );

        let err = DissectError::TooShort {
            dissector: "ipv4",
            needed: 20,
            have: 3,
        };
        assert_eq!(err.to_string(), "ipv4: input too short (need 20 bytes, have 3)");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState {
            operation: "start",
            state: SessionState::Stopped,
        };
        assert_eq!(err.to_string(), "Cannot start a session in state stopped");
    }
}
