//! Unified error interface and the daemon's closed error set.
//!
//! Every error type in gantry implements [`ErrorCode`], giving it a
//! stable machine-readable code and a recoverability flag. The daemon's
//! user-visible failures are all drawn from [`DaemonError`].
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`DaemonError::LinkFailure`] | `DAEMON_LINK_FAILURE` | No |
//! | [`DaemonError::ProtocolViolation`] | `DAEMON_PROTOCOL_VIOLATION` | No |
//! | [`DaemonError::CodeCancelled`] | `DAEMON_CODE_CANCELLED` | No |
//! | [`DaemonError::CodeTimeout`] | `DAEMON_CODE_TIMEOUT` | Yes |
//! | [`DaemonError::FileError`] | `DAEMON_FILE_ERROR` | No |
//! | [`DaemonError::Busy`] | `DAEMON_BUSY` | Yes |
//! | [`DaemonError::InvalidArgument`] | `DAEMON_INVALID_ARGUMENT` | No |
//!
//! Only `LinkFailure` unwinds the whole daemon; every other variant is
//! reported on the originating channel's code result.

use std::time::Duration;
use thiserror::Error;

/// Unified error code interface.
///
/// Codes are UPPER_SNAKE_CASE, domain-prefixed, and stable once defined.
/// An error is recoverable when retrying may succeed or the user can take
/// corrective action.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying the operation may succeed.
    fn is_recoverable(&self) -> bool;
}

/// The daemon's closed error set.
///
/// Recoverable errors are reported on the originating channel's code
/// result and never escape to the supervisor; [`DaemonError::LinkFailure`]
/// is the only variant that terminates the process.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DaemonError {
    /// SPI resync budget exhausted. Fatal.
    #[error("SPI link lost: {0}")]
    LinkFailure(String),

    /// Malformed packet from the firmware after a successful CRC.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The channel was invalidated or the job was cancelled/aborted.
    #[error("code cancelled")]
    CodeCancelled,

    /// No final reply arrived within the deadline.
    #[error("no reply within {0:?}")]
    CodeTimeout(Duration),

    /// Job/macro file missing, unreadable, or parse-failed mid-stream.
    #[error("file error: {0}")]
    FileError(String),

    /// The channel has too many codes queued for its firmware buffer.
    #[error("busy: {0}")]
    Busy(String),

    /// A client request was rejected before dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ErrorCode for DaemonError {
    fn code(&self) -> &'static str {
        match self {
            Self::LinkFailure(_) => "DAEMON_LINK_FAILURE",
            Self::ProtocolViolation(_) => "DAEMON_PROTOCOL_VIOLATION",
            Self::CodeCancelled => "DAEMON_CODE_CANCELLED",
            Self::CodeTimeout(_) => "DAEMON_CODE_TIMEOUT",
            Self::FileError(_) => "DAEMON_FILE_ERROR",
            Self::Busy(_) => "DAEMON_BUSY",
            Self::InvalidArgument(_) => "DAEMON_INVALID_ARGUMENT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::CodeTimeout(_) | Self::Busy(_))
    }
}

/// Validates that an error code follows the project conventions:
/// non-empty, UPPER_SNAKE_CASE, and carrying the expected prefix.
///
/// # Panics
///
/// Panics with a descriptive message if validation fails. Intended for
/// tests.
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();
    assert!(!code.is_empty(), "error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "error code '{code}' must start with prefix '{expected_prefix}'"
    );
    assert!(
        is_upper_snake_case(code),
        "error code '{code}' must be UPPER_SNAKE_CASE"
    );
}

/// Validates every variant of an error enum at once.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && !s.contains("__")
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DaemonError> {
        vec![
            DaemonError::LinkFailure("resync budget exhausted".into()),
            DaemonError::ProtocolViolation("unknown request 0x7fff".into()),
            DaemonError::CodeCancelled,
            DaemonError::CodeTimeout(Duration::from_secs(30)),
            DaemonError::FileError("missing".into()),
            DaemonError::Busy("file channel".into()),
            DaemonError::InvalidArgument("bad position".into()),
        ]
    }

    #[test]
    fn all_error_codes_valid() {
        assert_error_codes(&all_variants(), "DAEMON_");
    }

    #[test]
    fn only_timeout_and_busy_are_recoverable() {
        for err in all_variants() {
            let expected = matches!(
                err,
                DaemonError::CodeTimeout(_) | DaemonError::Busy(_)
            );
            assert_eq!(err.is_recoverable(), expected, "{err}");
        }
    }

    #[test]
    fn upper_snake_case_check() {
        assert!(is_upper_snake_case("DAEMON_BUSY"));
        assert!(!is_upper_snake_case("daemon_busy"));
        assert!(!is_upper_snake_case("_DAEMON"));
        assert!(!is_upper_snake_case("DAEMON__BUSY"));
    }
}
