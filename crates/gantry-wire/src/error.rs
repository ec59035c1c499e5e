//! Wire-level decode errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`WireError::BufferTooShort`] | `WIRE_BUFFER_TOO_SHORT` | No |
//! | [`WireError::ChecksumMismatch`] | `WIRE_CHECKSUM_MISMATCH` | Yes |
//! | [`WireError::VersionMismatch`] | `WIRE_VERSION_MISMATCH` | No |
//! | [`WireError::BodyTooLarge`] | `WIRE_BODY_TOO_LARGE` | No |
//! | [`WireError::UnknownRequestType`] | `WIRE_UNKNOWN_REQUEST_TYPE` | No |
//! | [`WireError::UnknownChannel`] | `WIRE_UNKNOWN_CHANNEL` | No |
//! | [`WireError::BadString`] | `WIRE_BAD_STRING` | No |
//!
//! Checksum mismatches are recoverable because the transfer engine
//! retries the cycle; everything else indicates a protocol violation.

use gantry_types::ErrorCode;
use thiserror::Error;

/// Decode failure for a transfer header, packet, or payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the structure was complete.
    #[error("buffer too short: need {needed} bytes, have {actual}")]
    BufferTooShort {
        /// Bytes required by the structure.
        needed: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// A CRC field disagreed with the received bytes.
    #[error("checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u16,
        /// Checksum computed over the received bytes.
        computed: u16,
    },

    /// The peer speaks a different format version.
    #[error("format version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our format version.
        expected: u16,
        /// The version in the received header.
        got: u16,
    },

    /// The advertised data length exceeds the transfer cap.
    #[error("body too large: {len} bytes exceeds cap of {max}")]
    BodyTooLarge {
        /// Advertised length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// A request-type id outside the closed enumeration.
    #[error("unknown request type {0:#06x}")]
    UnknownRequestType(u16),

    /// A channel id outside the fixed channel set.
    #[error("unknown channel id {0}")]
    UnknownChannel(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    BadString(&'static str),
}

impl ErrorCode for WireError {
    fn code(&self) -> &'static str {
        match self {
            Self::BufferTooShort { .. } => "WIRE_BUFFER_TOO_SHORT",
            Self::ChecksumMismatch { .. } => "WIRE_CHECKSUM_MISMATCH",
            Self::VersionMismatch { .. } => "WIRE_VERSION_MISMATCH",
            Self::BodyTooLarge { .. } => "WIRE_BODY_TOO_LARGE",
            Self::UnknownRequestType(_) => "WIRE_UNKNOWN_REQUEST_TYPE",
            Self::UnknownChannel(_) => "WIRE_UNKNOWN_CHANNEL",
            Self::BadString(_) => "WIRE_BAD_STRING",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}
