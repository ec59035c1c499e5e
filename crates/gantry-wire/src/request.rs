//! Closed request-type enumerations.
//!
//! The numeric ids are fixed and shared with the firmware. Unknown ids
//! decode to [`WireError::UnknownRequestType`], which the router treats
//! as a protocol violation (logged, packet dropped).

use crate::WireError;

/// Requests sent from the SBC to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SbcRequest {
    /// A binary-encoded code for one channel.
    Code = 1,
    /// Ask the firmware to send an object-model patch for a key.
    GetObjectModel = 2,
    /// Report that a requested macro finished (or failed to open).
    MacroCompleted = 3,
    /// Tell the firmware a job started on the File channel.
    PrintStarted = 4,
    /// Tell the firmware the current job ended.
    PrintStopped = 5,
    /// Ask the firmware to discard all codes queued for a channel.
    InvalidateChannel = 6,
}

impl SbcRequest {
    /// Returns the wire id.
    #[must_use]
    pub fn wire_id(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for SbcRequest {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            1 => Ok(SbcRequest::Code),
            2 => Ok(SbcRequest::GetObjectModel),
            3 => Ok(SbcRequest::MacroCompleted),
            4 => Ok(SbcRequest::PrintStarted),
            5 => Ok(SbcRequest::PrintStopped),
            6 => Ok(SbcRequest::InvalidateChannel),
            other => Err(WireError::UnknownRequestType(other)),
        }
    }
}

/// Requests sent from the firmware to the SBC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FirmwareRequest {
    /// Per-channel free-buffer advertisement; sent every cycle.
    StateReport = 1,
    /// An object-model patch (path + JSON payload).
    ObjectModel = 2,
    /// A reply to an in-flight code.
    CodeReply = 3,
    /// Ask a channel to execute a macro file.
    ExecuteMacro = 4,
    /// Discard the current code (or whole file) on a channel.
    AbortFile = 5,
    /// Firmware-side stack depth changed on a channel.
    StackEvent = 6,
    /// The running job was paused by the firmware.
    PrintPaused = 7,
    /// A message not tied to any specific code.
    Message = 8,
    /// Result of an expression evaluation.
    EvaluationResult = 9,
    /// Ask the SBC to re-emit a previously sent packet.
    ResendPacket = 10,
}

impl FirmwareRequest {
    /// Returns the wire id.
    #[must_use]
    pub fn wire_id(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FirmwareRequest {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            1 => Ok(FirmwareRequest::StateReport),
            2 => Ok(FirmwareRequest::ObjectModel),
            3 => Ok(FirmwareRequest::CodeReply),
            4 => Ok(FirmwareRequest::ExecuteMacro),
            5 => Ok(FirmwareRequest::AbortFile),
            6 => Ok(FirmwareRequest::StackEvent),
            7 => Ok(FirmwareRequest::PrintPaused),
            8 => Ok(FirmwareRequest::Message),
            9 => Ok(FirmwareRequest::EvaluationResult),
            10 => Ok(FirmwareRequest::ResendPacket),
            other => Err(WireError::UnknownRequestType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbc_ids_round_trip() {
        for id in 1..=6u16 {
            let req = SbcRequest::try_from(id).unwrap();
            assert_eq!(req.wire_id(), id);
        }
    }

    #[test]
    fn firmware_ids_round_trip() {
        for id in 1..=10u16 {
            let req = FirmwareRequest::try_from(id).unwrap();
            assert_eq!(req.wire_id(), id);
        }
    }

    #[test]
    fn unknown_ids_rejected() {
        assert!(matches!(
            SbcRequest::try_from(0),
            Err(WireError::UnknownRequestType(0))
        ));
        assert!(matches!(
            FirmwareRequest::try_from(11),
            Err(WireError::UnknownRequestType(11))
        ));
    }
}
