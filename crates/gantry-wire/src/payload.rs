//! Typed packet bodies.
//!
//! Each ingress request type has a payload struct with a `decode` for the
//! router and an `encode` used by the firmware model in tests; the egress
//! payloads are encoded the same way. All layouts are little-endian and
//! live inside the 4-byte-padded packet body, so trailing padding is
//! already stripped when these functions run.

use crate::WireError;
use gantry_types::{CodeChannel, MessageSeverity, PauseReason};

/// CodeReply flag: the content continues in a following reply.
pub const REPLY_FLAG_PUSH: u16 = 0x0001;

fn channel_from(id: u8) -> Result<CodeChannel, WireError> {
    CodeChannel::try_from(id).map_err(WireError::UnknownChannel)
}

fn severity_from(id: u8) -> Result<MessageSeverity, WireError> {
    MessageSeverity::try_from(id).map_err(|_| WireError::BadString("severity"))
}

fn need(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::BufferTooShort {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, WireError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| WireError::BadString(field))
}

/// Per-channel free-buffer advertisement, sent by the firmware every
/// cycle. The channel processors mirror these values and never emit a
/// code longer than the mirror allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReport {
    /// Free buffer bytes per channel, indexed by wire id.
    pub buffer_space: [u16; CodeChannel::COUNT],
}

impl StateReport {
    const LEN: usize = CodeChannel::COUNT * 2;

    /// Decodes a state report body.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BufferTooShort`] if the body is truncated.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, Self::LEN)?;
        let mut buffer_space = [0u16; CodeChannel::COUNT];
        for (i, space) in buffer_space.iter_mut().enumerate() {
            *space = u16::from_le_bytes([buf[2 * i], buf[2 * i + 1]]);
        }
        Ok(Self { buffer_space })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        for space in self.buffer_space {
            out.extend_from_slice(&space.to_le_bytes());
        }
        out
    }
}

/// An object-model patch: a dotted path and a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectModelPatch {
    /// Dotted path of the patched subtree (empty for the root).
    pub path: String,
    /// Raw JSON bytes of the patch value.
    pub data: Vec<u8>,
}

impl ObjectModelPatch {
    /// Decodes `path_len:u16, _pad:u16, path, json`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or non-UTF-8 path bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 4)?;
        let path_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        need(buf, 4 + path_len)?;
        let path = utf8(&buf[4..4 + path_len], "object model path")?;
        Ok(Self {
            path,
            data: buf[4 + path_len..].to_vec(),
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.path.len() + self.data.len());
        out.extend_from_slice(&(self.path.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// A reply to an in-flight code.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeReplyPayload {
    /// Channel the replied-to code runs on.
    pub channel: CodeChannel,
    /// Severity of this fragment.
    pub severity: MessageSeverity,
    /// Flag bits; see [`REPLY_FLAG_PUSH`].
    pub flags: u16,
    /// Correlation id allocated when the code was emitted.
    pub code_id: u16,
    /// Reply text fragment.
    pub content: String,
}

impl CodeReplyPayload {
    /// Returns true if more content follows for the same code.
    #[must_use]
    pub fn is_push(&self) -> bool {
        self.flags & REPLY_FLAG_PUSH != 0
    }

    /// Decodes `channel:u8, severity:u8, flags:u16, code_id:u16, _pad:u16,
    /// content`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation, unknown channel, or bad
    /// severity.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 8)?;
        Ok(Self {
            channel: channel_from(buf[0])?,
            severity: severity_from(buf[1])?,
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            code_id: u16::from_le_bytes([buf[4], buf[5]]),
            content: utf8(&buf[8..], "code reply content")?,
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.content.len());
        out.push(self.channel.wire_id());
        out.push(self.severity.wire_id());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.code_id.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(self.content.as_bytes());
        out
    }
}

/// A firmware request to run a macro file on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMacroPayload {
    /// Channel that must source the macro.
    pub channel: CodeChannel,
    /// Whether a missing file must be reported back as an error.
    pub report_missing: bool,
    /// Macro filename, relative to the macro directory.
    pub filename: String,
}

impl ExecuteMacroPayload {
    /// Decodes `channel:u8, report_missing:u8, filename_len:u16, filename`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation, unknown channel, or a
    /// non-UTF-8 filename.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 4)?;
        let filename_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        need(buf, 4 + filename_len)?;
        Ok(Self {
            channel: channel_from(buf[0])?,
            report_missing: buf[1] != 0,
            filename: utf8(&buf[4..4 + filename_len], "macro filename")?,
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.filename.len());
        out.push(self.channel.wire_id());
        out.push(u8::from(self.report_missing));
        out.extend_from_slice(&(self.filename.len() as u16).to_le_bytes());
        out.extend_from_slice(self.filename.as_bytes());
        out
    }
}

/// A firmware request to discard the current code, or the whole file,
/// on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortFilePayload {
    /// Affected channel.
    pub channel: CodeChannel,
    /// Abort everything (job included, on the File channel) instead of
    /// just the innermost file.
    pub abort_all: bool,
}

impl AbortFilePayload {
    /// Decodes `channel:u8, abort_all:u8, _pad:u16`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or unknown channel.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 2)?;
        Ok(Self {
            channel: channel_from(buf[0])?,
            abort_all: buf[1] != 0,
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        vec![self.channel.wire_id(), u8::from(self.abort_all), 0, 0]
    }
}

/// Firmware-side stack depth change on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEventPayload {
    /// Affected channel.
    pub channel: CodeChannel,
    /// New firmware-side stack depth.
    pub depth: u8,
    /// Firmware state flags for the new stack level.
    pub flags: u16,
}

impl StackEventPayload {
    /// Decodes `channel:u8, depth:u8, flags:u16`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or unknown channel.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 4)?;
        Ok(Self {
            channel: channel_from(buf[0])?,
            depth: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.channel.wire_id(), self.depth];
        out.extend_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// Firmware-initiated job pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintPausedPayload {
    /// Byte offset in the job file where execution actually stopped.
    pub file_position: u32,
    /// Why the firmware paused.
    pub reason: PauseReason,
}

impl PrintPausedPayload {
    /// Decodes `file_position:u32, reason:u8, pad[3]`. Unknown reason ids
    /// map to [`PauseReason::Firmware`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BufferTooShort`] on truncation.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 8)?;
        Ok(Self {
            file_position: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            reason: PauseReason::try_from(buf[4]).unwrap_or(PauseReason::Firmware),
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.file_position.to_le_bytes());
        out.push(self.reason as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out
    }
}

/// SBC report that a requested macro finished (or failed to open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroCompletedPayload {
    /// Channel the macro ran on.
    pub channel: CodeChannel,
    /// Whether the macro failed (missing file or parse error).
    pub error: bool,
}

impl MacroCompletedPayload {
    /// Decodes `channel:u8, error:u8, _pad:u16`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or unknown channel.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 2)?;
        Ok(Self {
            channel: channel_from(buf[0])?,
            error: buf[1] != 0,
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        vec![self.channel.wire_id(), u8::from(self.error), 0, 0]
    }
}

/// A message not tied to any specific code.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    /// Message severity.
    pub severity: MessageSeverity,
    /// Message text.
    pub content: String,
}

impl MessagePayload {
    /// Decodes `severity:u8, pad[3], content`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation, bad severity, or non-UTF-8
    /// content.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 4)?;
        Ok(Self {
            severity: severity_from(buf[0])?,
            content: utf8(&buf[4..], "message content")?,
        })
    }

    /// Encodes the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.severity.wire_id(), 0, 0, 0];
        out.extend_from_slice(self.content.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_report_layout() {
        let mut report = StateReport {
            buffer_space: [0; CodeChannel::COUNT],
        };
        report.buffer_space[CodeChannel::File as usize] = 0x0180;

        let bytes = report.encode();
        assert_eq!(bytes.len(), 22);
        // File is channel 2, little-endian u16 at offset 4.
        assert_eq!(&bytes[4..6], &[0x80, 0x01]);
        assert_eq!(StateReport::decode(&bytes).unwrap(), report);
    }

    #[test]
    fn code_reply_layout() {
        let reply = CodeReplyPayload {
            channel: CodeChannel::File,
            severity: MessageSeverity::Warning,
            flags: REPLY_FLAG_PUSH,
            code_id: 0x0207,
            content: "heating".into(),
        };

        let bytes = reply.encode();
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[4..6], &[0x07, 0x02]);
        assert_eq!(&bytes[8..], b"heating");

        let decoded = CodeReplyPayload::decode(&bytes).unwrap();
        assert!(decoded.is_push());
        assert_eq!(decoded, reply);
    }

    #[test]
    fn code_reply_unknown_channel_rejected() {
        let mut bytes = CodeReplyPayload {
            channel: CodeChannel::File,
            severity: MessageSeverity::Info,
            flags: 0,
            code_id: 1,
            content: String::new(),
        }
        .encode();
        bytes[0] = 200;
        assert!(matches!(
            CodeReplyPayload::decode(&bytes),
            Err(WireError::UnknownChannel(200))
        ));
    }

    #[test]
    fn execute_macro_carries_filename() {
        let req = ExecuteMacroPayload {
            channel: CodeChannel::File,
            report_missing: true,
            filename: "homeall.g".into(),
        };
        let decoded = ExecuteMacroPayload::decode(&req.encode()).unwrap();
        assert_eq!(decoded.filename, "homeall.g");
        assert!(decoded.report_missing);
    }

    #[test]
    fn print_paused_unknown_reason_maps_to_firmware() {
        let mut bytes = PrintPausedPayload {
            file_position: 412,
            reason: PauseReason::User,
        }
        .encode();
        bytes[4] = 250;
        let decoded = PrintPausedPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.file_position, 412);
        assert_eq!(decoded.reason, PauseReason::Firmware);
    }

    #[test]
    fn object_model_patch_splits_path_and_data() {
        let patch = ObjectModelPatch {
            path: "heat.heaters".into(),
            data: br#"[{"active":60.0}]"#.to_vec(),
        };
        let decoded = ObjectModelPatch::decode(&patch.encode()).unwrap();
        assert_eq!(decoded.path, "heat.heaters");
        assert_eq!(decoded.data, patch.data);
    }

    #[test]
    fn truncated_payloads_rejected() {
        assert!(StateReport::decode(&[0; 10]).is_err());
        assert!(CodeReplyPayload::decode(&[2, 0, 0]).is_err());
        assert!(AbortFilePayload::decode(&[2]).is_err());
        assert!(PrintPausedPayload::decode(&[1, 2, 3]).is_err());
    }
}
