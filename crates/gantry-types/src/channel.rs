//! Code channels - logical command sources shared with the firmware.
//!
//! Every code entering the system is attributed to one of eleven fixed
//! channels. The numeric ids are part of the SPI wire protocol and must
//! never change; the firmware keeps an independent queue per channel and
//! addresses replies by the same ids.
//!
//! # Egress Priority
//!
//! When the packet router assembles a transfer it polls channels in a
//! fixed priority order, highest first. Trigger and AutoPause outrank the
//! interactive channels so that safety-relevant codes (filament runout,
//! power-loss pause) are never starved by a busy job stream.
//!
//! # Example
//!
//! ```
//! use gantry_types::CodeChannel;
//!
//! let ch = CodeChannel::try_from(2u8).unwrap();
//! assert_eq!(ch, CodeChannel::File);
//! assert_eq!(ch.to_string(), "File");
//!
//! // Trigger is polled before everything else
//! assert_eq!(CodeChannel::PRIORITY[0], CodeChannel::Trigger);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical command-source identifier shared with the firmware.
///
/// The discriminants are wire ids; [`CodeChannel::PRIORITY`] gives the
/// egress polling order, which is unrelated to the numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodeChannel {
    /// Codes arriving over the HTTP front-end.
    Http = 0,
    /// Codes arriving over the Telnet front-end.
    Telnet = 1,
    /// The job file stream. Macros requested while a job runs are
    /// interleaved on this channel.
    File = 2,
    /// Codes from the USB serial console.
    Usb = 3,
    /// Codes from the auxiliary UART (typically an attached display).
    Aux = 4,
    /// Firmware-initiated trigger macros (highest egress priority).
    Trigger = 5,
    /// The conditional-code queue.
    Queue = 6,
    /// Codes from a directly attached LCD controller.
    Lcd = 7,
    /// Codes generated by the SBC itself.
    Sbc = 8,
    /// Internal daemon housekeeping codes.
    Daemon = 9,
    /// Automatic pause handling (power-loss, filament monitor).
    AutoPause = 10,
}

impl CodeChannel {
    /// Number of channels. Baked into the wire protocol.
    pub const COUNT: usize = 11;

    /// All channels, in wire-id order.
    pub const ALL: [CodeChannel; Self::COUNT] = [
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Trigger,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Sbc,
        CodeChannel::Daemon,
        CodeChannel::AutoPause,
    ];

    /// Egress polling order, highest priority first.
    pub const PRIORITY: [CodeChannel; Self::COUNT] = [
        CodeChannel::Trigger,
        CodeChannel::AutoPause,
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Sbc,
        CodeChannel::Daemon,
    ];

    /// Returns the wire id of this channel.
    #[must_use]
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    /// Returns the channel name as used in logs and diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CodeChannel::Http => "HTTP",
            CodeChannel::Telnet => "Telnet",
            CodeChannel::File => "File",
            CodeChannel::Usb => "USB",
            CodeChannel::Aux => "Aux",
            CodeChannel::Trigger => "Trigger",
            CodeChannel::Queue => "Queue",
            CodeChannel::Lcd => "LCD",
            CodeChannel::Sbc => "SBC",
            CodeChannel::Daemon => "Daemon",
            CodeChannel::AutoPause => "AutoPause",
        }
    }
}

impl fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for CodeChannel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(CodeChannel::Http),
            1 => Ok(CodeChannel::Telnet),
            2 => Ok(CodeChannel::File),
            3 => Ok(CodeChannel::Usb),
            4 => Ok(CodeChannel::Aux),
            5 => Ok(CodeChannel::Trigger),
            6 => Ok(CodeChannel::Queue),
            7 => Ok(CodeChannel::Lcd),
            8 => Ok(CodeChannel::Sbc),
            9 => Ok(CodeChannel::Daemon),
            10 => Ok(CodeChannel::AutoPause),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_wire_ids() {
        for ch in CodeChannel::ALL {
            assert_eq!(CodeChannel::try_from(ch.wire_id()), Ok(ch));
        }
    }

    #[test]
    fn unknown_wire_id_rejected() {
        assert_eq!(CodeChannel::try_from(11), Err(11));
        assert_eq!(CodeChannel::try_from(255), Err(255));
    }

    #[test]
    fn priority_covers_every_channel_once() {
        let mut seen = std::collections::HashSet::new();
        for ch in CodeChannel::PRIORITY {
            assert!(seen.insert(ch), "{ch} listed twice");
        }
        assert_eq!(seen.len(), CodeChannel::COUNT);
    }

    #[test]
    fn safety_channels_outrank_file() {
        let pos = |c| CodeChannel::PRIORITY.iter().position(|&p| p == c).unwrap();
        assert!(pos(CodeChannel::Trigger) < pos(CodeChannel::File));
        assert!(pos(CodeChannel::AutoPause) < pos(CodeChannel::File));
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(CodeChannel::AutoPause.to_string(), "AutoPause");
        assert_eq!(CodeChannel::Usb.to_string(), "USB");
    }
}
