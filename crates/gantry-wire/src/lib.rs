//! SPI wire protocol shared between gantry and the motion firmware.
//!
//! Everything in this crate is bit-exact and little-endian: the firmware
//! implements the same layouts from its side of the link. A transfer
//! cycle exchanges two framed buffers; each buffer is a 16-byte
//! [`TransferHeader`] followed by a body of packets, each packet an
//! 8-byte [`PacketHeader`] plus a 4-byte-aligned payload.
//!
//! ```text
//! ┌────────────────── transfer buffer ──────────────────┐
//! │ TransferHeader │ Packet │ Packet │ … │ (≤ 8 KiB)    │
//! │    16 bytes    │ hdr+body, 4-byte aligned           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`header`] - transfer and packet headers, framing helpers
//! - [`request`] - the closed request-type enumerations
//! - [`payload`] - typed bodies for each request type
//! - [`codes`] - binary encoding of a [`Code`](gantry_types::Code)
//!
//! Checksums are CRC-16/CCITT with initial value 0 (the XMODEM
//! parameterisation), over the raw little-endian bytes.

mod codes;
mod error;
mod header;
mod payload;
mod request;

pub use codes::{encode_code, encoded_len};
pub use error::WireError;
pub use header::{
    padded_len, parse_packets, write_packet, PacketHeader, TransferHeader, PACKET_HEADER_LEN,
    TRANSFER_HEADER_LEN,
};
pub use payload::{
    AbortFilePayload, CodeReplyPayload, ExecuteMacroPayload, MacroCompletedPayload,
    MessagePayload, ObjectModelPatch, PrintPausedPayload, StackEventPayload, StateReport,
    REPLY_FLAG_PUSH,
};
pub use request::{FirmwareRequest, SbcRequest};

use crc::{Crc, CRC_16_XMODEM};

/// Format version of the transfer framing. Bumped only on incompatible
/// layout changes; a mismatch forces a resync.
pub const FORMAT_VERSION: u16 = 2;

/// Protocol version of the packet vocabulary.
pub const PROTOCOL_VERSION: u16 = 5;

/// Maximum body size per direction per transfer.
pub const MAX_BODY_LEN: usize = 8192;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Computes the protocol checksum over a byte slice.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
