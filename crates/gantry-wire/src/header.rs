//! Transfer and packet headers, plus body framing helpers.
//!
//! The 16-byte transfer header leads every exchanged buffer:
//!
//! ```text
//! offset  field                type
//! 0       format_version       u16
//! 2       protocol_version     u16
//! 4       sequence_number      u16
//! 6       data_length          u16
//! 8       checksum_data        u16   CRC over the body bytes
//! 10      checksum_header      u16   CRC over bytes 0..10
//! 12      (reserved, zero)     [u8; 4]
//! ```
//!
//! Each packet inside the body starts with an 8-byte header:
//!
//! ```text
//! offset  field                type
//! 0       request_type         u16
//! 2       id                   u16
//! 4       length               u16   body bytes, excluding padding
//! 6       resend_packet_id     u16
//! ```
//!
//! Packet bodies are padded to 4-byte alignment; `length` excludes the
//! padding.

use crate::{checksum, WireError, FORMAT_VERSION, MAX_BODY_LEN, PROTOCOL_VERSION};

/// Size of the transfer header in bytes.
pub const TRANSFER_HEADER_LEN: usize = 16;

/// Size of a packet header in bytes.
pub const PACKET_HEADER_LEN: usize = 8;

/// Rounds a length up to 4-byte alignment.
#[must_use]
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// The fixed 16-byte header leading every transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// Framing format version; a mismatch forces a resync.
    pub format_version: u16,
    /// Packet vocabulary version.
    pub protocol_version: u16,
    /// Sequence counter of the transfer cycle.
    pub sequence_number: u16,
    /// Number of body bytes following the header.
    pub data_length: u16,
    /// CRC over the body bytes.
    pub checksum_data: u16,
    /// CRC over the first 10 header bytes.
    pub checksum_header: u16,
}

impl TransferHeader {
    /// Builds a header for an outbound transfer carrying `body`.
    #[must_use]
    pub fn for_body(sequence_number: u16, body: &[u8]) -> Self {
        let mut header = Self {
            format_version: FORMAT_VERSION,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
            data_length: body.len() as u16,
            checksum_data: checksum(body),
            checksum_header: 0,
        };
        header.checksum_header = checksum(&header.prefix_bytes());
        header
    }

    /// Serialises into the fixed wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; TRANSFER_HEADER_LEN] {
        let mut out = [0u8; TRANSFER_HEADER_LEN];
        out[0..2].copy_from_slice(&self.format_version.to_le_bytes());
        out[2..4].copy_from_slice(&self.protocol_version.to_le_bytes());
        out[4..6].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[6..8].copy_from_slice(&self.data_length.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum_data.to_le_bytes());
        out[10..12].copy_from_slice(&self.checksum_header.to_le_bytes());
        out
    }

    /// Parses and validates an inbound header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the buffer is short, the header CRC does
    /// not match, the format version disagrees, or the advertised body
    /// length exceeds [`MAX_BODY_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < TRANSFER_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                needed: TRANSFER_HEADER_LEN,
                actual: buf.len(),
            });
        }

        let header = Self {
            format_version: u16::from_le_bytes([buf[0], buf[1]]),
            protocol_version: u16::from_le_bytes([buf[2], buf[3]]),
            sequence_number: u16::from_le_bytes([buf[4], buf[5]]),
            data_length: u16::from_le_bytes([buf[6], buf[7]]),
            checksum_data: u16::from_le_bytes([buf[8], buf[9]]),
            checksum_header: u16::from_le_bytes([buf[10], buf[11]]),
        };

        let computed = checksum(&buf[0..10]);
        if computed != header.checksum_header {
            return Err(WireError::ChecksumMismatch {
                expected: header.checksum_header,
                computed,
            });
        }
        if header.format_version != FORMAT_VERSION {
            return Err(WireError::VersionMismatch {
                expected: FORMAT_VERSION,
                got: header.format_version,
            });
        }
        if header.data_length as usize > MAX_BODY_LEN {
            return Err(WireError::BodyTooLarge {
                len: header.data_length as usize,
                max: MAX_BODY_LEN,
            });
        }
        Ok(header)
    }

    /// Verifies the body CRC against [`TransferHeader::checksum_data`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ChecksumMismatch`] on disagreement.
    pub fn verify_body(&self, body: &[u8]) -> Result<(), WireError> {
        let computed = checksum(body);
        if computed != self.checksum_data {
            return Err(WireError::ChecksumMismatch {
                expected: self.checksum_data,
                computed,
            });
        }
        Ok(())
    }

    fn prefix_bytes(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..2].copy_from_slice(&self.format_version.to_le_bytes());
        out[2..4].copy_from_slice(&self.protocol_version.to_le_bytes());
        out[4..6].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[6..8].copy_from_slice(&self.data_length.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum_data.to_le_bytes());
        out
    }
}

/// The 8-byte header leading every packet in a transfer body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Request-type id (see [`crate::request`]).
    pub request_type: u16,
    /// Per-direction packet id.
    pub id: u16,
    /// Payload length, excluding padding.
    pub length: u16,
    /// Id of a packet the sender wants re-emitted, or 0.
    pub resend_packet_id: u16,
}

impl PacketHeader {
    /// Serialises into the fixed wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0..2].copy_from_slice(&self.request_type.to_le_bytes());
        out[2..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..6].copy_from_slice(&self.length.to_le_bytes());
        out[6..8].copy_from_slice(&self.resend_packet_id.to_le_bytes());
        out
    }

    /// Parses a packet header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BufferTooShort`] if fewer than 8 bytes remain.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < PACKET_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                needed: PACKET_HEADER_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            request_type: u16::from_le_bytes([buf[0], buf[1]]),
            id: u16::from_le_bytes([buf[2], buf[3]]),
            length: u16::from_le_bytes([buf[4], buf[5]]),
            resend_packet_id: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// Appends a packet (header, payload, padding) to a transfer body.
pub fn write_packet(
    out: &mut Vec<u8>,
    request_type: u16,
    id: u16,
    resend_packet_id: u16,
    payload: &[u8],
) {
    let header = PacketHeader {
        request_type,
        id,
        length: payload.len() as u16,
        resend_packet_id,
    };
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out.resize(out.len() + padded_len(payload.len()) - payload.len(), 0);
}

/// Splits a transfer body into its packets.
///
/// # Errors
///
/// Returns [`WireError::BufferTooShort`] if a packet header advertises
/// more payload than remains in the buffer.
pub fn parse_packets(body: &[u8]) -> Result<Vec<(PacketHeader, &[u8])>, WireError> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        let header = PacketHeader::decode(&body[offset..])?;
        offset += PACKET_HEADER_LEN;
        let len = header.length as usize;
        if offset + len > body.len() {
            return Err(WireError::BufferTooShort {
                needed: len,
                actual: body.len() - offset,
            });
        }
        packets.push((header, &body[offset..offset + len]));
        offset += padded_len(len);
    }
    Ok(packets)
}
