//! Binary encoding of codes for the firmware.
//!
//! A code packet body is a 20-byte header, one 8-byte slot per
//! parameter, then an overflow area holding string bytes:
//!
//! ```text
//! offset  field            type
//! 0       channel          u8
//! 1       letter           u8    ASCII 'G'/'M'/'T'
//! 2       flags            u8    bit 0: no file position
//! 3       param_count      u8
//! 4       code_id          u16   per-channel correlation id
//! 6       (reserved)       u16
//! 8       major            i32   -1 when absent
//! 12      minor            i32   -1 when absent
//! 16      file_position    u32   0xFFFF_FFFF when absent
//! 20      parameter slots  8 bytes each
//! …       string overflow  bytes of string parameters, in order
//! ```
//!
//! The firmware echoes `code_id` in every code reply for that code;
//! packet-header ids are a separate per-direction counter used only for
//! resend requests.
//!
//! A parameter slot is `letter:u8, kind:u8, _pad:u16` plus a 4-byte
//! value; string parameters store their byte length in the slot and
//! append the bytes to the overflow area.

use gantry_types::{Code, ParamValue};

/// Value-kind ids used in parameter slots.
const KIND_INT: u8 = 0;
const KIND_UINT: u8 = 1;
const KIND_FLOAT: u8 = 2;
const KIND_STRING: u8 = 3;

/// Flag: the code has no source-file position.
const FLAG_NO_FILE_POSITION: u8 = 0x01;

/// Returns the encoded body length of a code without encoding it.
///
/// Channel processors use this for buffer-space accounting before an
/// id is allocated.
#[must_use]
pub fn encoded_len(code: &Code) -> usize {
    let strings: usize = code
        .parameters
        .iter()
        .map(|p| match &p.value {
            ParamValue::Text(v) => v.len(),
            _ => 0,
        })
        .sum();
    20 + 8 * code.parameters.len() + strings
}

/// Encodes an executable code into its packet body.
///
/// Comments and blank lines never reach the firmware; callers complete
/// them locally.
#[must_use]
pub fn encode_code(code: &Code, code_id: u16) -> Vec<u8> {
    debug_assert!(code.is_executable(), "only executable codes are encoded");

    let mut out = Vec::with_capacity(20 + 8 * code.parameters.len());
    out.push(code.channel.wire_id());
    out.push(code.kind.letter().map_or(0, |l| l as u8));
    out.push(if code.file_offset.is_none() {
        FLAG_NO_FILE_POSITION
    } else {
        0
    });
    out.push(code.parameters.len() as u8);
    out.extend_from_slice(&code_id.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&code.major.unwrap_or(-1).to_le_bytes());
    out.extend_from_slice(&i32::from(code.minor.unwrap_or(-1)).to_le_bytes());
    out.extend_from_slice(
        &code
            .file_offset
            .map_or(u32::MAX, |o| o as u32)
            .to_le_bytes(),
    );

    let mut overflow = Vec::new();
    for param in &code.parameters {
        out.push(param.letter as u8);
        match &param.value {
            ParamValue::Int(v) => {
                out.push(KIND_INT);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ParamValue::Uint(v) => {
                out.push(KIND_UINT);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ParamValue::Float(v) => {
                out.push(KIND_FLOAT);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ParamValue::Text(v) => {
                out.push(KIND_STRING);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                overflow.extend_from_slice(v.as_bytes());
            }
        }
    }
    out.extend_from_slice(&overflow);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::{CodeChannel, CodeKind, CodeParameter};

    fn g1_x10() -> Code {
        let mut code = Code::new(CodeKind::G, 1, CodeChannel::File);
        code.parameters.push(CodeParameter {
            letter: 'X',
            value: ParamValue::Float(10.0),
        });
        code
    }

    #[test]
    fn header_layout() {
        let mut code = g1_x10();
        code.file_offset = Some(256);
        let bytes = encode_code(&code, 0x0105);

        assert_eq!(bytes[0], CodeChannel::File.wire_id());
        assert_eq!(bytes[1], b'G');
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[4..6], &0x0105u16.to_le_bytes());
        assert_eq!(&bytes[8..12], &1i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[16..20], &256u32.to_le_bytes());
    }

    #[test]
    fn missing_file_position_sets_flag() {
        let bytes = encode_code(&g1_x10(), 1);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(&bytes[16..20], &u32::MAX.to_le_bytes());
    }

    #[test]
    fn float_parameter_slot() {
        let bytes = encode_code(&g1_x10(), 1);
        assert_eq!(bytes.len(), 28);
        assert_eq!(bytes[20], b'X');
        assert_eq!(bytes[21], 2);
        assert_eq!(&bytes[24..28], &10.0f32.to_le_bytes());
    }

    #[test]
    fn string_parameter_goes_to_overflow() {
        let mut code = Code::new(CodeKind::M, 98, CodeChannel::File);
        code.parameters.push(CodeParameter {
            letter: 'P',
            value: ParamValue::Text("foo.g".into()),
        });
        let bytes = encode_code(&code, 1);

        // Slot holds the byte length, overflow holds the bytes.
        assert_eq!(bytes[20], b'P');
        assert_eq!(bytes[21], 3);
        assert_eq!(&bytes[24..28], &5u32.to_le_bytes());
        assert_eq!(&bytes[28..], b"foo.g");
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let mut code = Code::new(CodeKind::M, 98, CodeChannel::File);
        code.parameters.push(CodeParameter {
            letter: 'P',
            value: ParamValue::Text("foo.g".into()),
        });
        assert_eq!(encoded_len(&code), encode_code(&code, 1).len());
        assert_eq!(encoded_len(&g1_x10()), encode_code(&g1_x10(), 1).len());
    }

    #[test]
    fn mixed_parameters_keep_order() {
        let mut code = Code::new(CodeKind::M, 587, CodeChannel::Http);
        code.parameters.push(CodeParameter {
            letter: 'S',
            value: ParamValue::Text("ssid".into()),
        });
        code.parameters.push(CodeParameter {
            letter: 'I',
            value: ParamValue::Int(-4),
        });
        let bytes = encode_code(&code, 9);

        assert_eq!(bytes[3], 2);
        assert_eq!(bytes[20], b'S');
        assert_eq!(bytes[28], b'I');
        assert_eq!(&bytes[32..36], &(-4i32).to_le_bytes());
        assert_eq!(&bytes[36..], b"ssid");
    }
}
