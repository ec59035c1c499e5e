//! Shared test fixtures: an in-process firmware model behind the
//! `SpiLink` trait, plus daemon config helpers.
//!
//! The model implements the firmware's half of the wire protocol: it
//! advertises buffer space every cycle, acknowledges codes, can request
//! macros for `M98`, and can corrupt its own frames to exercise the
//! retry and resync paths.

use gantry_runtime::{GantryConfig, SpiLink};
use gantry_types::{CodeChannel, MessageSeverity};
use gantry_wire::{
    parse_packets, write_packet, CodeReplyPayload, ExecuteMacroPayload, FirmwareRequest,
    SbcRequest, StateReport, TransferHeader, TRANSFER_HEADER_LEN,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// One code packet the firmware saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCode {
    pub channel: u8,
    pub letter: u8,
    pub major: i32,
    pub code_id: u16,
    pub file_position: u32,
}

#[derive(Default)]
struct FirmwareState {
    /// Packets queued for the next firmware frame.
    outbox: Vec<(u16, Vec<u8>)>,
    /// Every distinct code packet, in arrival order.
    codes_seen: Vec<SeenCode>,
    /// Code ids acknowledged, in order.
    acks_sent: Vec<u16>,
    /// Packet ids already processed (resend dedup).
    seen_packet_ids: HashSet<u16>,
    /// Code packets received more than once (SBC-side resends).
    duplicate_code_packets: usize,
    /// Control packets received, by request type.
    controls_seen: Vec<u16>,
    /// Acknowledge codes automatically with an empty final reply.
    auto_ack: bool,
    /// Corrupt the next inbound body of a cycle that carries SBC data.
    corrupt_next_data_body: bool,
    /// Emit permanently broken headers (link-loss scenario).
    kill_link: bool,
    /// Macro filename to request when an M98 arrives.
    macro_file: Option<String>,
    /// M98 waiting for its macro to complete: (channel, code id).
    pending_macro_ack: Option<(u8, u16)>,
    buffer_space: u16,
    next_packet_id: u16,
}

impl FirmwareState {
    fn allocate_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        self.next_packet_id
    }

    fn queue_ack(&mut self, channel: u8, code_id: u16) {
        self.acks_sent.push(code_id);
        let reply = CodeReplyPayload {
            channel: CodeChannel::try_from(channel).unwrap_or(CodeChannel::File),
            severity: MessageSeverity::Info,
            flags: 0,
            code_id,
            content: String::new(),
        };
        self.outbox
            .push((FirmwareRequest::CodeReply.wire_id(), reply.encode()));
    }

    fn process_sbc_packet(&mut self, id: u16, request_type: u16, payload: &[u8]) {
        if !self.seen_packet_ids.insert(id) {
            if request_type == SbcRequest::Code.wire_id() {
                self.duplicate_code_packets += 1;
            }
            return;
        }

        if request_type == SbcRequest::Code.wire_id() {
            let code = SeenCode {
                channel: payload[0],
                letter: payload[1],
                major: i32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
                code_id: u16::from_le_bytes([payload[4], payload[5]]),
                file_position: u32::from_le_bytes([
                    payload[16],
                    payload[17],
                    payload[18],
                    payload[19],
                ]),
            };

            let is_macro_call = code.letter == b'M' && code.major == 98;
            if is_macro_call {
                if let Some(filename) = self.macro_file.clone() {
                    self.pending_macro_ack = Some((code.channel, code.code_id));
                    let request = ExecuteMacroPayload {
                        channel: CodeChannel::try_from(code.channel)
                            .unwrap_or(CodeChannel::File),
                        report_missing: true,
                        filename,
                    };
                    self.outbox
                        .push((FirmwareRequest::ExecuteMacro.wire_id(), request.encode()));
                    self.codes_seen.push(code);
                    return;
                }
            }

            if self.auto_ack {
                self.queue_ack(code.channel, code.code_id);
            }
            self.codes_seen.push(code);
        } else {
            self.controls_seen.push(request_type);
            if request_type == SbcRequest::MacroCompleted.wire_id() {
                if let Some((channel, code_id)) = self.pending_macro_ack.take() {
                    self.queue_ack(channel, code_id);
                }
            }
        }
    }
}

/// Test-side handle to the firmware model.
#[derive(Clone)]
pub struct FirmwareControl {
    state: Arc<Mutex<FirmwareState>>,
}

impl FirmwareControl {
    pub fn set_auto_ack(&self, on: bool) {
        self.state.lock().unwrap().auto_ack = on;
    }

    pub fn set_macro_file(&self, filename: &str) {
        self.state.lock().unwrap().macro_file = Some(filename.to_owned());
    }

    /// Corrupts the inbound body of the next cycle that carries SBC
    /// packets.
    pub fn arm_body_corruption(&self) {
        self.state.lock().unwrap().corrupt_next_data_body = true;
    }

    pub fn kill_link(&self) {
        self.state.lock().unwrap().kill_link = true;
    }

    /// Queues a firmware-initiated packet for the next cycle.
    pub fn inject(&self, request: FirmwareRequest, payload: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .outbox
            .push((request.wire_id(), payload));
    }

    pub fn codes_seen(&self) -> Vec<SeenCode> {
        self.state.lock().unwrap().codes_seen.clone()
    }

    pub fn acks_sent(&self) -> Vec<u16> {
        self.state.lock().unwrap().acks_sent.clone()
    }

    pub fn duplicate_code_packets(&self) -> usize {
        self.state.lock().unwrap().duplicate_code_packets
    }

    pub fn controls_seen(&self) -> Vec<u16> {
        self.state.lock().unwrap().controls_seen.clone()
    }
}

enum Phase {
    Header,
    Body { fw_body: Vec<u8>, sbc_len: usize },
}

/// The firmware's side of the SPI link.
pub struct FirmwareLink {
    state: Arc<Mutex<FirmwareState>>,
    phase: Phase,
    sequence: u16,
}

/// Builds a connected (link, control) pair.
pub fn firmware_pair() -> (FirmwareLink, FirmwareControl) {
    let state = Arc::new(Mutex::new(FirmwareState {
        auto_ack: true,
        buffer_space: 1500,
        ..FirmwareState::default()
    }));
    (
        FirmwareLink {
            state: Arc::clone(&state),
            phase: Phase::Header,
            sequence: 0,
        },
        FirmwareControl { state },
    )
}

impl SpiLink for FirmwareLink {
    type Error = String;

    fn set_ready(&mut self, _ready: bool) -> Result<(), String> {
        Ok(())
    }

    fn wait_partner_ready(&mut self, _timeout: Duration) -> Result<bool, String> {
        // Pace the exchange loop so tests do not spin a core.
        std::thread::sleep(Duration::from_micros(200));
        Ok(true)
    }

    fn toggle_direction(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut self.phase, Phase::Header) {
            Phase::Header => {
                assert_eq!(tx.len(), TRANSFER_HEADER_LEN, "unexpected transfer phase");
                let sbc_len = usize::from(u16::from_le_bytes([tx[6], tx[7]]));

                // Assemble this cycle's firmware frame: a state report,
                // then everything queued.
                let mut body = Vec::new();
                let report = StateReport {
                    buffer_space: [state.buffer_space; CodeChannel::COUNT],
                };
                let id = state.allocate_packet_id();
                write_packet(
                    &mut body,
                    FirmwareRequest::StateReport.wire_id(),
                    id,
                    0,
                    &report.encode(),
                );
                for (request_type, payload) in std::mem::take(&mut state.outbox) {
                    let id = state.allocate_packet_id();
                    write_packet(&mut body, request_type, id, 0, &payload);
                }

                let mut header = TransferHeader::for_body(self.sequence, &body).encode();
                if state.kill_link {
                    // Permanent header corruption: the SBC never sees a
                    // valid frame again.
                    header[4] ^= 0x01;
                    rx[..TRANSFER_HEADER_LEN].copy_from_slice(&header);
                    return Ok(());
                }
                rx[..TRANSFER_HEADER_LEN].copy_from_slice(&header);
                self.sequence = self.sequence.wrapping_add(1);
                self.phase = Phase::Body {
                    fw_body: body,
                    sbc_len,
                };
                Ok(())
            }
            Phase::Body { fw_body, sbc_len } => {
                rx[..fw_body.len()].copy_from_slice(&fw_body);

                // Full duplex: the firmware received its copy of the
                // SBC packets regardless of what the SBC makes of ours.
                let packets = parse_packets(&tx[..sbc_len]).map_err(|e| e.to_string())?;
                for (header, payload) in packets {
                    state.process_sbc_packet(header.id, header.request_type, payload);
                }

                if state.corrupt_next_data_body && sbc_len > 0 {
                    state.corrupt_next_data_body = false;
                    rx[0] ^= 0xFF;
                    // The SBC rolls this cycle back and never sees our
                    // frame; requeue the packets for the retry cycle.
                    let packets = parse_packets(&fw_body).map_err(|e| e.to_string())?;
                    for (header, payload) in packets.iter().skip(1) {
                        state
                            .outbox
                            .push((header.request_type, payload.to_vec()));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Daemon config pointing at a temp directory, with test-fast SPI
/// timings.
pub fn test_config(dir: &TempDir) -> GantryConfig {
    let mut config = GantryConfig::default();
    config.spi.handshake_timeout_ms = 1000;
    config.spi.resync_holdoff_ms = 1;
    config.paths.macro_dir = dir.path().to_path_buf();
    config.paths.state_file = dir.path().join("plugins.txt");
    config
}

/// Writes a job or macro file under the temp directory.
pub fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}
