//! Packet router - demultiplexes inbound packets and assembles
//! outbound transfers.
//!
//! Ingress switches on the closed [`FirmwareRequest`] enumeration and
//! forwards each packet to its owner: object-model patches to the
//! store (the router is the store's only writer), code replies to the
//! channel processors, job events to the job service. A packet that
//! fails to decode after a successful CRC is a protocol violation:
//! logged and dropped, the channel otherwise unaffected.
//!
//! Egress fills each transfer body in priority order - resends first,
//! then control packets, then per-channel codes via
//! [`CodeChannel::PRIORITY`] - under the per-direction byte budget.

use crate::model::ObjectModelStore;
use crate::processor::ChannelProcessor;
use crate::transfer::TransferHandle;
use gantry_types::{CodeChannel, DaemonError, MessageSeverity, PauseReason};
use gantry_wire::{
    padded_len, parse_packets, write_packet, AbortFilePayload, CodeReplyPayload,
    ExecuteMacroPayload, FirmwareRequest, MessagePayload, ObjectModelPatch, PacketHeader,
    PrintPausedPayload, SbcRequest, StackEventPayload, StateReport, WireError, MAX_BODY_LEN,
    PACKET_HEADER_LEN,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Outbound packets retained for firmware resend requests.
const SENT_CACHE_CAP: usize = 128;

/// A non-code packet bound for the firmware, produced by channel
/// processors and the job service.
#[derive(Debug)]
pub struct OutboundControl {
    /// Request type of the packet.
    pub request: SbcRequest,
    /// Encoded packet body.
    pub payload: Vec<u8>,
}

/// Firmware-driven job transitions, forwarded to the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The firmware paused the running job.
    FirmwarePaused {
        /// Byte offset where execution actually stopped.
        position: u64,
        /// Why the firmware paused.
        reason: PauseReason,
    },
    /// The firmware aborted the job outright.
    AbortJob,
}

/// The full set of channel processors, shared across components.
pub struct ChannelSet {
    processors: [Arc<ChannelProcessor>; CodeChannel::COUNT],
}

impl ChannelSet {
    /// Builds one processor per channel over shared services.
    #[must_use]
    pub fn new(
        correlator: &Arc<crate::correlator::CodeCorrelator>,
        macro_stack: &Arc<crate::macro_stack::MacroStack>,
        control_tx: &mpsc::UnboundedSender<OutboundControl>,
    ) -> Self {
        Self {
            processors: CodeChannel::ALL.map(|channel| {
                Arc::new(ChannelProcessor::new(
                    channel,
                    Arc::clone(correlator),
                    Arc::clone(macro_stack),
                    control_tx.clone(),
                ))
            }),
        }
    }

    /// The processor owning `channel`.
    #[must_use]
    pub fn get(&self, channel: CodeChannel) -> &Arc<ChannelProcessor> {
        &self.processors[channel as usize]
    }

    /// Iterates processors in wire-id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChannelProcessor>> {
        self.processors.iter()
    }
}

struct SentPacket {
    id: u16,
    request_type: u16,
    payload: Vec<u8>,
}

/// Ingress/egress multiplexer between channel processors and the
/// transfer engine.
pub struct PacketRouter {
    channels: Arc<ChannelSet>,
    model: Arc<ObjectModelStore>,
    transfer: TransferHandle,
    control_rx: mpsc::UnboundedReceiver<OutboundControl>,
    /// Control packet that did not fit the previous cycle.
    pending_control: Option<OutboundControl>,
    job_events: mpsc::UnboundedSender<JobEvent>,
    cancel: CancellationToken,
    next_packet_id: u16,
    sent_cache: VecDeque<SentPacket>,
    resend_queue: VecDeque<SentPacket>,
}

impl PacketRouter {
    /// Creates a router over the given services.
    #[must_use]
    pub fn new(
        channels: Arc<ChannelSet>,
        model: Arc<ObjectModelStore>,
        transfer: TransferHandle,
        control_rx: mpsc::UnboundedReceiver<OutboundControl>,
        job_events: mpsc::UnboundedSender<JobEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channels,
            model,
            transfer,
            control_rx,
            pending_control: None,
            job_events,
            cancel,
            next_packet_id: 0,
            sent_cache: VecDeque::new(),
            resend_queue: VecDeque::new(),
        }
    }

    /// Runs transfer cycles until cancelled or the link is lost.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::LinkFailure`] when the transfer engine
    /// exhausts its resync budget; no other error escapes.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        info!("packet router started");
        loop {
            let outbound = self.assemble_egress().await;
            let inbound = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("packet router stopping");
                    return Ok(());
                }
                result = self.transfer.exchange(outbound) => result?,
            };
            self.dispatch(&inbound).await;
        }
    }

    /// Fills one outbound body under the byte budget.
    async fn assemble_egress(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut budget = MAX_BODY_LEN;

        // Resend requests jump the queue.
        while let Some(front) = self.resend_queue.front() {
            let framed = PACKET_HEADER_LEN + padded_len(front.payload.len());
            if framed > budget {
                break;
            }
            if let Some(packet) = self.resend_queue.pop_front() {
                write_packet(&mut body, packet.request_type, packet.id, 0, &packet.payload);
                budget -= framed;
            }
        }

        // Control packets (macro completions, job notifications).
        loop {
            let control = match self.pending_control.take() {
                Some(control) => control,
                None => match self.control_rx.try_recv() {
                    Ok(control) => control,
                    Err(_) => break,
                },
            };
            let framed = PACKET_HEADER_LEN + padded_len(control.payload.len());
            if framed > budget {
                self.pending_control = Some(control);
                break;
            }
            let id = self.allocate_packet_id();
            write_packet(
                &mut body,
                control.request.wire_id(),
                id,
                0,
                &control.payload,
            );
            self.remember(id, control.request.wire_id(), control.payload);
            budget -= framed;
        }

        // Per-channel codes, fixed priority order, macro codes first
        // within each channel.
        for channel in CodeChannel::PRIORITY {
            if budget <= PACKET_HEADER_LEN {
                break;
            }
            let codes = self.channels.get(channel).take_packets(&mut budget).await;
            for code in codes {
                let id = self.allocate_packet_id();
                write_packet(&mut body, SbcRequest::Code.wire_id(), id, 0, &code.bytes);
                self.remember(id, SbcRequest::Code.wire_id(), code.bytes);
            }
        }

        trace!(len = body.len(), "egress assembled");
        body
    }

    /// Demultiplexes one inbound body.
    async fn dispatch(&mut self, inbound: &[u8]) {
        let packets = match parse_packets(inbound) {
            Ok(packets) => packets,
            Err(err) => {
                warn!(%err, "malformed inbound body dropped");
                return;
            }
        };

        for (header, payload) in packets {
            match FirmwareRequest::try_from(header.request_type) {
                Ok(request) => self.handle_packet(request, header, payload).await,
                Err(err) => warn!(%err, id = header.id, "unknown inbound packet dropped"),
            }
        }
    }

    async fn handle_packet(&mut self, request: FirmwareRequest, header: PacketHeader, payload: &[u8]) {
        let outcome: Result<(), WireError> = match request {
            FirmwareRequest::StateReport => self.on_state_report(payload),
            FirmwareRequest::ObjectModel => self.on_object_model(payload).await,
            FirmwareRequest::CodeReply => self.on_code_reply(payload),
            FirmwareRequest::ExecuteMacro => self.on_execute_macro(payload).await,
            FirmwareRequest::AbortFile => self.on_abort_file(payload).await,
            FirmwareRequest::StackEvent => self.on_stack_event(payload),
            FirmwareRequest::PrintPaused => self.on_print_paused(payload),
            FirmwareRequest::Message => self.on_message(payload),
            FirmwareRequest::EvaluationResult => self.on_evaluation_result(payload),
            FirmwareRequest::ResendPacket => {
                self.on_resend(header.resend_packet_id);
                Ok(())
            }
        };
        if let Err(err) = outcome {
            // CRC already passed, so this is a firmware-side framing bug.
            warn!(?request, %err, "protocol violation, packet dropped");
        }
    }

    fn on_state_report(&self, payload: &[u8]) -> Result<(), WireError> {
        let report = StateReport::decode(payload)?;
        for channel in CodeChannel::ALL {
            self.channels
                .get(channel)
                .update_buffer_space(report.buffer_space[channel as usize]);
        }
        Ok(())
    }

    async fn on_object_model(&self, payload: &[u8]) -> Result<(), WireError> {
        let patch = ObjectModelPatch::decode(payload)?;
        let value: serde_json::Value = serde_json::from_slice(&patch.data)
            .map_err(|_| WireError::BadString("object model payload"))?;
        self.model.apply_patch(&patch.path, value).await;
        Ok(())
    }

    fn on_code_reply(&self, payload: &[u8]) -> Result<(), WireError> {
        let reply = CodeReplyPayload::decode(payload)?;
        self.channels.get(reply.channel).handle_reply(&reply);
        Ok(())
    }

    async fn on_execute_macro(&self, payload: &[u8]) -> Result<(), WireError> {
        let request = ExecuteMacroPayload::decode(payload)?;
        self.channels
            .get(request.channel)
            .handle_macro_request(&request.filename, request.report_missing)
            .await;
        Ok(())
    }

    async fn on_abort_file(&self, payload: &[u8]) -> Result<(), WireError> {
        let abort = AbortFilePayload::decode(payload)?;
        self.channels.get(abort.channel).abort_file(abort.abort_all).await;
        if abort.abort_all && abort.channel == CodeChannel::File {
            let _ = self.job_events.send(JobEvent::AbortJob);
        }
        Ok(())
    }

    fn on_stack_event(&self, payload: &[u8]) -> Result<(), WireError> {
        let event = StackEventPayload::decode(payload)?;
        self.channels
            .get(event.channel)
            .update_stack_depth(event.depth);
        Ok(())
    }

    fn on_print_paused(&self, payload: &[u8]) -> Result<(), WireError> {
        let paused = PrintPausedPayload::decode(payload)?;
        let _ = self.job_events.send(JobEvent::FirmwarePaused {
            position: u64::from(paused.file_position),
            reason: paused.reason,
        });
        Ok(())
    }

    fn on_message(&self, payload: &[u8]) -> Result<(), WireError> {
        let message = MessagePayload::decode(payload)?;
        match message.severity {
            MessageSeverity::Info => info!(target: "firmware", "{}", message.content),
            MessageSeverity::Warning => warn!(target: "firmware", "{}", message.content),
            MessageSeverity::Error => error!(target: "firmware", "{}", message.content),
        }
        Ok(())
    }

    fn on_evaluation_result(&self, payload: &[u8]) -> Result<(), WireError> {
        let reply = CodeReplyPayload::decode(payload)?;
        self.channels
            .get(reply.channel)
            .handle_evaluation(reply.severity, &reply.content);
        Ok(())
    }

    fn on_resend(&mut self, packet_id: u16) {
        match self
            .sent_cache
            .iter()
            .find(|packet| packet.id == packet_id)
        {
            Some(packet) => {
                debug!(packet_id, "firmware requested resend");
                self.resend_queue.push_back(SentPacket {
                    id: packet.id,
                    request_type: packet.request_type,
                    payload: packet.payload.clone(),
                });
            }
            None => warn!(packet_id, "resend requested for unknown packet"),
        }
    }

    fn allocate_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn remember(&mut self, id: u16, request_type: u16, payload: Vec<u8>) {
        self.sent_cache.push_back(SentPacket {
            id,
            request_type,
            payload,
        });
        while self.sent_cache.len() > SENT_CACHE_CAP {
            self.sent_cache.pop_front();
        }
    }
}
