//! Channel processors - per-channel code pipelines.
//!
//! One [`ChannelProcessor`] exists per [`CodeChannel`]. It owns the
//! channel's queues and drives the code lifecycle:
//!
//! ```text
//! Queued ──emit──► In flight ──final reply──► Completed
//!    │                  │
//!    └── invalidate ────┴──────────────────► Cancelled
//! ```
//!
//! Macro codes live in a separate queue that always drains before plain
//! codes. A code that opens a macro keeps a single-slot "macro pending"
//! marker: its completion is withheld until the macro's last frame pops,
//! even if its own final reply arrived earlier.
//!
//! # Buffer Accounting
//!
//! The firmware advertises free buffer bytes per channel every cycle.
//! The processor mirrors that value, refuses to emit a code longer than
//! the mirror, and decrements it on every emit; the next state report
//! refreshes it.

use crate::correlator::{CodeCompletion, CodeCorrelator};
use crate::macro_stack::MacroStack;
use crate::router::OutboundControl;
use gantry_types::{Code, CodeChannel, CodeResult, DaemonError, MessageSeverity};
use gantry_wire::{
    encode_code, encoded_len, padded_len, CodeReplyPayload, MacroCompletedPayload, SbcRequest,
    PACKET_HEADER_LEN,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Cap on codes waiting in a channel's local queue; `queue()` suspends
/// once it is reached.
const MAX_QUEUED_CODES: usize = 64;

type CompletionSender = oneshot::Sender<Result<CodeResult, DaemonError>>;

/// A code emitted this cycle, ready for framing by the router.
pub struct EncodedCode {
    /// Correlation id carried in the code body.
    pub code_id: u16,
    /// Encoded packet body.
    pub bytes: Vec<u8>,
}

struct QueuedCode {
    code: Code,
    tx: CompletionSender,
}

struct InFlightCode {
    id: u16,
    result: CodeResult,
    last_push: bool,
    /// Set when this code opened a macro that is still running.
    macro_pending: bool,
    /// Final reply already arrived while the macro was still open.
    finished: bool,
}

#[derive(Default)]
struct Inner {
    queued: VecDeque<QueuedCode>,
    macro_queued: VecDeque<QueuedCode>,
    in_flight: VecDeque<InFlightCode>,
    buffer_space: u16,
    stack_depth: u8,
    macro_active: bool,
}

impl Inner {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.macro_queued.is_empty() && self.in_flight.is_empty()
    }
}

/// Per-channel code pipeline.
pub struct ChannelProcessor {
    channel: CodeChannel,
    correlator: Arc<CodeCorrelator>,
    macro_stack: Arc<MacroStack>,
    control_tx: mpsc::UnboundedSender<OutboundControl>,
    inner: Mutex<Inner>,
    queue_space: Notify,
    drained: Notify,
}

impl ChannelProcessor {
    /// Creates a processor for `channel`.
    ///
    /// `control_tx` carries non-code packets (macro completions) into
    /// the router's egress queue.
    #[must_use]
    pub fn new(
        channel: CodeChannel,
        correlator: Arc<CodeCorrelator>,
        macro_stack: Arc<MacroStack>,
        control_tx: mpsc::UnboundedSender<OutboundControl>,
    ) -> Self {
        Self {
            channel,
            correlator,
            macro_stack,
            control_tx,
            inner: Mutex::new(Inner::default()),
            queue_space: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// The channel this processor owns.
    #[must_use]
    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    /// Queues a code for emission, suspending while the local queue is
    /// full.
    ///
    /// Non-executable codes (comments, blank lines) complete immediately
    /// with an empty result; they never reach the firmware.
    pub async fn queue(&self, code: Code) -> CodeCompletion {
        let (tx, rx) = oneshot::channel();
        let completion = CodeCompletion::from_receiver(rx);

        if !code.is_executable() {
            let _ = tx.send(Ok(CodeResult::new()));
            return completion;
        }

        loop {
            let notified = self.queue_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.queued.len() < MAX_QUEUED_CODES {
                    inner.queued.push_back(QueuedCode { code, tx });
                    return completion;
                }
            }
            notified.await;
        }
    }

    /// Waits until every queued and in-flight code on this channel has
    /// completed.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drains every queued and in-flight code with a cancellation
    /// failure, aborts all open macros, and tells the firmware to
    /// discard whatever it still has buffered for this channel.
    pub async fn invalidate(&self) {
        let drained: Vec<CompletionSender> = {
            let mut inner = self.inner.lock();
            inner.macro_active = false;
            inner.in_flight.clear();
            let macro_queued: Vec<CompletionSender> =
                inner.macro_queued.drain(..).map(|q| q.tx).collect();
            let queued: Vec<CompletionSender> = inner.queued.drain(..).map(|q| q.tx).collect();
            macro_queued.into_iter().chain(queued).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(DaemonError::CodeCancelled));
        }
        self.correlator.invalidate(self.channel);
        self.macro_stack.abort_all(self.channel).await;
        let _ = self.control_tx.send(OutboundControl {
            request: SbcRequest::InvalidateChannel,
            payload: vec![self.channel.wire_id(), 0, 0, 0],
        });
        self.queue_space.notify_waiters();
        self.drained.notify_waiters();
        debug!(channel = %self.channel, "channel invalidated");
    }

    /// Refreshes the firmware buffer-space mirror from a state report.
    pub fn update_buffer_space(&self, space: u16) {
        self.inner.lock().buffer_space = space;
    }

    /// Records a firmware-side stack depth change.
    pub fn update_stack_depth(&self, depth: u8) {
        self.inner.lock().stack_depth = depth;
    }

    /// Handles a firmware request to run a macro on this channel.
    ///
    /// Marks the oldest unfinished in-flight code as the macro's opener;
    /// its completion is withheld until the macro finishes. A missing
    /// file reports back to the firmware when `report_missing` is set.
    pub async fn handle_macro_request(&self, filename: &str, report_missing: bool) {
        match self.macro_stack.push(self.channel, filename).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.macro_active = true;
                if let Some(entry) = inner
                    .in_flight
                    .iter_mut()
                    .find(|e| !e.finished && !e.macro_pending)
                {
                    entry.macro_pending = true;
                }
            }
            Err(err) => {
                warn!(channel = %self.channel, filename, %err, "macro open failed");
                if report_missing {
                    self.send_macro_completed(true);
                }
            }
        }
    }

    /// Routes a code reply into the matching in-flight entry.
    ///
    /// Push replies accumulate; the final reply completes the code
    /// unless a macro it opened is still running.
    pub fn handle_reply(&self, reply: &CodeReplyPayload) {
        let completed = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.in_flight.iter().position(|e| e.id == reply.code_id) else {
                debug!(
                    channel = %self.channel,
                    code_id = reply.code_id,
                    "reply for unknown code dropped"
                );
                return;
            };

            let entry = &mut inner.in_flight[index];
            let continues = entry.last_push;
            entry.result.append(reply.severity, &reply.content, continues);
            entry.last_push = reply.is_push();

            if reply.is_push() {
                None
            } else if entry.macro_pending {
                entry.finished = true;
                None
            } else {
                inner
                    .in_flight
                    .remove(index)
                    .map(|e| (e.id, e.result, inner.is_idle()))
            }
        };

        if let Some((id, result, idle)) = completed {
            self.correlator.complete(self.channel, id, Ok(result));
            if idle {
                self.drained.notify_waiters();
            }
        }
    }

    /// Attaches an expression-evaluation result to the oldest unfinished
    /// in-flight code.
    pub fn handle_evaluation(&self, severity: MessageSeverity, content: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.in_flight.iter_mut().find(|e| !e.finished) {
            entry.result.append(severity, content, false);
        } else {
            debug!(channel = %self.channel, "evaluation result with no code in flight");
        }
    }

    /// Discards the current code; with `abort_all`, discards everything
    /// on the channel.
    pub async fn abort_file(&self, abort_all: bool) {
        if abort_all {
            self.invalidate().await;
            return;
        }
        self.macro_stack.abort_last(self.channel).await;
        let completed = {
            let mut inner = self.inner.lock();
            inner
                .in_flight
                .pop_front()
                .map(|e| (e.id, inner.is_idle()))
        };
        if let Some((id, idle)) = completed {
            self.correlator
                .complete(self.channel, id, Err(DaemonError::CodeCancelled));
            if idle {
                self.drained.notify_waiters();
            }
        }
    }

    /// Drops in-flight bookkeeping for a code the correlator expired.
    pub fn forget(&self, code_id: u16) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.in_flight.iter().position(|e| e.id == code_id) {
            inner.in_flight.remove(index);
        }
        if inner.is_idle() {
            self.drained.notify_waiters();
        }
    }

    /// Pulls codes for this cycle, macro codes first, until the byte
    /// budget or the buffer-space mirror is exhausted.
    ///
    /// `budget` is decremented by the framed size of every emitted
    /// packet.
    pub async fn take_packets(&self, budget: &mut usize) -> Vec<EncodedCode> {
        self.pump_macro_codes().await;

        let mut out = Vec::new();
        loop {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let buffer_space = inner.buffer_space as usize;
            let queue = if inner.macro_queued.is_empty() {
                &mut inner.queued
            } else {
                &mut inner.macro_queued
            };
            let Some(front) = queue.front() else {
                break;
            };

            let body_len = encoded_len(&front.code);
            let framed = PACKET_HEADER_LEN + padded_len(body_len);
            if framed > *budget || body_len > buffer_space {
                break;
            }

            let Some(queued) = queue.pop_front() else {
                break;
            };
            let id = self.correlator.insert(self.channel, queued.tx);
            let bytes = encode_code(&queued.code, id);
            inner.buffer_space -= body_len as u16;
            inner.in_flight.push_back(InFlightCode {
                id,
                result: CodeResult::new(),
                last_push: false,
                macro_pending: false,
                finished: false,
            });
            *budget -= framed;
            drop(guard);

            self.queue_space.notify_waiters();
            out.push(EncodedCode { code_id: id, bytes });
        }
        out
    }

    /// Diagnostic snapshot of this channel's queues.
    #[must_use]
    pub fn diagnostics(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "queued": inner.queued.len(),
            "macroQueued": inner.macro_queued.len(),
            "inFlight": inner.in_flight.len(),
            "bufferSpace": inner.buffer_space,
            "stackDepth": inner.stack_depth,
        })
    }

    /// Reads macro codes from the stack until one is ready or the stack
    /// drains, handling frame pops along the way.
    async fn pump_macro_codes(&self) {
        loop {
            {
                let inner = self.inner.lock();
                if !inner.macro_active || !inner.macro_queued.is_empty() {
                    return;
                }
            }

            match self.macro_stack.read_next(self.channel).await {
                Ok(read) => {
                    for _ in 0..read.popped {
                        self.macro_frame_closed(false);
                    }
                    match read.code {
                        Some(code) if code.is_executable() => {
                            let (tx, _rx) = oneshot::channel();
                            // Macro codes have no external waiter; their
                            // results surface through the opening code.
                            self.inner
                                .lock()
                                .macro_queued
                                .push_back(QueuedCode { code, tx });
                            return;
                        }
                        Some(_) => continue,
                        None => {
                            self.inner.lock().macro_active = false;
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(channel = %self.channel, %err, "macro read failed");
                    self.macro_stack.abort_last(self.channel).await;
                    self.macro_frame_failed(err);
                    self.inner.lock().macro_active =
                        self.macro_stack.depth(self.channel).await > 0;
                    return;
                }
            }
        }
    }

    /// A macro frame reached end-of-file (or was aborted with `failed`).
    ///
    /// Clears the innermost opener's macro-pending slot; if its final
    /// reply already arrived, the code completes now.
    fn macro_frame_closed(&self, failed: bool) {
        self.send_macro_completed(failed);
        let completed = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.in_flight.iter().rposition(|e| e.macro_pending) else {
                return;
            };
            let entry = &mut inner.in_flight[index];
            entry.macro_pending = false;
            if entry.finished {
                inner
                    .in_flight
                    .remove(index)
                    .map(|e| (e.id, e.result, inner.is_idle()))
            } else {
                None
            }
        };
        if let Some((id, result, idle)) = completed {
            self.correlator.complete(self.channel, id, Ok(result));
            if idle {
                self.drained.notify_waiters();
            }
        }
    }

    /// A macro frame died mid-stream; its opening code fails.
    fn macro_frame_failed(&self, err: DaemonError) {
        self.send_macro_completed(true);
        let failed = {
            let mut inner = self.inner.lock();
            inner
                .in_flight
                .iter()
                .rposition(|e| e.macro_pending)
                .and_then(|index| inner.in_flight.remove(index))
                .map(|e| e.id)
        };
        if let Some(id) = failed {
            self.correlator.complete(self.channel, id, Err(err));
        }
    }

    fn send_macro_completed(&self, error: bool) {
        let payload = MacroCompletedPayload {
            channel: self.channel,
            error,
        };
        let _ = self.control_tx.send(OutboundControl {
            request: SbcRequest::MacroCompleted,
            payload: payload.encode(),
        });
    }
}
