//! The transfer cycle: handshake, header exchange, body exchange,
//! atomic commit or rollback.
//!
//! Failure escalation: three consecutive CRC failures force a resync
//! (SBC-ready held low for the configured holdoff, then a fresh
//! handshake); ten consecutive resyncs surface a fatal
//! [`DaemonError::LinkFailure`], the only error that unwinds the
//! daemon.
//!
//! Rollback is atomic by construction: the outbound body stays owned by
//! the caller's request until a cycle commits, and inbound bytes from a
//! failed cycle are never surfaced.

use super::link::SpiLink;
use gantry_types::DaemonError;
use gantry_wire::{TransferHeader, WireError, TRANSFER_HEADER_LEN};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Tunables for the transfer loop.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for the firmware-ready line.
    pub handshake_timeout: Duration,
    /// How long SBC-ready is held low during a resync; at least twice
    /// the firmware's expected cycle time.
    pub resync_holdoff: Duration,
    /// Consecutive CRC failures before a resync.
    pub crc_retry_limit: u32,
    /// Consecutive resync failures before the link is declared lost.
    pub resync_limit: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(4),
            resync_holdoff: Duration::from_millis(100),
            crc_retry_limit: 3,
            resync_limit: 10,
        }
    }
}

/// Monotonic transfer counters, shared with diagnostics.
#[derive(Debug, Default)]
pub struct TransferStats {
    cycles: AtomicU64,
    crc_retries: AtomicU64,
    resyncs: AtomicU64,
}

impl TransferStats {
    /// Committed transfer cycles.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cycles retried after a CRC failure.
    #[must_use]
    pub fn crc_retries(&self) -> u64 {
        self.crc_retries.load(Ordering::Relaxed)
    }

    /// Resyncs performed.
    #[must_use]
    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles": self.cycles(),
            "crcRetries": self.crc_retries(),
            "resyncs": self.resyncs(),
        })
    }
}

enum CycleFailure<E> {
    /// Handshake timed out.
    Handshake,
    /// A CRC check failed; retry the same cycle.
    Crc(WireError),
    /// Framing is unrecoverable without a resync.
    Framing(WireError),
    /// The device itself failed.
    Device(E),
}

/// Owns the SPI link and performs framed full-duplex exchanges.
pub struct TransferEngine<L: SpiLink> {
    link: L,
    config: TransferConfig,
    stats: Arc<TransferStats>,
    sequence: u16,
}

impl<L: SpiLink> TransferEngine<L> {
    /// Creates an engine over `link`.
    pub fn new(link: L, config: TransferConfig) -> Self {
        Self::with_stats(link, config, Arc::new(TransferStats::default()))
    }

    /// Creates an engine sharing an externally owned statistics block,
    /// so diagnostics keep a handle that outlives the transfer thread.
    pub fn with_stats(link: L, config: TransferConfig, stats: Arc<TransferStats>) -> Self {
        Self {
            link,
            config,
            stats,
            sequence: 0,
        }
    }

    /// Shared statistics handle.
    #[must_use]
    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Performs one committed transfer cycle, retrying and resyncing as
    /// needed. Blocks the calling thread.
    ///
    /// On success the outbound body is committed and the inbound body
    /// returned. Failed cycles leave both directions untouched: the
    /// same outbound bytes are retried, inbound bytes are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::LinkFailure`] once the resync budget is
    /// exhausted.
    pub fn exchange(&mut self, outbound: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let mut crc_failures = 0u32;
        let mut resync_failures = 0u32;

        loop {
            match self.try_cycle(outbound) {
                Ok(inbound) => {
                    self.sequence = self.sequence.wrapping_add(1);
                    self.stats.cycles.fetch_add(1, Ordering::Relaxed);
                    return Ok(inbound);
                }
                Err(CycleFailure::Crc(err)) => {
                    self.stats.crc_retries.fetch_add(1, Ordering::Relaxed);
                    crc_failures += 1;
                    warn!(%err, attempt = crc_failures, "transfer CRC failure, rolling back cycle");
                    if crc_failures < self.config.crc_retry_limit {
                        continue;
                    }
                    crc_failures = 0;
                    self.resync(&mut resync_failures)?;
                }
                Err(CycleFailure::Handshake) => {
                    debug!("firmware not ready, toggling transfer direction");
                    if let Err(err) = self.link.toggle_direction() {
                        warn!(%err, "direction toggle failed");
                    }
                    self.resync(&mut resync_failures)?;
                }
                Err(CycleFailure::Framing(err)) => {
                    warn!(%err, "unrecoverable framing error");
                    self.resync(&mut resync_failures)?;
                }
                Err(CycleFailure::Device(err)) => {
                    warn!(%err, "SPI device error");
                    self.resync(&mut resync_failures)?;
                }
            }
        }
    }

    /// Performs the resync sub-protocol, escalating to link loss once
    /// the budget is spent.
    fn resync(&mut self, resync_failures: &mut u32) -> Result<(), DaemonError> {
        *resync_failures += 1;
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        if *resync_failures >= self.config.resync_limit {
            error!(
                attempts = *resync_failures,
                "resync budget exhausted, declaring link lost"
            );
            return Err(DaemonError::LinkFailure(format!(
                "resync budget exhausted after {} attempts",
                resync_failures
            )));
        }

        debug!(attempt = *resync_failures, "resyncing SPI link");
        if let Err(err) = self.link.set_ready(false) {
            warn!(%err, "failed to deassert ready line");
        }
        std::thread::sleep(self.config.resync_holdoff);
        Ok(())
    }

    fn try_cycle(&mut self, outbound: &[u8]) -> Result<Vec<u8>, CycleFailure<L::Error>> {
        // Handshake.
        self.link.set_ready(true).map_err(CycleFailure::Device)?;
        let ready = self
            .link
            .wait_partner_ready(self.config.handshake_timeout)
            .map_err(CycleFailure::Device)?;
        if !ready {
            return Err(CycleFailure::Handshake);
        }

        // Header exchange.
        let out_header = TransferHeader::for_body(self.sequence, outbound);
        let mut header_rx = [0u8; TRANSFER_HEADER_LEN];
        self.link
            .transfer(&out_header.encode(), &mut header_rx)
            .map_err(CycleFailure::Device)?;
        let in_header = TransferHeader::decode(&header_rx).map_err(|err| match err {
            WireError::ChecksumMismatch { .. } => CycleFailure::Crc(err),
            other => CycleFailure::Framing(other),
        })?;
        trace!(
            sequence = in_header.sequence_number,
            len = in_header.data_length,
            "inbound header"
        );

        // Body exchange: max of both lengths, zero-padded.
        let in_len = in_header.data_length as usize;
        let body_len = outbound.len().max(in_len);
        let mut inbound = Vec::new();
        if body_len > 0 {
            let mut tx = vec![0u8; body_len];
            tx[..outbound.len()].copy_from_slice(outbound);
            let mut rx = vec![0u8; body_len];
            self.link
                .transfer(&tx, &mut rx)
                .map_err(CycleFailure::Device)?;
            rx.truncate(in_len);
            in_header.verify_body(&rx).map_err(CycleFailure::Crc)?;
            inbound = rx;
        } else {
            in_header.verify_body(&[]).map_err(CycleFailure::Crc)?;
        }

        self.link.set_ready(false).map_err(CycleFailure::Device)?;
        Ok(inbound)
    }
}

/// One exchange request crossing the thread boundary.
pub struct ExchangeRequest {
    /// Assembled outbound body.
    pub outbound: Vec<u8>,
    /// Completion carrying the inbound body.
    pub reply: oneshot::Sender<Result<Vec<u8>, DaemonError>>,
}

/// Async-side handle to the transfer thread.
#[derive(Clone)]
pub struct TransferHandle {
    tx: mpsc::Sender<ExchangeRequest>,
}

impl TransferHandle {
    /// Performs one transfer cycle, suspending until it commits.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::LinkFailure`] if the link is lost or the
    /// transfer thread has exited.
    pub async fn exchange(&self, outbound: Vec<u8>) -> Result<Vec<u8>, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ExchangeRequest {
                outbound,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DaemonError::LinkFailure("transfer thread terminated".into()))?;
        reply_rx
            .await
            .map_err(|_| DaemonError::LinkFailure("transfer thread terminated".into()))?
    }
}

/// Spawns the dedicated transfer thread.
///
/// The thread serves exchange requests until the handle side closes or
/// a fatal link failure occurs; the fatal error is also delivered to
/// the requester that observed it.
///
/// # Errors
///
/// Returns [`DaemonError::LinkFailure`] if the OS refuses the thread.
pub fn spawn_transfer_thread<L: SpiLink + 'static>(
    mut engine: TransferEngine<L>,
) -> Result<(TransferHandle, std::thread::JoinHandle<()>), DaemonError> {
    let (tx, mut rx) = mpsc::channel::<ExchangeRequest>(1);
    let join = std::thread::Builder::new()
        .name("spi-transfer".into())
        .spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                let result = engine.exchange(&request.outbound);
                let fatal = result.is_err();
                let _ = request.reply.send(result);
                if fatal {
                    return;
                }
            }
        })
        .map_err(|e| DaemonError::LinkFailure(format!("failed to spawn transfer thread: {e}")))?;
    Ok((TransferHandle { tx }, join))
}
