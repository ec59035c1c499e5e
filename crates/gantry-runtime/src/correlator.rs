//! Code correlator - pending completions for in-flight codes.
//!
//! Every code committed to the transfer engine gets an entry here:
//! a (channel, code id) key mapped to the oneshot sender that fulfils
//! the [`CodeCompletion`] handed out when the code was queued, plus a
//! deadline. Entries die in exactly one of three ways: the final reply
//! arrives, the channel is invalidated, or the deadline expires.
//!
//! Ids are u16 counters allocated per channel; they wrap and are reused
//! once the slot is free. Id 0 is never allocated so it can mean "none"
//! on the wire.

use gantry_types::{CodeChannel, CodeResult, DaemonError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default per-code reply deadline.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion handle for one queued code.
///
/// Resolves once the firmware's final reply arrives, the channel is
/// flushed/invalidated, or the reply deadline expires.
pub struct CodeCompletion {
    rx: oneshot::Receiver<Result<CodeResult, DaemonError>>,
}

impl CodeCompletion {
    pub(crate) fn from_receiver(rx: oneshot::Receiver<Result<CodeResult, DaemonError>>) -> Self {
        Self { rx }
    }

    /// Waits for the code's outcome.
    pub async fn wait(self) -> Result<CodeResult, DaemonError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without completing: the daemon is tearing down.
            Err(_) => Err(DaemonError::CodeCancelled),
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<CodeResult, DaemonError>>,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<(CodeChannel, u16), PendingEntry>,
    next_id: HashMap<CodeChannel, u16>,
}

/// Bounded bidirectional mapping from outbound code to pending
/// completion handle.
pub struct CodeCorrelator {
    inner: Mutex<Inner>,
    reply_timeout: Duration,
}

impl CodeCorrelator {
    /// Creates a correlator with the given per-code reply deadline.
    #[must_use]
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reply_timeout,
        }
    }

    /// Allocates a code id on `channel` and registers a pending entry.
    ///
    /// Returns the id together with the completion handle for the
    /// caller to hand out. The deadline starts now.
    pub fn register(&self, channel: CodeChannel) -> (u16, CodeCompletion) {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(channel, tx);
        (id, CodeCompletion { rx })
    }

    /// Registers an existing completion sender, allocating the code id.
    ///
    /// Channel processors create the sender when a code is queued but
    /// register it only when the code is committed to the transfer
    /// engine, so the reply deadline starts at emit.
    pub fn insert(
        &self,
        channel: CodeChannel,
        tx: oneshot::Sender<Result<CodeResult, DaemonError>>,
    ) -> u16 {
        let mut inner = self.inner.lock();
        let id = Self::allocate_id(&mut inner, channel);
        inner.pending.insert(
            (channel, id),
            PendingEntry {
                tx,
                deadline: Instant::now() + self.reply_timeout,
            },
        );
        id
    }

    /// Fulfils the entry for (channel, id), if still present.
    ///
    /// Duplicate replies for an already-reclaimed slot are dropped;
    /// the firmware delivers exactly once per submission, so a miss is
    /// only expected after a flush or timeout reclaimed the entry.
    pub fn complete(
        &self,
        channel: CodeChannel,
        id: u16,
        outcome: Result<CodeResult, DaemonError>,
    ) {
        let entry = self.inner.lock().pending.remove(&(channel, id));
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(outcome);
            }
            None => debug!(%channel, id, "reply for unknown code slot dropped"),
        }
    }

    /// Fails every outstanding entry on `channel` with a cancellation
    /// error, in no particular order.
    pub fn invalidate(&self, channel: CodeChannel) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut inner = self.inner.lock();
            let keys: Vec<_> = inner
                .pending
                .keys()
                .filter(|(ch, _)| *ch == channel)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|k| inner.pending.remove(k))
                .collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(DaemonError::CodeCancelled));
        }
        if count > 0 {
            debug!(%channel, count, "invalidated outstanding codes");
        }
        count
    }

    /// Expires entries whose deadline has passed, failing them with a
    /// timeout error. Returns the reclaimed keys so channel processors
    /// can drop their in-flight bookkeeping.
    pub fn expire(&self, now: Instant) -> Vec<(CodeChannel, u16)> {
        let expired: Vec<((CodeChannel, u16), PendingEntry)> = {
            let mut inner = self.inner.lock();
            let keys: Vec<_> = inner
                .pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.pending.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let mut keys = Vec::with_capacity(expired.len());
        for ((channel, id), entry) in expired {
            warn!(%channel, id, "code reply deadline expired");
            let _ = entry.tx.send(Err(DaemonError::CodeTimeout(self.reply_timeout)));
            keys.push((channel, id));
        }
        keys
    }

    /// Number of outstanding entries on `channel`.
    #[must_use]
    pub fn outstanding(&self, channel: CodeChannel) -> usize {
        self.inner
            .lock()
            .pending
            .keys()
            .filter(|(ch, _)| *ch == channel)
            .count()
    }

    fn allocate_id(inner: &mut Inner, channel: CodeChannel) -> u16 {
        let counter = inner.next_id.entry(channel).or_insert(1);
        // Skip 0 and any id still pending; u16 wrap makes slots reusable.
        loop {
            let id = *counter;
            *counter = counter.wrapping_add(1);
            if id != 0 && !inner.pending.contains_key(&(channel, id)) {
                return id;
            }
        }
    }
}

impl Default for CodeCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::MessageSeverity;

    #[tokio::test]
    async fn completion_delivers_result() {
        let correlator = CodeCorrelator::default();
        let (id, completion) = correlator.register(CodeChannel::File);

        let result = CodeResult::with_message(MessageSeverity::Info, "ok");
        correlator.complete(CodeChannel::File, id, Ok(result.clone()));

        assert_eq!(completion.wait().await.unwrap(), result);
    }

    #[tokio::test]
    async fn ids_start_at_one_and_differ() {
        let correlator = CodeCorrelator::default();
        let (a, _ca) = correlator.register(CodeChannel::File);
        let (b, _cb) = correlator.register(CodeChannel::File);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn channels_have_independent_counters() {
        let correlator = CodeCorrelator::default();
        let (a, _ca) = correlator.register(CodeChannel::File);
        let (b, _cb) = correlator.register(CodeChannel::Http);
        assert_eq!(a, 1);
        assert_eq!(b, 1);
    }

    #[tokio::test]
    async fn invalidate_cancels_everything_on_channel() {
        let correlator = CodeCorrelator::default();
        let (_a, ca) = correlator.register(CodeChannel::File);
        let (_b, cb) = correlator.register(CodeChannel::File);
        let (_c, cc) = correlator.register(CodeChannel::Http);

        assert_eq!(correlator.invalidate(CodeChannel::File), 2);

        assert_eq!(ca.wait().await, Err(DaemonError::CodeCancelled));
        assert_eq!(cb.wait().await, Err(DaemonError::CodeCancelled));
        // Other channels are untouched.
        assert_eq!(correlator.outstanding(CodeChannel::Http), 1);
        drop(cc);
    }

    #[tokio::test]
    async fn expiry_fails_with_timeout() {
        let correlator = CodeCorrelator::new(Duration::from_millis(1));
        let (id, completion) = correlator.register(CodeChannel::Usb);

        let expired = correlator.expire(Instant::now() + Duration::from_secs(1));
        assert_eq!(expired, vec![(CodeChannel::Usb, id)]);

        assert!(matches!(
            completion.wait().await,
            Err(DaemonError::CodeTimeout(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_complete_is_dropped() {
        let correlator = CodeCorrelator::default();
        let (id, completion) = correlator.register(CodeChannel::File);

        correlator.complete(CodeChannel::File, id, Ok(CodeResult::new()));
        // Second completion for the same slot is a no-op.
        correlator.complete(CodeChannel::File, id, Err(DaemonError::CodeCancelled));

        assert!(completion.wait().await.is_ok());
    }

    #[test]
    fn id_allocation_skips_pending_slots() {
        let correlator = CodeCorrelator::default();
        {
            let mut inner = correlator.inner.lock();
            // Force the counter to collide with a still-pending slot.
            inner.next_id.insert(CodeChannel::File, 5);
            let (tx, _rx) = oneshot::channel();
            inner.pending.insert(
                (CodeChannel::File, 5),
                PendingEntry {
                    tx,
                    deadline: Instant::now() + Duration::from_secs(30),
                },
            );
        }
        let (id, _completion) = correlator.register(CodeChannel::File);
        assert_eq!(id, 6);
    }
}
