use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::TryLockError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult};

/// Lifecycle state of one physical transport endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PhysicalState {
    Idle,
    Sending,
    Receiving,
    Disposed,
}

/// How an inbound sequence number relates to what the receiver expects.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InboundSequence {
    /// the next expected packet - process it
    New,
    /// the previously processed packet again - resend the cached response verbatim,
    ///  do not reprocess
    Repeated,
    /// neither expected nor a retransmission - the connection is desynchronized
    Desynchronized,
}

/// Per-direction sequence bookkeeping plus the cached response for retransmissions.
///
/// Every physical packet is stamped with a sender-local counter. Retransmission of
///  the last processed sequence yields the cached response, giving at-least-once
///  delivery with idempotent reprocessing despite carrier-level retries.
pub struct SequenceTracker {
    next_outbound: u64,
    last_processed_inbound: Option<u64>,
    cached_response: Option<Bytes>,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> SequenceTracker {
        SequenceTracker {
            next_outbound: 0,
            last_processed_inbound: None,
            cached_response: None,
        }
    }

    /// Stamp for the next outbound packet.
    pub fn next_outbound(&mut self) -> u64 {
        let seq = self.next_outbound;
        self.next_outbound += 1;
        seq
    }

    /// The sequence the last outbound packet carried, if any was sent.
    pub fn last_outbound(&self) -> Option<u64> {
        self.next_outbound.checked_sub(1)
    }

    pub fn classify_inbound(&self, seq: u64) -> InboundSequence {
        match self.last_processed_inbound {
            None => {
                if seq == 0 {
                    InboundSequence::New
                }
                else {
                    InboundSequence::Desynchronized
                }
            }
            Some(last) => {
                if seq == last {
                    InboundSequence::Repeated
                }
                else if seq == last + 1 {
                    InboundSequence::New
                }
                else {
                    InboundSequence::Desynchronized
                }
            }
        }
    }

    /// Record that `seq` was processed, caching the response to replay on a
    ///  retransmission. The previous cached response is released.
    pub fn mark_processed(&mut self, seq: u64, response: Option<Bytes>) {
        self.last_processed_inbound = Some(seq);
        self.cached_response = response;
    }

    pub fn cached_response(&self) -> Option<Bytes> {
        self.cached_response.clone()
    }

    pub fn desynchronization_error(&self, actual: u64) -> ChannelError {
        ChannelError::Desynchronization {
            expected: self.last_processed_inbound.unwrap_or(0),
            actual,
        }
    }
}

/// Transport-independent state every physical connection carries: the send lock,
///  sequence tracking, the pending unacknowledged outbound content, and activity
///  bookkeeping for the keeper timer.
///
/// The pending-content state is guarded by its own lock, distinct from the send
///  acquisition lock, so a reconnection attempt can inspect and replay pending
///  content while another task is mid-acquire.
pub struct PhysicalCore {
    send_lock: tokio::sync::Mutex<()>,
    state: Mutex<CoreState>,
}

struct CoreState {
    physical_state: PhysicalState,
    sequences: SequenceTracker,
    /// outbound content retained until positively acknowledged, replayed
    ///  byte-identical after a reconnect
    pending_outbound: Option<PendingContent>,
    last_activity: Instant,
}

#[derive(Clone)]
pub struct PendingContent {
    pub sequence: u64,
    pub content: Bytes,
}

impl Default for PhysicalCore {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalCore {
    pub fn new() -> PhysicalCore {
        PhysicalCore {
            send_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(CoreState {
                physical_state: PhysicalState::Idle,
                sequences: SequenceTracker::new(),
                pending_outbound: None,
                last_activity: Instant::now(),
            }),
        }
    }

    /// Non-blocking attempt to take the send lock. `Err` means the connection is busy
    ///  and the caller must queue the message instead of sending immediately.
    pub fn acquire_if_available(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, TryLockError> {
        self.send_lock.try_lock()
    }

    /// Take the send lock, bounded by the message's deadline. An already-elapsed
    ///  deadline fails with `Timeout` without touching the carrier.
    pub async fn acquire_within(
        &self,
        deadline: Deadline,
    ) -> ChannelResult<tokio::sync::MutexGuard<'_, ()>> {
        deadline.check("acquire send lock")?;
        deadline
            .run("acquire send lock", async {
                Ok(self.send_lock.lock().await)
            })
            .await
    }

    pub fn physical_state(&self) -> PhysicalState {
        self.state.lock().unwrap().physical_state
    }

    pub fn set_physical_state(&self, new_state: PhysicalState) {
        let mut state = self.state.lock().unwrap();
        if state.physical_state == PhysicalState::Disposed && new_state != PhysicalState::Disposed {
            debug!("ignoring state transition on a disposed connection");
            return;
        }
        state.physical_state = new_state;
    }

    /// Fail if the connection was already marked invalid; callers lazily (re)establish
    ///  the carrier afterwards.
    pub fn check_not_disposed(&self) -> ChannelResult<()> {
        if self.physical_state() == PhysicalState::Disposed {
            Err(ChannelError::closed("physical connection is disposed"))
        }
        else {
            Ok(())
        }
    }

    /// Reset the inactivity deadline; called on every successful send or receive.
    pub fn renew(&self) {
        self.state.lock().unwrap().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.state.lock().unwrap().last_activity;
        Instant::now().saturating_duration_since(last)
    }

    pub fn next_outbound_sequence(&self) -> u64 {
        self.state.lock().unwrap().sequences.next_outbound()
    }

    pub fn classify_inbound(&self, seq: u64) -> InboundSequence {
        self.state.lock().unwrap().sequences.classify_inbound(seq)
    }

    pub fn mark_inbound_processed(&self, seq: u64, response: Option<Bytes>) {
        self.state.lock().unwrap().sequences.mark_processed(seq, response);
    }

    pub fn cached_response(&self) -> Option<Bytes> {
        self.state.lock().unwrap().sequences.cached_response()
    }

    pub fn desynchronization_error(&self, actual: u64) -> ChannelError {
        self.state.lock().unwrap().sequences.desynchronization_error(actual)
    }

    /// Retain outbound content until it is positively acknowledged.
    pub fn retain_pending(&self, sequence: u64, content: Bytes) {
        trace!("retaining {} pending outbound bytes for sequence {}", content.len(), sequence);
        self.state.lock().unwrap().pending_outbound = Some(PendingContent { sequence, content });
    }

    /// The exact bytes to replay after a reconnect, if any send is unacknowledged.
    pub fn pending_content(&self) -> Option<PendingContent> {
        self.state.lock().unwrap().pending_outbound.clone()
    }

    pub fn acknowledge_pending(&self, sequence: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = &state.pending_outbound {
            if pending.sequence == sequence {
                state.pending_outbound = None;
            }
        }
    }

    pub fn dispose(&self) {
        self.state.lock().unwrap().physical_state = PhysicalState::Disposed;
    }
}
