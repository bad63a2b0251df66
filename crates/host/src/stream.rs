//! Continuous transfer streaming
//!
//! A stream keeps a pool of IN transfers in flight against one endpoint and
//! delivers their payloads to the consumer in submission order, whatever
//! order the transport reports completions in. Payload buffers are
//! allocated once at open; a consumed payload returns its buffer to the
//! pool when dropped, and a full delivery queue recycles its oldest entry
//! rather than growing.
//!
//! The engine thread owns the submission side (see `worker`); this module
//! holds everything the consumer touches plus the shared delivery queue
//! between them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::command::{Command, EngineHandle};
use crate::error::{Result, UsbError};

/// Identifies one stream for its lifetime. Never reused by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// What happens when the delivery queue is full.
///
/// Both policies drop the oldest queued payload to admit the new one; a
/// stream never blocks the engine thread. They differ in visibility:
/// `Overwrite` only counts the drop in [`StreamStats`], `Notify` also
/// surfaces it through [`Payload::lost_before`] on the next payload the
/// consumer receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Overwrite,
    Notify,
}

/// Per-stream tuning, seeded from [`StreamSettings`] defaults.
///
/// [`StreamSettings`]: crate::config::StreamSettings
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Transfers kept in flight concurrently
    pub pool_size: usize,
    /// Bytes per transfer; 0 sizes transfers to the endpoint's max packet
    pub transfer_size: usize,
    /// Payloads buffered for the consumer before drop-oldest kicks in
    pub queue_depth: usize,
    /// Consecutive transient failures tolerated per slot before the slot's
    /// data is declared lost
    pub max_retries: u32,
    pub overflow: OverflowPolicy,
    /// Per-transfer timeout; zero disables it
    pub timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            transfer_size: 0,
            queue_depth: 8,
            max_retries: 3,
            overflow: OverflowPolicy::Overwrite,
            timeout: Duration::ZERO,
        }
    }
}

/// Stream lifecycle state as the consumer observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Transfers in flight, payloads flowing
    Running,
    /// Fatal error; queued payloads still drain, then the fault is returned
    Faulted,
    /// Stopped by request; queued payloads still drain
    Stopped,
}

/// Counters accumulated over a stream's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Payloads handed to the consumer
    pub delivered: u64,
    /// Payloads dropped by the full delivery queue
    pub dropped: u64,
    /// Transient transfer failures that were retried
    pub retried: u64,
    /// Slots whose data was declared lost (retries exhausted)
    pub lost: u64,
}

/// One delivered payload, holding a pool buffer until dropped.
#[derive(Debug)]
pub struct Payload {
    data: Vec<u8>,
    length: usize,
    sequence: u64,
    lost_before: u64,
    reclaim: Option<async_channel::Sender<Vec<u8>>>,
}

impl Payload {
    pub(crate) fn new(
        data: Vec<u8>,
        length: usize,
        sequence: u64,
        reclaim: async_channel::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            data,
            length,
            sequence,
            lost_before: 0,
            reclaim: Some(reclaim),
        }
    }

    /// The payload bytes. May be empty: devices do deliver zero-length
    /// transfers, and for isochronous streams an empty slot is data.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Submission sequence number; consecutive across delivered payloads
    /// unless payloads were lost in between.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Payloads lost between the previously delivered payload and this one.
    /// Always 0 under [`OverflowPolicy::Overwrite`].
    pub fn lost_before(&self) -> u64 {
        self.lost_before
    }

    /// Disarms recycling and takes the raw buffer.
    pub(crate) fn into_buffer(mut self) -> Vec<u8> {
        self.reclaim = None;
        std::mem::take(&mut self.data)
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(reclaim) = self.reclaim.take() {
            // Engine gone or pool full means the buffer just frees
            let _ = reclaim.try_send(std::mem::take(&mut self.data));
        }
    }
}

#[derive(Debug)]
struct DeliveryQueue {
    payloads: VecDeque<Payload>,
    depth: usize,
    policy: OverflowPolicy,
    /// Losses awaiting attribution to the next queued payload
    pending_loss: u64,
    stats: StreamStats,
    state: StreamState,
    fault: Option<UsbError>,
}

/// Delivery queue shared between the engine thread and the consumer.
#[derive(Debug)]
pub(crate) struct StreamShared {
    queue: Mutex<DeliveryQueue>,
    available: Condvar,
}

impl StreamShared {
    pub(crate) fn new(depth: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: Mutex::new(DeliveryQueue {
                payloads: VecDeque::with_capacity(depth),
                depth,
                policy,
                pending_loss: 0,
                stats: StreamStats::default(),
                state: StreamState::Running,
                fault: None,
            }),
            available: Condvar::new(),
        }
    }

    /// Engine side: enqueue a payload, recycling the oldest when full.
    /// Returns the recycled buffer for resubmission.
    pub(crate) fn push_payload(&self, mut payload: Payload) -> Option<Vec<u8>> {
        let mut q = self.queue.lock().unwrap();
        let mut recycled = None;
        if q.payloads.len() >= q.depth {
            if let Some(dropped) = q.payloads.pop_front() {
                q.stats.dropped += 1;
                if q.policy == OverflowPolicy::Notify {
                    // The loss precedes whatever the consumer sees next
                    let carried = 1 + dropped.lost_before;
                    match q.payloads.front_mut() {
                        Some(front) => front.lost_before += carried,
                        None => q.pending_loss += carried,
                    }
                }
                recycled = Some(dropped.into_buffer());
            }
        }
        if q.policy == OverflowPolicy::Notify {
            payload.lost_before += std::mem::take(&mut q.pending_loss);
        }
        q.payloads.push_back(payload);
        drop(q);
        self.available.notify_all();
        recycled
    }

    /// Engine side: `count` sequence slots will never produce payloads.
    pub(crate) fn note_lost(&self, count: u64) {
        let mut q = self.queue.lock().unwrap();
        q.stats.lost += count;
        if q.policy == OverflowPolicy::Notify {
            q.pending_loss += count;
        }
    }

    /// Engine side: a transient failure was retried.
    pub(crate) fn note_retry(&self) {
        self.queue.lock().unwrap().stats.retried += 1;
    }

    /// Engine side: fatal error. First fault wins; queued payloads remain
    /// consumable.
    pub(crate) fn set_fault(&self, error: UsbError) {
        let mut q = self.queue.lock().unwrap();
        if q.state == StreamState::Running {
            q.state = StreamState::Faulted;
            q.fault = Some(error);
        }
        drop(q);
        self.available.notify_all();
    }

    /// Engine side: the stream was stopped by request. A fault that got
    /// there first is the stream's terminal state and stays.
    pub(crate) fn set_stopped(&self) {
        let mut q = self.queue.lock().unwrap();
        if q.state == StreamState::Running {
            q.state = StreamState::Stopped;
        }
        drop(q);
        self.available.notify_all();
    }

    pub(crate) fn stats(&self) -> StreamStats {
        self.queue.lock().unwrap().stats
    }

    pub(crate) fn state(&self) -> StreamState {
        self.queue.lock().unwrap().state
    }
}

/// Consumer handle to a running stream.
///
/// Dropping the handle stops the stream in the background; [`stop`] stops
/// it synchronously with a deadline.
///
/// [`stop`]: Stream::stop
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    engine: EngineHandle,
    shared: Arc<StreamShared>,
    stopped: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, engine: EngineHandle, shared: Arc<StreamShared>) -> Self {
        Self {
            id,
            engine,
            shared,
            stopped: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Blocks for the next payload, in submission order.
    ///
    /// Payloads queued before a stop or fault are still delivered; once
    /// drained, a stopped stream returns [`UsbError::Cancelled`] and a
    /// faulted one returns its fault.
    pub fn next_payload(&self, timeout: Duration) -> Result<Payload> {
        let deadline = Instant::now() + timeout;
        let mut q = self.shared.queue.lock().unwrap();
        loop {
            if let Some(payload) = q.payloads.pop_front() {
                q.stats.delivered += 1;
                return Ok(payload);
            }
            match q.state {
                StreamState::Stopped => return Err(UsbError::Cancelled),
                StreamState::Faulted => {
                    return Err(q.fault.clone().unwrap_or(UsbError::DeviceDisconnected));
                }
                StreamState::Running => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout);
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(q, deadline - now)
                .unwrap();
            q = guard;
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Stops the stream: in-flight transfers are cancelled and the call
    /// returns once they have all come back, or fails with
    /// [`UsbError::TeardownIncomplete`] at the deadline (reclamation then
    /// continues in the background). Idempotent.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let deadline = Instant::now() + timeout;
        self.engine.request(|reply| Command::StopStream {
            stream: self.id,
            deadline,
            reply,
        })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.stopped {
            let deadline = Instant::now() + self.engine.config.teardown_timeout();
            let (reply, _discard) = tokio::sync::oneshot::channel();
            let _ = self.engine.send(Command::StopStream {
                stream: self.id,
                deadline,
                reply,
            });
        }
    }
}

/// Reorders out-of-order completions back into submission order.
///
/// Items are released strictly in sequence: an item stays parked until
/// every earlier sequence number has been inserted. The engine inserts an
/// entry for failed sequences too, so a permanently missing number cannot
/// wedge the stream.
#[derive(Debug)]
pub(crate) struct Resequencer<T> {
    next_out: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> Resequencer<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_out: 0,
            parked: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, sequence: u64, item: T) {
        debug_assert!(sequence >= self.next_out, "sequence released twice");
        self.parked.insert(sequence, item);
    }

    /// The next in-order item, if its sequence has arrived.
    pub(crate) fn pop_ready(&mut self) -> Option<(u64, T)> {
        let (&sequence, _) = self.parked.first_key_value()?;
        if sequence != self.next_out {
            return None;
        }
        let (_, item) = self.parked.pop_first()?;
        self.next_out = sequence + 1;
        Some((sequence, item))
    }

    /// Sequences parked waiting for earlier ones.
    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn test_payload(sequence: u64, reclaim: &async_channel::Sender<Vec<u8>>) -> Payload {
        Payload::new(vec![sequence as u8; 16], 16, sequence, reclaim.clone())
    }

    #[test]
    fn payload_returns_buffer_on_drop() {
        let (tx, rx) = async_channel::bounded(4);
        let payload = Payload::new(vec![9u8; 32], 8, 0, tx);
        assert_eq!(payload.bytes(), &[9u8; 8]);
        drop(payload);
        let buffer = rx.try_recv().unwrap();
        assert_eq!(buffer.len(), 32);
    }

    #[test]
    fn into_buffer_disarms_recycling() {
        let (tx, rx) = async_channel::bounded(4);
        let payload = Payload::new(vec![0u8; 32], 32, 0, tx);
        let buffer = payload.into_buffer();
        assert_eq!(buffer.len(), 32);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_recycles_oldest_and_attributes_loss() {
        let shared = StreamShared::new(2, OverflowPolicy::Notify);
        let (tx, _rx) = async_channel::bounded(8);

        assert!(shared.push_payload(test_payload(0, &tx)).is_none());
        assert!(shared.push_payload(test_payload(1, &tx)).is_none());
        // Queue full: payload 0 is dropped, its buffer comes back
        let recycled = shared.push_payload(test_payload(2, &tx));
        assert_eq!(recycled.unwrap(), vec![0u8; 16]);

        let q = shared.queue.lock().unwrap();
        assert_eq!(q.stats.dropped, 1);
        // The loss is visible on the payload the consumer sees next
        assert_eq!(q.payloads[0].sequence(), 1);
        assert_eq!(q.payloads[0].lost_before(), 1);
        assert_eq!(q.payloads[1].lost_before(), 0);
    }

    #[test]
    fn overwrite_policy_counts_but_does_not_annotate() {
        let shared = StreamShared::new(1, OverflowPolicy::Overwrite);
        let (tx, _rx) = async_channel::bounded(8);

        shared.push_payload(test_payload(0, &tx));
        shared.push_payload(test_payload(1, &tx));

        let q = shared.queue.lock().unwrap();
        assert_eq!(q.stats.dropped, 1);
        assert_eq!(q.payloads[0].lost_before(), 0);
    }

    #[test]
    fn lost_sequences_attach_to_next_payload() {
        let shared = StreamShared::new(4, OverflowPolicy::Notify);
        let (tx, _rx) = async_channel::bounded(8);

        shared.note_lost(2);
        shared.push_payload(test_payload(2, &tx));

        let q = shared.queue.lock().unwrap();
        assert_eq!(q.stats.lost, 2);
        assert_eq!(q.payloads[0].lost_before(), 2);
    }

    #[test]
    fn fault_keeps_queued_payloads_consumable() {
        let shared = StreamShared::new(4, OverflowPolicy::Overwrite);
        let (tx, _rx) = async_channel::bounded(8);
        shared.push_payload(test_payload(0, &tx));
        shared.set_fault(UsbError::DeviceDisconnected);

        let mut q = shared.queue.lock().unwrap();
        assert_eq!(q.state, StreamState::Faulted);
        assert!(q.payloads.pop_front().is_some());
    }

    #[test]
    fn first_fault_wins() {
        let shared = StreamShared::new(4, OverflowPolicy::Overwrite);
        shared.set_fault(UsbError::DeviceDisconnected);
        shared.set_fault(UsbError::Stall);
        let q = shared.queue.lock().unwrap();
        assert_eq!(q.fault, Some(UsbError::DeviceDisconnected));
    }

    #[test]
    fn resequencer_releases_in_order() {
        let mut reseq = Resequencer::new();
        reseq.insert(1, "b");
        reseq.insert(3, "d");
        assert!(reseq.pop_ready().is_none());

        reseq.insert(0, "a");
        assert_eq!(reseq.pop_ready(), Some((0, "a")));
        assert_eq!(reseq.pop_ready(), Some((1, "b")));
        assert!(reseq.pop_ready().is_none());
        assert_eq!(reseq.parked_len(), 1);

        reseq.insert(2, "c");
        assert_eq!(reseq.pop_ready(), Some((2, "c")));
        assert_eq!(reseq.pop_ready(), Some((3, "d")));
    }

    #[test]
    fn resequencer_orders_any_arrival_permutation() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut order: Vec<u64> = (0..32).collect();
            order.shuffle(&mut rng);

            let mut reseq = Resequencer::new();
            let mut released = Vec::new();
            for seq in order {
                reseq.insert(seq, seq);
                while let Some((_, item)) = reseq.pop_ready() {
                    released.push(item);
                }
            }
            let expected: Vec<u64> = (0..32).collect();
            assert_eq!(released, expected);
        }
    }
}
