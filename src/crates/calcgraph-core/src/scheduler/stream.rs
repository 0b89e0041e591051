//! Runtime stream endpoints: per-consumer bounded queues and per-producer
//! fan-out channels.
//!
//! Each edge of the graph materializes as one [`OutputChannel`] on the
//! producer side feeding one [`InputQueue`] per consumer port. Queues are
//! timestamp-sorted by construction (the producer-side shard enforces strict
//! monotonicity before packets ever reach a queue) and carry the stream's
//! progress state: the next-timestamp bound, the closed flag, and the
//! optional header. Every queue has its own lock; locks are held only for
//! short, non-awaiting critical sections.

use crate::calculator::PacketType;
use crate::packet::Packet;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Point-in-time view of one input port, consumed by the readiness policies.
#[derive(Debug, Clone, Copy)]
pub struct InputPortState {
    /// Timestamp of the front packet, if any.
    pub front: Option<Timestamp>,
    /// The stream's next-timestamp bound.
    pub bound: Timestamp,
    /// True once the producer closed the stream.
    pub closed: bool,
    /// True if this port is a declared back edge.
    pub back_edge: bool,
}

impl InputPortState {
    /// The smallest timestamp this port could still contribute: the front
    /// packet if present, otherwise the bound ([`Timestamp::DONE`] if closed
    /// and drained).
    pub fn next_possible(&self) -> Timestamp {
        match self.front {
            Some(front) => front,
            None if self.closed => Timestamp::DONE,
            None => self.bound,
        }
    }

    /// True once the stream can never contribute again.
    pub fn is_done(&self) -> bool {
        self.front.is_none() && self.closed
    }
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Packet>,
    bound: Timestamp,
    closed: bool,
    header: Option<Packet>,
    max_size: Option<usize>,
    back_edge: bool,
}

impl QueueState {
    fn is_full(&self) -> bool {
        matches!(self.max_size, Some(max) if self.queue.len() >= max)
    }
}

/// The consumer-side endpoint of one edge.
#[derive(Debug)]
pub(crate) struct InputQueue {
    stream: Arc<str>,
    /// Index of the consuming node, used to re-evaluate readiness on writes.
    consumer: usize,
    configured_max: Option<usize>,
    state: Mutex<QueueState>,
}

impl InputQueue {
    pub(crate) fn new(
        stream: Arc<str>,
        consumer: usize,
        max_size: Option<usize>,
        back_edge: bool,
    ) -> InputQueue {
        InputQueue {
            stream,
            consumer,
            configured_max: max_size,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                bound: Timestamp::PRE_STREAM,
                closed: false,
                header: None,
                max_size,
                back_edge,
            }),
        }
    }

    pub(crate) fn stream_name(&self) -> &str {
        &self.stream
    }

    pub(crate) fn consumer(&self) -> usize {
        self.consumer
    }

    /// Appends a packet. Queues are soft-bounded: a push never fails, but
    /// crossing the capacity threshold throttles upstream scheduling.
    pub(crate) fn push(&self, packet: Packet) {
        let mut state = self.state.lock();
        debug_assert!(
            state
                .queue
                .back()
                .map_or(true, |last| last.timestamp() < packet.timestamp()),
            "queue for stream '{}' received out-of-order packet",
            self.stream
        );
        state.queue.push_back(packet);
    }

    /// Advances the bound; ignores non-advancing updates.
    pub(crate) fn set_bound(&self, bound: Timestamp) -> bool {
        let mut state = self.state.lock();
        if bound > state.bound {
            state.bound = bound;
            true
        } else {
            false
        }
    }

    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.bound = Timestamp::DONE;
        true
    }

    pub(crate) fn set_header(&self, header: Packet) {
        self.state.lock().header = Some(header);
    }

    pub(crate) fn header(&self) -> Packet {
        self.state.lock().header.clone().unwrap_or_default()
    }

    /// Pops the front packet if it sits exactly at `at` (synchronized fill).
    /// Returns the packet and whether the pop un-filled a full queue.
    pub(crate) fn pop_at(&self, at: Timestamp) -> (Option<Packet>, bool) {
        self.pop_if(|front| front == at)
    }

    /// Pops the front packet if its timestamp is at most `at` (immediate fill).
    pub(crate) fn pop_up_to(&self, at: Timestamp) -> (Option<Packet>, bool) {
        self.pop_if(|front| front <= at)
    }

    fn pop_if(&self, want: impl FnOnce(Timestamp) -> bool) -> (Option<Packet>, bool) {
        let mut state = self.state.lock();
        let matched = state
            .queue
            .front()
            .map_or(false, |packet| want(packet.timestamp()));
        if !matched {
            return (None, false);
        }
        let was_full = state.is_full();
        let packet = state.queue.pop_front();
        (packet, was_full && !state.is_full())
    }

    pub(crate) fn snapshot(&self) -> InputPortState {
        let state = self.state.lock();
        InputPortState {
            front: state.queue.front().map(Packet::timestamp),
            bound: state.bound,
            closed: state.closed,
            back_edge: state.back_edge,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Raises the capacity by `n` packets (deadlock resolution escape valve).
    /// Returns the new capacity.
    pub(crate) fn grow(&self, n: usize) -> Option<usize> {
        let mut state = self.state.lock();
        if let Some(max) = state.max_size.as_mut() {
            *max += n;
        }
        state.max_size
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.bound = Timestamp::PRE_STREAM;
        state.closed = false;
        state.header = None;
        state.max_size = self.configured_max;
    }
}

#[derive(Debug)]
struct ChannelState {
    bound: Timestamp,
    closed: bool,
}

/// The producer-side endpoint of one stream, fanning out to every consumer
/// queue bound to the edge.
#[derive(Debug)]
pub(crate) struct OutputChannel {
    stream: Arc<str>,
    ty: PacketType,
    consumers: Mutex<Vec<Arc<InputQueue>>>,
    state: Mutex<ChannelState>,
}

/// Consumer nodes whose readiness must be re-evaluated after a write.
pub(crate) type WakeSet = Vec<usize>;

impl OutputChannel {
    pub(crate) fn new(stream: Arc<str>, ty: PacketType) -> OutputChannel {
        OutputChannel {
            stream,
            ty,
            consumers: Mutex::new(Vec::new()),
            state: Mutex::new(ChannelState {
                bound: Timestamp::PRE_STREAM,
                closed: false,
            }),
        }
    }

    pub(crate) fn stream_name(&self) -> Arc<str> {
        self.stream.clone()
    }

    pub(crate) fn packet_type(&self) -> PacketType {
        self.ty
    }

    pub(crate) fn attach_consumer(&self, queue: Arc<InputQueue>) {
        self.consumers.lock().push(queue);
    }

    pub(crate) fn bound(&self) -> Timestamp {
        self.state.lock().bound
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True if any consumer queue is at capacity; producers of full streams
    /// are not scheduled until the consumer drains.
    pub(crate) fn any_consumer_full(&self) -> bool {
        self.consumers.lock().iter().any(|queue| queue.is_full())
    }

    pub(crate) fn for_each_full_queue(&self, mut f: impl FnMut(&Arc<InputQueue>)) {
        for queue in self.consumers.lock().iter() {
            if queue.is_full() {
                f(queue);
            }
        }
    }

    /// Delivers a round's buffered effects: packets in order, then the final
    /// bound, header, and close flag. Returns the consumers to wake.
    pub(crate) fn commit(
        &self,
        packets: Vec<Packet>,
        final_bound: Timestamp,
        header: Option<Packet>,
        close: bool,
    ) -> WakeSet {
        let (bound, closed_now) = {
            let mut state = self.state.lock();
            if state.closed {
                debug_assert!(packets.is_empty());
                return WakeSet::new();
            }
            state.bound = state.bound.max(final_bound);
            let closed_now = close;
            if close {
                state.closed = true;
                state.bound = Timestamp::DONE;
            }
            (state.bound, closed_now)
        };

        let consumers = self.consumers.lock();
        let mut wake = WakeSet::with_capacity(consumers.len());
        for queue in consumers.iter() {
            if let Some(h) = &header {
                queue.set_header(h.clone());
            }
            for packet in &packets {
                queue.push(packet.clone());
            }
            let mut changed = !packets.is_empty();
            changed |= queue.set_bound(bound);
            if closed_now {
                changed |= queue.close();
            }
            if changed {
                wake.push(queue.consumer());
            }
        }
        wake
    }

    /// Advances the bound without packets (explicit bound updates and
    /// propagation through idle nodes with a declared timestamp offset).
    pub(crate) fn advance_bound(&self, bound: Timestamp) -> WakeSet {
        {
            let mut state = self.state.lock();
            if state.closed || bound <= state.bound {
                return WakeSet::new();
            }
            state.bound = bound;
        }
        let consumers = self.consumers.lock();
        let mut wake = WakeSet::with_capacity(consumers.len());
        for queue in consumers.iter() {
            if queue.set_bound(bound) {
                wake.push(queue.consumer());
            }
        }
        wake
    }

    /// Closes the channel and every consumer queue.
    pub(crate) fn close(&self) -> WakeSet {
        self.commit(Vec::new(), Timestamp::DONE, None, true)
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.bound = Timestamp::PRE_STREAM;
        state.closed = false;
    }
}
