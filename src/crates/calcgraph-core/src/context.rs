//! The per-round context handed to calculator callbacks.
//!
//! A [`CalculatorContext`] gives a calculator indexed/tagged access to the
//! round's input packets, output sinks that buffer writes until the round
//! ends, side packet accessors, the current input timestamp, and the graph's
//! counters. Output writes are validated eagerly (ordering, type, closed-ness)
//! but only become visible downstream when the callback returns and the
//! scheduler propagates the round's effects.

use crate::calculator::PacketType;
use crate::counters::{Counter, CounterSet};
use crate::error::NodeStage;
use crate::packet::Packet;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved tag → port-index table, built once at graph initialization so the
/// hot path never hashes strings unless a calculator opts into tag lookups.
#[derive(Debug, Default)]
pub(crate) struct TagMap {
    by_tag: HashMap<String, Vec<usize>>,
}

impl TagMap {
    pub(crate) fn build<'a>(tags: impl Iterator<Item = &'a str>) -> TagMap {
        let mut by_tag: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, tag) in tags.enumerate() {
            by_tag.entry(tag.to_string()).or_default().push(index);
        }
        TagMap { by_tag }
    }

    pub(crate) fn resolve(&self, tag: &str, offset: usize) -> Option<usize> {
        self.by_tag.get(tag).and_then(|ports| ports.get(offset)).copied()
    }
}

/// Resolved input side packets of one node, write-once at run start and
/// read-only afterwards.
#[derive(Debug, Default)]
pub(crate) struct SidePacketSet {
    by_tag: HashMap<String, Packet>,
}

impl SidePacketSet {
    pub(crate) fn new(by_tag: HashMap<String, Packet>) -> SidePacketSet {
        SidePacketSet { by_tag }
    }

    fn get(&self, tag: &str) -> Packet {
        self.by_tag.get(tag).cloned().unwrap_or_default()
    }
}

/// Read-only view of one input stream for the current round.
#[derive(Debug, Clone, Default)]
pub struct InputStreamShard {
    pub(crate) packet: Packet,
    pub(crate) header: Packet,
    pub(crate) done: bool,
}

impl InputStreamShard {
    /// The packet for the current input timestamp, or an empty packet if this
    /// stream has no data this round.
    pub fn value(&self) -> &Packet {
        &self.packet
    }

    /// True if this stream contributed no packet this round.
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Shortcut for `value().get::<T>()`.
    ///
    /// # Panics
    ///
    /// Panics if the shard is empty or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self) -> &T {
        self.packet.get::<T>()
    }

    /// The producer's header packet, empty if none was set.
    pub fn header(&self) -> &Packet {
        &self.header
    }

    /// True once the producer closed the stream and its queue drained.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Buffered write access to one output stream for the current round.
///
/// All mutations are validated immediately; violating the stream contract is
/// a bug in the calculator and panics rather than returning an error.
#[derive(Debug)]
pub struct OutputStreamShard {
    pub(crate) stream: Arc<str>,
    pub(crate) ty: PacketType,
    pub(crate) packets: Vec<Packet>,
    /// Smallest timestamp a future packet may carry; advances with every
    /// add/bound update during the round.
    pub(crate) bound: Timestamp,
    pub(crate) closed: bool,
    pub(crate) close_requested: bool,
    pub(crate) header_update: Option<Packet>,
    pub(crate) header_allowed: bool,
}

impl OutputStreamShard {
    pub(crate) fn new(
        stream: Arc<str>,
        ty: PacketType,
        bound: Timestamp,
        closed: bool,
        header_allowed: bool,
    ) -> OutputStreamShard {
        OutputStreamShard {
            stream,
            ty,
            packets: Vec::new(),
            bound,
            closed,
            close_requested: false,
            header_update: None,
            header_allowed,
        }
    }

    /// The stream this shard writes to.
    pub fn name(&self) -> &str {
        &self.stream
    }

    /// Emits `packet` on this stream.
    ///
    /// # Panics
    ///
    /// Panics if the stream is closed, the packet is empty, its payload does
    /// not match the declared stream type, its timestamp is not allowed in a
    /// stream, is not beyond the current bound, or violates the sole-packet
    /// rule for `PRE_STREAM`/`POST_STREAM`.
    pub fn add_packet(&mut self, packet: Packet) {
        let stream = &self.stream;
        assert!(
            !self.closed && !self.close_requested,
            "add_packet on closed stream '{stream}'"
        );
        assert!(!packet.is_empty(), "cannot add an empty packet to stream '{stream}'");
        assert!(
            self.ty.matches_payload(packet.payload_type_id()),
            "packet type {} does not match stream '{stream}' carrying {}",
            packet.type_name().unwrap_or("<empty>"),
            self.ty.name()
        );
        let ts = packet.timestamp();
        assert!(
            ts.is_allowed_in_stream(),
            "timestamp {ts} is not allowed in stream '{stream}'"
        );
        if ts == Timestamp::PRE_STREAM || ts == Timestamp::POST_STREAM {
            assert!(
                self.bound == Timestamp::PRE_STREAM && self.packets.is_empty(),
                "{ts} must be the sole packet on stream '{stream}'"
            );
        } else {
            assert!(
                ts >= self.bound,
                "timestamp {ts} is not monotonically increasing on stream '{stream}' \
                 (next allowed is {})",
                self.bound
            );
        }
        self.bound = ts.next_allowed_in_stream();
        self.packets.push(packet);
    }

    /// Emits `value` at `timestamp`. Convenience for
    /// `add_packet(Packet::new(value).at(timestamp))`.
    pub fn add<T: Send + Sync + 'static>(&mut self, value: T, timestamp: Timestamp) {
        self.add_packet(Packet::new(value).at(timestamp));
    }

    /// Promises that no packet with a timestamp below `bound` will ever be
    /// emitted, letting downstream synchronized nodes proceed without data.
    ///
    /// # Panics
    ///
    /// Panics if the stream is closed or `bound` moves backwards.
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) {
        let stream = &self.stream;
        assert!(
            !self.closed && !self.close_requested,
            "set_next_timestamp_bound on closed stream '{stream}'"
        );
        assert!(
            bound >= self.bound,
            "timestamp bound may not move backwards on stream '{stream}' ({bound} < {})",
            self.bound
        );
        self.bound = bound;
    }

    /// The smallest timestamp a future packet on this stream may carry.
    pub fn next_timestamp_bound(&self) -> Timestamp {
        self.bound
    }

    /// Closes the stream at the end of this round. Irreversible.
    pub fn close(&mut self) {
        self.close_requested = true;
        self.bound = Timestamp::DONE;
    }

    /// True if the stream is closed (or closing at the end of this round).
    pub fn is_closed(&self) -> bool {
        self.closed || self.close_requested
    }

    /// Sets the stream's header packet. Only allowed during `open`; the
    /// header carries no timestamp.
    ///
    /// # Panics
    ///
    /// Panics outside `open`, on a second call, or if the header carries a
    /// timestamp.
    pub fn set_header(&mut self, header: Packet) {
        let stream = &self.stream;
        assert!(
            self.header_allowed,
            "set_header on stream '{stream}' is only allowed during open"
        );
        assert!(
            self.header_update.is_none(),
            "header for stream '{stream}' is already set"
        );
        assert!(
            header.timestamp() == Timestamp::UNSET,
            "headers are timestamp-less (stream '{stream}')"
        );
        self.header_update = Some(header);
    }
}

pub(crate) struct OutputSidePacketSlot {
    pub(crate) tag: String,
    pub(crate) name: String,
    pub(crate) ty: PacketType,
    pub(crate) packet: Option<Packet>,
}

/// The context handed to `open`, `process`, and `close`.
pub struct CalculatorContext {
    pub(crate) node_name: Arc<str>,
    pub(crate) stage: NodeStage,
    pub(crate) input_timestamp: Timestamp,
    pub(crate) inputs: Vec<InputStreamShard>,
    pub(crate) outputs: Vec<OutputStreamShard>,
    pub(crate) input_tags: Arc<TagMap>,
    pub(crate) output_tags: Arc<TagMap>,
    pub(crate) side_packets: Arc<SidePacketSet>,
    pub(crate) output_side_packets: Vec<OutputSidePacketSlot>,
    pub(crate) counters: Arc<CounterSet>,
}

impl CalculatorContext {
    /// The name of the node being executed.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The timestamp of the current round: the packets' shared timestamp in
    /// `process`, [`Timestamp::UNSET`] in `open` and for source rounds,
    /// [`Timestamp::DONE`] in `close`.
    pub fn input_timestamp(&self) -> Timestamp {
        self.input_timestamp
    }

    /// Number of input stream ports.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output stream ports.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// All input shards, in port order.
    pub fn inputs(&self) -> &[InputStreamShard] {
        &self.inputs
    }

    /// The input shard at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn input(&self, index: usize) -> &InputStreamShard {
        match self.inputs.get(index) {
            Some(shard) => shard,
            None => panic!("node '{}' has no input port {index}", self.node_name),
        }
    }

    /// The input shard for the `offset`-th port tagged `tag`.
    ///
    /// # Panics
    ///
    /// Panics if no such port exists.
    pub fn input_tagged(&self, tag: &str, offset: usize) -> &InputStreamShard {
        match self.input_tags.resolve(tag, offset) {
            Some(index) => &self.inputs[index],
            None => panic!(
                "node '{}' has no input port '{tag}':{offset}",
                self.node_name
            ),
        }
    }

    /// The output shard at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn output(&mut self, index: usize) -> &mut OutputStreamShard {
        let node_name = self.node_name.clone();
        match self.outputs.get_mut(index) {
            Some(shard) => shard,
            None => panic!("node '{node_name}' has no output port {index}"),
        }
    }

    /// The output shard for the `offset`-th port tagged `tag`.
    ///
    /// # Panics
    ///
    /// Panics if no such port exists.
    pub fn output_tagged(&mut self, tag: &str, offset: usize) -> &mut OutputStreamShard {
        match self.output_tags.resolve(tag, offset) {
            Some(index) => &mut self.outputs[index],
            None => panic!(
                "node '{}' has no output port '{tag}':{offset}",
                self.node_name
            ),
        }
    }

    /// Splits the context into its input and output shards, for rounds that
    /// read and write simultaneously.
    pub fn io(&mut self) -> (&[InputStreamShard], &mut [OutputStreamShard]) {
        let CalculatorContext { inputs, outputs, .. } = self;
        (inputs.as_slice(), outputs.as_mut_slice())
    }

    /// The input side packet wired under `tag`, or an empty packet if the
    /// configuration left it unwired (only possible for optional ones).
    pub fn input_side_packet(&self, tag: &str) -> Packet {
        self.side_packets.get(tag)
    }

    /// Sets the output side packet declared under `tag`. Only allowed during
    /// `open`; side packets are set once and immutable afterwards.
    ///
    /// # Panics
    ///
    /// Panics outside `open`, for an undeclared tag, a repeated set, or a
    /// payload not matching the declared type.
    pub fn set_output_side_packet(&mut self, tag: &str, packet: Packet) {
        let node_name = self.node_name.clone();
        assert!(
            self.stage == NodeStage::Open,
            "node '{node_name}' may only set output side packets during open"
        );
        let slot = match self
            .output_side_packets
            .iter_mut()
            .find(|slot| slot.tag == tag)
        {
            Some(slot) => slot,
            None => panic!("node '{node_name}' declares no output side packet '{tag}'"),
        };
        assert!(
            slot.packet.is_none(),
            "node '{node_name}' already set output side packet '{tag}'"
        );
        assert!(
            slot.ty.matches_payload(packet.payload_type_id()),
            "output side packet '{tag}' of node '{node_name}' expects {}, got {}",
            slot.ty.name(),
            packet.type_name().unwrap_or("<empty>")
        );
        slot.packet = Some(packet);
    }

    /// The counter named `name`, shared graph-wide.
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.counter(name)
    }
}
