//! Input stream handlers: the pluggable policies deciding when a node is
//! ready to run and which packets each round receives.
//!
//! A handler is a pure decision function over the state of a node's input
//! ports (front-of-queue timestamp, bound, closed-ness) plus the node's last
//! presented timestamp. The scheduler re-evaluates it after every write,
//! bound advance, or close on any of the node's inputs. Two policies ship:
//!
//! - [`SynchronizedHandler`] (default): the timestamp synchronization
//!   barrier. The node runs at the minimum pending timestamp `T` once every
//!   input either has a packet at exactly `T` or is guaranteed by its bound
//!   never to produce anything at or below `T`.
//! - [`ImmediateHandler`]: runs as soon as anything is available, presenting
//!   whatever is queued; used by callback-style sinks that must react packet
//!   by packet.
//!
//! Whatever the policy, the timestamp presented to one node strictly
//! increases across rounds; that is the guarantee every `process`
//! implementation relies on.

use super::stream::{InputPortState, InputQueue};
use crate::config::InputPolicy;
use crate::packet::Packet;
use crate::timestamp::Timestamp;
use std::sync::Arc;

/// Outcome of a readiness evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReadiness {
    /// Nothing to do yet.
    NotReady,
    /// Run `process` with the input set assembled at this timestamp.
    ProcessAt(Timestamp),
    /// Every input is exhausted; run `close`.
    CloseNode,
}

/// Packets popped for one round, in port order; empty packets stand in for
/// streams without data at the presented timestamp.
pub(crate) struct FilledInputs {
    pub(crate) packets: Vec<Packet>,
    /// True if any pop brought a queue back under its capacity limit.
    pub(crate) unthrottled: bool,
}

/// The input-readiness policy of one node.
pub trait InputStreamHandler: Send + Sync {
    /// Decides whether the node can run, given its ports' state and the last
    /// timestamp presented to it.
    fn readiness(
        &self,
        ports: &[InputPortState],
        last_presented: Timestamp,
        process_timestamp_bounds: bool,
    ) -> NodeReadiness;
}

pub(crate) fn handler_for(policy: InputPolicy) -> Arc<dyn InputStreamHandler> {
    match policy {
        InputPolicy::Synchronized => Arc::new(SynchronizedHandler),
        InputPolicy::Immediate => Arc::new(ImmediateHandler),
    }
}

/// Pops one round's packets from the queues, after readiness reported
/// `ProcessAt(at)` under the same policy. Synchronized rounds take exactly
/// the packets at `at`; immediate rounds take every front packet up to `at`.
pub(crate) fn fill_inputs(
    policy: InputPolicy,
    queues: &[Arc<InputQueue>],
    at: Timestamp,
) -> FilledInputs {
    let mut packets = Vec::with_capacity(queues.len());
    let mut unthrottled = false;
    for queue in queues {
        let (packet, freed) = match policy {
            InputPolicy::Synchronized => queue.pop_at(at),
            InputPolicy::Immediate => queue.pop_up_to(at),
        };
        unthrottled |= freed;
        packets.push(packet.unwrap_or_default());
    }
    FilledInputs { packets, unthrottled }
}

/// The default synchronization barrier.
pub struct SynchronizedHandler;

impl SynchronizedHandler {
    /// The smallest timestamp a port could still contribute, for scheduling
    /// purposes. An empty back edge is exempt from the bound-wait on the
    /// node's very first round (`last_presented` still unset), otherwise the
    /// initial iteration of a feedback loop could never start; from the
    /// second round on, the loop body's bound promises govern it like any
    /// other stream.
    fn scheduling_next_possible(port: &InputPortState, last_presented: Timestamp) -> Timestamp {
        if port.back_edge && last_presented == Timestamp::UNSET && port.front.is_none() {
            Timestamp::DONE
        } else {
            port.next_possible()
        }
    }
}

impl InputStreamHandler for SynchronizedHandler {
    fn readiness(
        &self,
        ports: &[InputPortState],
        last_presented: Timestamp,
        process_timestamp_bounds: bool,
    ) -> NodeReadiness {
        debug_assert!(!ports.is_empty(), "sources are driven without a handler");
        if ports.iter().all(InputPortState::is_done) {
            return NodeReadiness::CloseNode;
        }

        let min_pending = ports
            .iter()
            .map(|port| Self::scheduling_next_possible(port, last_presented))
            .min()
            .unwrap_or(Timestamp::DONE);
        if min_pending == Timestamp::DONE {
            // Only exempted back edges remain open; wait for the loop to fire.
            return NodeReadiness::NotReady;
        }

        let ready = ports.iter().all(|port| {
            port.front == Some(min_pending)
                || Self::scheduling_next_possible(port, last_presented) > min_pending
        });
        if ready {
            return NodeReadiness::ProcessAt(min_pending);
        }

        if process_timestamp_bounds {
            // Everything below min_pending is settled; report the newest
            // fully settled timestamp as an all-empty round.
            let settled = min_pending.previous_allowed_in_stream();
            if settled >= Timestamp::MIN && settled > last_presented {
                return NodeReadiness::ProcessAt(settled);
            }
        }
        NodeReadiness::NotReady
    }
}

/// Runs the node as soon as any input has a packet or a bound advance to
/// report.
///
/// Streams deliver monotonically increasing timestamps individually, but not
/// relative to each other; when a packet arrives below the node's already
/// presented clock, the round's input timestamp is clamped upwards to keep
/// the per-node monotonicity guarantee. The packets themselves keep their
/// own timestamps.
pub struct ImmediateHandler;

impl InputStreamHandler for ImmediateHandler {
    fn readiness(
        &self,
        ports: &[InputPortState],
        last_presented: Timestamp,
        process_timestamp_bounds: bool,
    ) -> NodeReadiness {
        debug_assert!(!ports.is_empty(), "sources are driven without a handler");
        if ports.iter().all(InputPortState::is_done) {
            return NodeReadiness::CloseNode;
        }

        if let Some(front) = ports.iter().filter_map(|port| port.front).min() {
            let at = front.max(last_presented.next_allowed_in_stream());
            return NodeReadiness::ProcessAt(at);
        }

        if process_timestamp_bounds {
            let min_bound = ports
                .iter()
                .map(InputPortState::next_possible)
                .min()
                .unwrap_or(Timestamp::DONE);
            let settled = min_bound.previous_allowed_in_stream();
            if settled >= Timestamp::MIN && settled > last_presented {
                return NodeReadiness::ProcessAt(settled);
            }
        }
        NodeReadiness::NotReady
    }
}
