//! Per-node runtime state: the calculator instance plus its per-run bindings.
//!
//! A `NodeRuntime` lives behind a `tokio::sync::Mutex` that is only ever
//! locked by the single task the scheduler dispatches for the node, which is
//! what enforces the at-most-one-active invariant: a node's callbacks never
//! overlap, even across worker threads. All scheduling bookkeeping (exec
//! state, lifecycle, last presented timestamp) lives with the scheduler, so
//! readiness can be evaluated without touching this lock.

use crate::calculator::{Calculator, PacketType};
use crate::context::{
    CalculatorContext, InputStreamShard, OutputSidePacketSlot, OutputStreamShard, SidePacketSet,
    TagMap,
};
use crate::counters::CounterSet;
use crate::error::{GraphError, NodeStage, Result};
use crate::packet::Packet;
use crate::timestamp::Timestamp;
use std::sync::Arc;

/// Template for one declared output side packet of a node.
#[derive(Debug, Clone)]
pub(crate) struct SideOutputDecl {
    pub(crate) tag: String,
    pub(crate) name: String,
    pub(crate) ty: PacketType,
}

/// Everything a round produced, handed back to the scheduler for propagation.
pub(crate) struct StageOutcome {
    pub(crate) result: Result<()>,
    pub(crate) outputs: Vec<OutputStreamShard>,
    /// Output side packets set during `open`, by graph-level name.
    pub(crate) side_packets: Vec<(String, Packet)>,
}

pub(crate) struct NodeRuntime {
    name: Arc<str>,
    input_tags: Arc<TagMap>,
    output_tags: Arc<TagMap>,
    side_output_decls: Vec<SideOutputDecl>,
    calculator: Option<Box<dyn Calculator>>,
    side_packets: Arc<SidePacketSet>,
    counters: Arc<CounterSet>,
}

impl NodeRuntime {
    pub(crate) fn new(
        name: Arc<str>,
        input_tags: Arc<TagMap>,
        output_tags: Arc<TagMap>,
        side_output_decls: Vec<SideOutputDecl>,
        counters: Arc<CounterSet>,
    ) -> NodeRuntime {
        NodeRuntime {
            name,
            input_tags,
            output_tags,
            side_output_decls,
            calculator: None,
            side_packets: Arc::new(SidePacketSet::default()),
            counters,
        }
    }

    /// Installs the fresh calculator instance and resolved side packets for a
    /// new run. Any instance from a previous run is dropped here.
    pub(crate) fn bind_run(
        &mut self,
        calculator: Box<dyn Calculator>,
        side_packets: SidePacketSet,
    ) {
        self.calculator = Some(calculator);
        self.side_packets = Arc::new(side_packets);
    }

    /// Runs one lifecycle callback with a freshly assembled context and
    /// returns its buffered effects.
    pub(crate) async fn run_stage(
        &mut self,
        stage: NodeStage,
        input_timestamp: Timestamp,
        inputs: Vec<InputStreamShard>,
        outputs: Vec<OutputStreamShard>,
    ) -> StageOutcome {
        let side_slots = if stage == NodeStage::Open {
            self.side_output_decls
                .iter()
                .map(|decl| OutputSidePacketSlot {
                    tag: decl.tag.clone(),
                    name: decl.name.clone(),
                    ty: decl.ty,
                    packet: None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut ctx = CalculatorContext {
            node_name: self.name.clone(),
            stage,
            input_timestamp,
            inputs,
            outputs,
            input_tags: self.input_tags.clone(),
            output_tags: self.output_tags.clone(),
            side_packets: self.side_packets.clone(),
            output_side_packets: side_slots,
            counters: self.counters.clone(),
        };

        let result = match self.calculator.as_mut() {
            Some(calculator) => match stage {
                NodeStage::Open => calculator.open(&mut ctx).await,
                NodeStage::Process => calculator.process(&mut ctx).await,
                NodeStage::Close => calculator.close(&mut ctx).await,
            },
            None => Err(GraphError::InvalidState(format!(
                "node '{}' has no calculator instance bound",
                self.name
            ))),
        };

        let side_packets = ctx
            .output_side_packets
            .into_iter()
            .filter_map(|slot| slot.packet.map(|packet| (slot.name, packet)))
            .collect();

        StageOutcome {
            result: result.map_err(|e| e.in_node(&self.name, stage)),
            outputs: ctx.outputs,
            side_packets,
        }
    }
}
