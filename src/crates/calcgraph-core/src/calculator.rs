//! The calculator capability interface and its static contract.
//!
//! A calculator is the user-supplied processing unit wired into a graph. Each
//! calculator type exposes two things:
//!
//! 1. a pure, static **contract** — given the ports the configuration wired
//!    to it, declare the payload type of every port and side packet, plus
//!    scheduling hints (timestamp offset, input policy);
//! 2. the **runtime callbacks** `open`/`process`/`close`, each handed a
//!    [`CalculatorContext`](crate::context::CalculatorContext) for the round.
//!
//! This is a closed, one-level interface: no base-class state, no deep
//! hierarchy. Calculators are looked up by name in a
//! [`CalculatorRegistry`](crate::registry::CalculatorRegistry) and freshly
//! constructed for every run.

use crate::config::InputPolicy;
use crate::context::CalculatorContext;
use crate::error::{GraphError, Result};
use crate::timestamp::TimestampDiff;
use async_trait::async_trait;
use std::any::TypeId;

/// Declared payload type of a port or side packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Accepts any payload; disables static type checking on this port.
    Any,
    /// A concrete payload type.
    Of {
        /// The payload's `TypeId`.
        id: TypeId,
        /// Human-readable type name for diagnostics.
        name: &'static str,
    },
}

impl PacketType {
    /// The concrete type `T`.
    pub fn of<T: Send + Sync + 'static>() -> PacketType {
        PacketType::Of {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Whether a producer of `self` may feed a consumer of `other`.
    pub(crate) fn compatible(&self, other: &PacketType) -> bool {
        match (self, other) {
            (PacketType::Any, _) | (_, PacketType::Any) => true,
            (PacketType::Of { id: a, .. }, PacketType::Of { id: b, .. }) => a == b,
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Any => "<any>",
            PacketType::Of { name, .. } => name,
        }
    }

    pub(crate) fn matches_payload(&self, id: Option<TypeId>) -> bool {
        match (self, id) {
            (PacketType::Any, _) => true,
            (PacketType::Of { id: want, .. }, Some(have)) => *want == have,
            (PacketType::Of { .. }, None) => false,
        }
    }
}

/// One stream port as seen by a contract: the configuration-supplied wiring
/// plus the type the calculator declares for it.
#[derive(Debug, Clone)]
pub struct PortDecl {
    pub(crate) tag: String,
    pub(crate) stream: String,
    pub(crate) back_edge: bool,
    pub(crate) ty: Option<PacketType>,
}

impl PortDecl {
    /// The port's tag (may be empty).
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The stream the configuration bound to this port.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

/// One side packet slot as seen by a contract.
#[derive(Debug, Clone)]
pub struct SidePacketDecl {
    pub(crate) tag: String,
    pub(crate) name: String,
    pub(crate) ty: Option<PacketType>,
}

/// The static shape of one node, assembled from the configuration and
/// annotated by the calculator's [`Calculator::contract`] implementation.
///
/// The framework pre-populates the contract with the ports and side packet
/// tags the configuration actually wired; the calculator then declares a
/// [`PacketType`] for each of them (validation fails for any port left
/// undeclared) and may set scheduling hints.
#[derive(Debug, Clone)]
pub struct CalculatorContract {
    pub(crate) node: String,
    pub(crate) inputs: Vec<PortDecl>,
    pub(crate) outputs: Vec<PortDecl>,
    pub(crate) input_side_packets: Vec<SidePacketDecl>,
    pub(crate) output_side_packets: Vec<SidePacketDecl>,
    pub(crate) timestamp_offset: Option<TimestampDiff>,
    pub(crate) process_timestamp_bounds: bool,
    pub(crate) input_policy: InputPolicy,
}

impl CalculatorContract {
    /// The node this contract describes.
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Number of input stream ports wired by the configuration.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output stream ports wired by the configuration.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The input port declarations, in port order.
    pub fn inputs(&self) -> &[PortDecl] {
        &self.inputs
    }

    /// The output port declarations, in port order.
    pub fn outputs(&self) -> &[PortDecl] {
        &self.outputs
    }

    /// Declares the payload type of input port `index`.
    pub fn set_input_type(&mut self, index: usize, ty: PacketType) -> Result<()> {
        let node = self.node.clone();
        let port = self.inputs.get_mut(index).ok_or_else(|| {
            GraphError::Validation(format!("node '{node}' has no input port {index}"))
        })?;
        port.ty = Some(ty);
        Ok(())
    }

    /// Declares the payload type of output port `index`.
    pub fn set_output_type(&mut self, index: usize, ty: PacketType) -> Result<()> {
        let node = self.node.clone();
        let port = self.outputs.get_mut(index).ok_or_else(|| {
            GraphError::Validation(format!("node '{node}' has no output port {index}"))
        })?;
        port.ty = Some(ty);
        Ok(())
    }

    /// Declares every input port to carry `ty`.
    pub fn set_all_input_types(&mut self, ty: PacketType) {
        for port in &mut self.inputs {
            port.ty = Some(ty);
        }
    }

    /// Declares every output port to carry `ty`.
    pub fn set_all_output_types(&mut self, ty: PacketType) {
        for port in &mut self.outputs {
            port.ty = Some(ty);
        }
    }

    /// Requires the configuration to have wired input side packet `tag`, and
    /// declares its payload type.
    pub fn require_input_side_packet(&mut self, tag: &str, ty: PacketType) -> Result<()> {
        let node = self.node.clone();
        let decl = self
            .input_side_packets
            .iter_mut()
            .find(|d| d.tag == tag)
            .ok_or_else(|| {
                GraphError::Validation(format!(
                    "node '{node}' requires input side packet '{tag}', which is not wired"
                ))
            })?;
        decl.ty = Some(ty);
        Ok(())
    }

    /// Declares the type of input side packet `tag` if the configuration
    /// wired it; absent tags are simply not available at runtime.
    pub fn optional_input_side_packet(&mut self, tag: &str, ty: PacketType) {
        if let Some(decl) = self.input_side_packets.iter_mut().find(|d| d.tag == tag) {
            decl.ty = Some(ty);
        }
    }

    /// Declares the type of output side packet `tag`.
    pub fn set_output_side_packet_type(&mut self, tag: &str, ty: PacketType) -> Result<()> {
        let node = self.node.clone();
        let decl = self
            .output_side_packets
            .iter_mut()
            .find(|d| d.tag == tag)
            .ok_or_else(|| {
                GraphError::Validation(format!(
                    "node '{node}' declares no output side packet '{tag}'"
                ))
            })?;
        decl.ty = Some(ty);
        Ok(())
    }

    /// Declares that this calculator does not reorder data: a round at input
    /// timestamp `t` emits nothing later than `t + offset`, letting the
    /// scheduler propagate timestamp bounds through the node even on rounds
    /// where it produces no packets.
    pub fn set_timestamp_offset(&mut self, offset: impl Into<TimestampDiff>) {
        self.timestamp_offset = Some(offset.into());
    }

    /// Requests `process` to also run on pure timestamp-bound advances, with
    /// an all-empty input set.
    pub fn set_process_timestamp_bounds(&mut self, enabled: bool) {
        self.process_timestamp_bounds = enabled;
    }

    /// Sets the default input policy for this calculator. The node
    /// configuration may still override it.
    pub fn set_input_policy(&mut self, policy: InputPolicy) {
        self.input_policy = policy;
    }

    pub(crate) fn new(node: String) -> CalculatorContract {
        CalculatorContract {
            node,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_side_packets: Vec::new(),
            output_side_packets: Vec::new(),
            timestamp_offset: None,
            process_timestamp_bounds: false,
            input_policy: InputPolicy::Synchronized,
        }
    }

    pub(crate) fn check_fully_declared(&self) -> Result<()> {
        for (kind, ports) in [("input", &self.inputs), ("output", &self.outputs)] {
            for (index, port) in ports.iter().enumerate() {
                if port.ty.is_none() {
                    return Err(GraphError::Validation(format!(
                        "node '{}' did not declare a type for {kind} port {index} (stream '{}')",
                        self.node, port.stream
                    )));
                }
            }
        }
        for (kind, decls) in [
            ("input", &self.input_side_packets),
            ("output", &self.output_side_packets),
        ] {
            for decl in decls {
                if decl.ty.is_none() {
                    return Err(GraphError::Validation(format!(
                        "node '{}' did not declare a type for {kind} side packet '{}'",
                        self.node, decl.tag
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The calculator capability interface.
///
/// Lifecycle: the graph constructs a fresh instance per run, calls [`open`]
/// once before any data flows, [`process`] once per input round in strictly
/// increasing input-timestamp order (never concurrently with itself), and
/// [`close`] exactly once at the end — on normal exhaustion, graceful stop,
/// cancellation, or error.
///
/// A **source** calculator (no input ports) is driven by the scheduler:
/// `process` is invoked repeatedly until it returns [`GraphError::Stop`] or
/// the run shuts down. Non-source calculators returning `Stop` request a
/// graph-wide graceful stop (all packet sources close, buffered data drains).
///
/// [`open`]: Calculator::open
/// [`process`]: Calculator::process
/// [`close`]: Calculator::close
#[async_trait]
pub trait Calculator: Send {
    /// Declares port/side packet types and scheduling hints. Pure; called
    /// during graph validation, before any instance exists.
    fn contract(contract: &mut CalculatorContract) -> Result<()>
    where
        Self: Sized;

    /// Called once per run before any packets flow. Headers and output side
    /// packets are set here.
    async fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once per input round.
    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()>;

    /// Called exactly once when the node shuts down. Inputs are exhausted;
    /// outputs may still be written.
    async fn close(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}
