//! Graph construction, validation, and run control.
//!
//! [`CalculatorGraph`] owns the validated topology and drives runs:
//!
//! ```text
//! new(config, &registry)      validate contracts, wire streams, order nodes
//! start_run(side_packets)     fresh calculator instances, open in dependency
//!                             order, release the scheduler
//! add_packet_to_input_stream  feed timestamped packets (blocks or throttles
//!                             under backpressure, per the add mode)
//! close_input_stream(s)       signal end of external data
//! wait_until_idle / _done     observe quiescence / completion
//! ```
//!
//! A graph may be run any number of times sequentially; every run constructs
//! fresh per-node state. Calculator failures do not tear the run down
//! abruptly: the first error is recorded as the terminal status, all packet
//! sources close, and buffered data drains so observers keep everything that
//! was already computed.

use crate::calculator::{Calculator, CalculatorContract, PacketType, PortDecl, SidePacketDecl};
use crate::config::{GraphConfig, GraphInputStreamAddMode, InputPolicy, NodeConfig};
use crate::context::{CalculatorContext, InputStreamShard, OutputStreamShard, SidePacketSet, TagMap};
use crate::counters::CounterSet;
use crate::error::{GraphError, NodeStage, Result};
use crate::packet::Packet;
use crate::registry::CalculatorRegistry;
use crate::scheduler::node::{NodeRuntime, SideOutputDecl};
use crate::scheduler::stream::{InputQueue, OutputChannel};
use crate::scheduler::{handlers, GraphInputStream, NodeMeta, Scheduler, SchedulerOptions};
use crate::timestamp::{Timestamp, TimestampDiff};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Callback type accepted by [`CalculatorGraph::observe_output_stream`].
pub type OutputStreamCallback = Arc<dyn Fn(&Packet) -> Result<()> + Send + Sync>;

/// Internal sink node backing `observe_output_stream`. Runs with the
/// immediate policy so packets are delivered as they arrive, in stream order.
struct StreamObserver {
    callback: OutputStreamCallback,
}

#[async_trait]
impl Calculator for StreamObserver {
    fn contract(_contract: &mut CalculatorContract) -> Result<()> {
        // Observers are wired internally, never through the registry.
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let packet = ctx.input(0).value();
        if !packet.is_empty() {
            (self.callback)(packet)?;
        }
        Ok(())
    }
}

type CalculatorFactory = Arc<dyn Fn() -> Box<dyn Calculator> + Send + Sync>;

enum NodeKind {
    Calculator {
        factory: CalculatorFactory,
    },
    Observer {
        callback: OutputStreamCallback,
    },
}

struct InSideDecl {
    tag: String,
    name: String,
    ty: PacketType,
}

struct NodeSpec {
    name: Arc<str>,
    kind: NodeKind,
    is_source: bool,
    policy: InputPolicy,
    process_timestamp_bounds: bool,
    timestamp_offset: Option<TimestampDiff>,
    /// (stream index, back-edge flag, per-port queue cap override)
    inputs: Vec<(usize, bool, Option<usize>)>,
    /// stream index per output port
    outputs: Vec<usize>,
    input_tags: Arc<TagMap>,
    output_tags: Arc<TagMap>,
    input_side_decls: Vec<InSideDecl>,
    side_output_decls: Vec<SideOutputDecl>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamProducer {
    GraphInput(usize),
    Node { node: usize },
}

struct StreamSpec {
    name: Arc<str>,
    producer: StreamProducer,
    ty: PacketType,
}

struct Topology {
    nodes: Vec<NodeSpec>,
    streams: Vec<StreamSpec>,
    graph_inputs: Vec<(Arc<str>, usize)>,
    topo_order: Vec<usize>,
    output_side_packet_names: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraphPhase {
    Idle,
    Running,
}

/// A runnable calculator graph. See the module docs for the lifecycle.
pub struct CalculatorGraph {
    topology: Topology,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    phase: Mutex<GraphPhase>,
    add_mode: Mutex<GraphInputStreamAddMode>,
    counters: Arc<CounterSet>,
    output_side_packets: Mutex<HashMap<String, Packet>>,
    executor_workers: usize,
    report_deadlock: bool,
    deadlock_queue_growth: usize,
    default_queue_size: Option<usize>,
}

impl CalculatorGraph {
    /// Validates `config` against the calculator contracts in `registry` and
    /// builds the graph. Fails with [`GraphError::Validation`] on structural
    /// problems: unknown calculators, unresolvable or doubly-produced
    /// streams, type mismatches across an edge, undeclared port types, or
    /// cycles without a declared back edge.
    pub fn new(config: GraphConfig, registry: &CalculatorRegistry) -> Result<CalculatorGraph> {
        let topology = build_topology(&config, registry)?;
        Ok(CalculatorGraph {
            topology,
            scheduler: Mutex::new(None),
            phase: Mutex::new(GraphPhase::Idle),
            add_mode: Mutex::new(GraphInputStreamAddMode::default()),
            counters: Arc::new(CounterSet::new()),
            output_side_packets: Mutex::new(HashMap::new()),
            executor_workers: config.executor.num_workers.max(1),
            report_deadlock: config.report_deadlock,
            deadlock_queue_growth: config.deadlock_queue_growth,
            default_queue_size: config.max_queue_size,
        })
    }

    /// Registers `callback` to receive every packet on `name`, in stream
    /// order. Must be called before the first run.
    pub fn observe_output_stream(
        &mut self,
        name: &str,
        callback: impl Fn(&Packet) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        if self.scheduler.lock().is_some() {
            return Err(GraphError::InvalidState(
                "output stream observers must be registered before the first run".into(),
            ));
        }
        let stream_idx = self
            .topology
            .streams
            .iter()
            .position(|s| &*s.name == name)
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!("no output stream named '{name}'"))
            })?;

        let node_idx = self.topology.nodes.len();
        let observer_name: Arc<str> =
            Arc::from(format!("__stream_observer_{}_{node_idx}", name).as_str());
        self.topology.nodes.push(NodeSpec {
            name: observer_name,
            kind: NodeKind::Observer {
                callback: Arc::new(callback),
            },
            is_source: false,
            policy: InputPolicy::Immediate,
            process_timestamp_bounds: false,
            timestamp_offset: None,
            inputs: vec![(stream_idx, false, None)],
            outputs: Vec::new(),
            input_tags: Arc::new(TagMap::build(std::iter::once(""))),
            output_tags: Arc::new(TagMap::build(std::iter::empty())),
            input_side_decls: Vec::new(),
            side_output_decls: Vec::new(),
        });
        self.topology.topo_order.push(node_idx);
        Ok(())
    }

    /// Controls how `add_packet_to_input_stream` reacts to a full downstream
    /// queue: block until space (default) or fail with a throttled error.
    pub fn set_input_stream_add_mode(&self, mode: GraphInputStreamAddMode) {
        *self.add_mode.lock() = mode;
    }

    /// Starts a run: builds fresh calculator instances, resolves side
    /// packets, opens every node in dependency order, and releases the
    /// scheduler. Side packet keys are graph-level names.
    pub async fn start_run(&self, side_packets: HashMap<String, Packet>) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == GraphPhase::Running {
                return Err(GraphError::InvalidState(
                    "the graph is already running".into(),
                ));
            }
            *phase = GraphPhase::Running;
        }
        match self.open_all(side_packets).await {
            Ok(()) => Ok(()),
            Err(error) => {
                *self.phase.lock() = GraphPhase::Idle;
                Err(error)
            }
        }
    }

    async fn open_all(&self, side_packets: HashMap<String, Packet>) -> Result<()> {
        let scheduler = self.ensure_scheduler();
        scheduler.reset();
        self.counters.reset();
        self.output_side_packets.lock().clear();

        let run_id = Uuid::new_v4();
        tracing::info!(run_id = %run_id, nodes = self.topology.nodes.len(), "starting graph run");

        let mut available = side_packets;
        let mut opened: Vec<usize> = Vec::new();

        for &idx in &self.topology.topo_order {
            let spec = &self.topology.nodes[idx];

            let mut by_tag = HashMap::new();
            for decl in &spec.input_side_decls {
                let packet = available.get(&decl.name).ok_or_else(|| {
                    GraphError::Validation(format!(
                        "side packet '{}' required by node '{}' is neither provided nor \
                         produced before it opens",
                        decl.name, spec.name
                    ))
                });
                let packet = match packet {
                    Ok(p) => p,
                    Err(error) => {
                        self.abort_startup(&scheduler, &opened).await;
                        return Err(error);
                    }
                };
                if !decl.ty.matches_payload(packet.payload_type_id()) {
                    self.abort_startup(&scheduler, &opened).await;
                    return Err(GraphError::Validation(format!(
                        "side packet '{}' for node '{}' expects {}, got {}",
                        decl.name,
                        spec.name,
                        decl.ty.name(),
                        packet.type_name().unwrap_or("<empty>")
                    )));
                }
                by_tag.insert(decl.tag.clone(), packet.clone());
            }

            let calculator: Box<dyn Calculator> = match &spec.kind {
                NodeKind::Calculator { factory } => factory(),
                NodeKind::Observer { callback } => Box::new(StreamObserver {
                    callback: callback.clone(),
                }),
            };

            let outcome = {
                let meta = &scheduler.metas[idx];
                let inputs: Vec<InputStreamShard> = meta
                    .input_queues
                    .iter()
                    .map(|queue| InputStreamShard {
                        packet: Packet::empty(),
                        header: queue.header(),
                        done: false,
                    })
                    .collect();
                let outputs: Vec<OutputStreamShard> = meta
                    .outputs
                    .iter()
                    .map(|channel| {
                        OutputStreamShard::new(
                            channel.stream_name(),
                            channel.packet_type(),
                            channel.bound(),
                            channel.is_closed(),
                            true,
                        )
                    })
                    .collect();

                let mut node = scheduler.nodes[idx].lock().await;
                node.bind_run(calculator, SidePacketSet::new(by_tag));
                node.run_stage(NodeStage::Open, Timestamp::UNSET, inputs, outputs)
                    .await
            };

            match outcome.result {
                Ok(()) => {
                    let meta = &scheduler.metas[idx];
                    for (shard, channel) in outcome.outputs.into_iter().zip(&meta.outputs) {
                        let wake = channel.commit(
                            shard.packets,
                            shard.bound,
                            shard.header_update,
                            shard.close_requested,
                        );
                        scheduler.note_wake(wake);
                    }
                    let mut produced = self.output_side_packets.lock();
                    for (name, packet) in outcome.side_packets {
                        available.insert(name.clone(), packet.clone());
                        produced.insert(name, packet);
                    }
                    scheduler.mark_opened(idx);
                    opened.push(idx);
                }
                Err(error) => {
                    let error = if error.is_stop() {
                        GraphError::Calculator {
                            node: spec.name.to_string(),
                            stage: NodeStage::Open,
                            message: "returned Stop from open".into(),
                        }
                    } else {
                        error
                    };
                    self.abort_startup(&scheduler, &opened).await;
                    return Err(error);
                }
            }
        }

        scheduler.start();
        Ok(())
    }

    /// Best-effort close of nodes already opened when startup fails midway.
    async fn abort_startup(&self, scheduler: &Arc<Scheduler>, opened: &[usize]) {
        let closes = opened.iter().map(|&idx| async move {
            let meta = &scheduler.metas[idx];
            let inputs: Vec<InputStreamShard> = meta
                .input_queues
                .iter()
                .map(|queue| InputStreamShard {
                    packet: Packet::empty(),
                    header: queue.header(),
                    done: true,
                })
                .collect();
            let outputs: Vec<OutputStreamShard> = meta
                .outputs
                .iter()
                .map(|channel| {
                    OutputStreamShard::new(
                        channel.stream_name(),
                        channel.packet_type(),
                        channel.bound(),
                        channel.is_closed(),
                        false,
                    )
                })
                .collect();
            let mut node = scheduler.nodes[idx].lock().await;
            let outcome = node
                .run_stage(NodeStage::Close, Timestamp::DONE, inputs, outputs)
                .await;
            if let Err(error) = outcome.result {
                if !error.is_stop() {
                    tracing::warn!(node = %meta.name, error = %error, "close failed during startup abort");
                }
            }
        });
        join_all(closes).await;
    }

    /// Feeds `packet` into the graph input stream `name`. The timestamp must
    /// exceed every previously added timestamp on that stream. Behavior on a
    /// full downstream queue follows the configured add mode.
    pub async fn add_packet_to_input_stream(&self, name: &str, packet: Packet) -> Result<()> {
        self.require_running()?;
        let mode = *self.add_mode.lock();
        let scheduler = self.running_scheduler()?;
        scheduler.add_packet(name, packet, mode).await
    }

    /// Advances the timestamp bound of graph input `name` without a packet,
    /// promising that no future packet on it will carry an earlier timestamp.
    pub fn set_input_stream_timestamp_bound(&self, name: &str, bound: Timestamp) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        scheduler.set_input_timestamp_bound(name, bound)
    }

    /// Signals that no more packets will arrive on input stream `name`.
    pub fn close_input_stream(&self, name: &str) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        scheduler.close_input(name)
    }

    /// Signals end-of-data on every graph input stream.
    pub fn close_all_input_streams(&self) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        scheduler.close_all_inputs();
        Ok(())
    }

    /// Closes every packet source — graph inputs immediately, source nodes
    /// before their next round — and lets buffered data drain.
    pub fn close_all_packet_sources(&self) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        scheduler.close_all_packet_sources();
        Ok(())
    }

    /// Hard stop: the run terminates with [`GraphError::Cancelled`], skipping
    /// buffered work. In-flight callbacks complete; every node is still
    /// closed. Safe to call from any thread.
    pub fn cancel(&self) {
        if self.require_running().is_err() {
            return;
        }
        if let Ok(scheduler) = self.running_scheduler() {
            scheduler.cancel();
        }
    }

    /// Blocks until no node is ready or running. This does not mean the run
    /// is finished — more input may still arrive. Returns the recorded error
    /// if the run has already failed.
    pub async fn wait_until_idle(&self) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        scheduler.wait_until_idle().await
    }

    /// Blocks until every node has closed, then returns the run's terminal
    /// status: the first error captured, or `Ok`.
    pub async fn wait_until_done(&self) -> Result<()> {
        self.require_running()?;
        let scheduler = self.running_scheduler()?;
        let result = scheduler.wait_until_done().await;
        *self.phase.lock() = GraphPhase::Idle;
        match &result {
            Ok(()) => tracing::info!("graph run finished"),
            Err(error) => tracing::info!(error = %error, "graph run finished with error"),
        }
        result
    }

    /// Convenience: `start_run`, close all inputs, `wait_until_done`. For
    /// graphs fed purely by source nodes and side packets.
    pub async fn run(&self, side_packets: HashMap<String, Packet>) -> Result<()> {
        self.start_run(side_packets).await?;
        if !self.topology.graph_inputs.is_empty() {
            self.close_all_input_streams()?;
        }
        self.wait_until_done().await
    }

    /// True once the current (or finished) run has recorded an error.
    pub fn has_error(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(false, |s| s.current_error().is_some())
    }

    /// The output side packet published under `name`. Available from the
    /// moment the producing node opened.
    pub fn output_side_packet(&self, name: &str) -> Result<Packet> {
        if !self.topology.output_side_packet_names.contains(name) {
            return Err(GraphError::InvalidArgument(format!(
                "no output side packet named '{name}'"
            )));
        }
        self.output_side_packets
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                GraphError::InvalidState(format!("output side packet '{name}' is not yet set"))
            })
    }

    /// The value of counter `name`, or `None` if no calculator touched it.
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        self.counters.value(name)
    }

    /// All counters accumulated by the current or last run.
    pub fn counters(&self) -> std::collections::BTreeMap<String, u64> {
        self.counters.snapshot()
    }

    fn require_running(&self) -> Result<()> {
        if *self.phase.lock() != GraphPhase::Running {
            return Err(GraphError::InvalidState("no run in progress".into()));
        }
        Ok(())
    }

    fn running_scheduler(&self) -> Result<Arc<Scheduler>> {
        self.scheduler
            .lock()
            .clone()
            .ok_or_else(|| GraphError::InvalidState("no run in progress".into()))
    }

    /// Builds the runtime structures on first use; later runs reuse them
    /// through `Scheduler::reset`.
    fn ensure_scheduler(&self) -> Arc<Scheduler> {
        let mut slot = self.scheduler.lock();
        if let Some(scheduler) = slot.as_ref() {
            return scheduler.clone();
        }

        let topology = &self.topology;
        let channels: Vec<Arc<OutputChannel>> = topology
            .streams
            .iter()
            .map(|stream| Arc::new(OutputChannel::new(stream.name.clone(), stream.ty)))
            .collect();

        let mut metas = Vec::with_capacity(topology.nodes.len());
        let mut runtimes = Vec::with_capacity(topology.nodes.len());
        for (idx, spec) in topology.nodes.iter().enumerate() {
            let input_queues: Vec<Arc<InputQueue>> = spec
                .inputs
                .iter()
                .map(|&(stream_idx, back_edge, cap_override)| {
                    let stream = &topology.streams[stream_idx];
                    let queue = Arc::new(InputQueue::new(
                        stream.name.clone(),
                        idx,
                        cap_override.or(self.default_queue_size),
                        back_edge,
                    ));
                    channels[stream_idx].attach_consumer(queue.clone());
                    queue
                })
                .collect();
            let outputs: Vec<Arc<OutputChannel>> = spec
                .outputs
                .iter()
                .map(|&stream_idx| channels[stream_idx].clone())
                .collect();

            metas.push(NodeMeta {
                name: spec.name.clone(),
                is_source: spec.is_source,
                policy: spec.policy,
                handler: handlers::handler_for(spec.policy),
                process_timestamp_bounds: spec.process_timestamp_bounds,
                timestamp_offset: spec.timestamp_offset,
                input_queues,
                outputs,
            });
            runtimes.push(tokio::sync::Mutex::new(NodeRuntime::new(
                spec.name.clone(),
                spec.input_tags.clone(),
                spec.output_tags.clone(),
                spec.side_output_decls.clone(),
                self.counters.clone(),
            )));
        }

        let graph_inputs = topology
            .graph_inputs
            .iter()
            .map(|(name, stream_idx)| {
                GraphInputStream::new(name.clone(), channels[*stream_idx].clone())
            })
            .collect();

        let scheduler = Arc::new(Scheduler::new(
            metas,
            runtimes,
            graph_inputs,
            SchedulerOptions {
                num_workers: self.executor_workers,
                report_deadlock: self.report_deadlock,
                deadlock_queue_growth: self.deadlock_queue_growth,
            },
        ));
        *slot = Some(scheduler.clone());
        scheduler
    }
}

/// Auto-names unnamed nodes the way the configuration layer would.
fn node_display_name(node: &NodeConfig, index: usize) -> String {
    if node.name.is_empty() {
        format!("{}_{index}", node.calculator)
    } else {
        node.name.clone()
    }
}

fn build_topology(config: &GraphConfig, registry: &CalculatorRegistry) -> Result<Topology> {
    let mut names = HashSet::new();
    for (index, node) in config.nodes.iter().enumerate() {
        let name = node_display_name(node, index);
        if !names.insert(name.clone()) {
            return Err(GraphError::Validation(format!(
                "duplicate node name '{name}'"
            )));
        }
    }

    // Streams: graph inputs first, then every node output port.
    let mut streams: Vec<StreamSpec> = Vec::new();
    let mut stream_index: HashMap<String, usize> = HashMap::new();
    let mut graph_inputs = Vec::new();
    for name in &config.input_streams {
        if stream_index.contains_key(name) {
            return Err(GraphError::Validation(format!(
                "duplicate graph input stream '{name}'"
            )));
        }
        let idx = streams.len();
        let arc_name: Arc<str> = Arc::from(name.as_str());
        streams.push(StreamSpec {
            name: arc_name.clone(),
            producer: StreamProducer::GraphInput(graph_inputs.len()),
            ty: PacketType::Any,
        });
        stream_index.insert(name.clone(), idx);
        graph_inputs.push((arc_name, idx));
    }

    // Resolve every node's contract against its configured wiring.
    let mut contracts: Vec<CalculatorContract> = Vec::new();
    for (index, node) in config.nodes.iter().enumerate() {
        let name = node_display_name(node, index);
        let mut contract = CalculatorContract::new(name.clone());
        for port in &node.inputs {
            contract.inputs.push(PortDecl {
                tag: port.tag.clone(),
                stream: port.stream.clone(),
                back_edge: port.back_edge,
                ty: None,
            });
        }
        for port in &node.outputs {
            if port.back_edge {
                return Err(GraphError::Validation(format!(
                    "output port on stream '{}' of node '{name}' is marked back_edge; \
                     back edges are declared on inputs",
                    port.stream
                )));
            }
            contract.outputs.push(PortDecl {
                tag: port.tag.clone(),
                stream: port.stream.clone(),
                back_edge: false,
                ty: None,
            });
        }
        for (tag, side_name) in &node.input_side_packets {
            contract.input_side_packets.push(SidePacketDecl {
                tag: tag.clone(),
                name: side_name.clone(),
                ty: None,
            });
        }
        for (tag, side_name) in &node.output_side_packets {
            contract.output_side_packets.push(SidePacketDecl {
                tag: tag.clone(),
                name: side_name.clone(),
                ty: None,
            });
        }
        registry
            .fill_contract(&node.calculator, &mut contract)
            .map_err(|e| match e {
                GraphError::Validation(msg) => {
                    GraphError::Validation(format!("node '{name}': {msg}"))
                }
                other => other,
            })?;
        contract.check_fully_declared()?;
        contracts.push(contract);
    }

    // Register producers.
    for (index, contract) in contracts.iter().enumerate() {
        for port in &contract.outputs {
            if let Some(&existing) = stream_index.get(&port.stream) {
                let producer = &streams[existing].producer;
                let owner = match producer {
                    StreamProducer::GraphInput(_) => "the graph input".to_string(),
                    StreamProducer::Node { node } => {
                        format!("node '{}'", contracts[*node].node_name())
                    }
                };
                return Err(GraphError::Validation(format!(
                    "stream '{}' is produced both by {owner} and node '{}'",
                    port.stream,
                    contract.node_name()
                )));
            }
            let idx = streams.len();
            streams.push(StreamSpec {
                name: Arc::from(port.stream.as_str()),
                producer: StreamProducer::Node { node: index },
                ty: port.ty.unwrap_or(PacketType::Any),
            });
            stream_index.insert(port.stream.clone(), idx);
        }
    }

    // Type-check every edge against its producer.
    for (index, contract) in contracts.iter().enumerate() {
        for port in &contract.inputs {
            let &stream_idx = stream_index.get(&port.stream).ok_or_else(|| {
                GraphError::Validation(format!(
                    "input stream '{}' of node '{}' is not produced by any node or graph input",
                    port.stream,
                    contract.node_name()
                ))
            })?;
            let consumer_ty = port.ty.unwrap_or(PacketType::Any);
            let stream = &mut streams[stream_idx];
            if !stream.ty.compatible(&consumer_ty) {
                return Err(GraphError::Validation(format!(
                    "type mismatch on stream '{}': produced as {}, consumed by node '{}' as {}",
                    port.stream,
                    stream.ty.name(),
                    contract.node_name(),
                    consumer_ty.name()
                )));
            }
            // Anchor the stream type on the first concrete declaration so
            // graph inputs are checked against their consumers too.
            if matches!(stream.ty, PacketType::Any) {
                stream.ty = consumer_ty;
            }
            if port.back_edge && matches!(stream.producer, StreamProducer::GraphInput(_)) {
                return Err(GraphError::Validation(format!(
                    "input stream '{}' of node '{}' cannot be a back edge: it is a graph input",
                    port.stream,
                    contract.node_name()
                )));
            }
        }
    }

    // Output side packet names must be unique across the graph.
    let mut output_side_packet_names = HashSet::new();
    let mut side_producer: HashMap<String, usize> = HashMap::new();
    for (index, contract) in contracts.iter().enumerate() {
        for decl in &contract.output_side_packets {
            if side_producer.insert(decl.name.clone(), index).is_some() {
                return Err(GraphError::Validation(format!(
                    "output side packet '{}' is produced by more than one node",
                    decl.name
                )));
            }
            output_side_packet_names.insert(decl.name.clone());
        }
    }

    // Dependency order over stream edges (back edges excluded) plus side
    // packet edges; a cycle here means an undeclared feedback loop.
    let node_count = contracts.len();
    let mut indegree = vec![0usize; node_count];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for (index, contract) in contracts.iter().enumerate() {
        for port in &contract.inputs {
            if port.back_edge {
                continue;
            }
            let stream = &streams[stream_index[&port.stream]];
            if let StreamProducer::Node { node } = stream.producer {
                edges[node].push(index);
                indegree[index] += 1;
            }
        }
        for decl in &contract.input_side_packets {
            if let Some(&producer) = side_producer.get(&decl.name) {
                if producer != index {
                    edges[producer].push(index);
                    indegree[index] += 1;
                }
            }
        }
    }
    let mut queue: VecDeque<usize> = (0..node_count).filter(|&i| indegree[i] == 0).collect();
    let mut topo_order = Vec::with_capacity(node_count);
    while let Some(node) = queue.pop_front() {
        topo_order.push(node);
        for &next in &edges[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if topo_order.len() != node_count {
        let stuck: Vec<&str> = (0..node_count)
            .filter(|&i| indegree[i] > 0)
            .map(|i| contracts[i].node_name())
            .collect();
        return Err(GraphError::Validation(format!(
            "cycle without a declared back edge involving nodes: {}",
            stuck.join(", ")
        )));
    }

    // Assemble the node specs.
    let mut nodes = Vec::with_capacity(node_count);
    for (index, (node, contract)) in config.nodes.iter().zip(contracts.into_iter()).enumerate() {
        let factory = registry.factory(&node.calculator)?;
        let input_tags = Arc::new(TagMap::build(contract.inputs.iter().map(|p| p.tag.as_str())));
        let output_tags = Arc::new(TagMap::build(contract.outputs.iter().map(|p| p.tag.as_str())));
        let inputs = contract
            .inputs
            .iter()
            .zip(&node.inputs)
            .map(|(decl, port)| {
                (
                    stream_index[&decl.stream],
                    decl.back_edge,
                    port.max_queue_size,
                )
            })
            .collect();
        let outputs = contract
            .outputs
            .iter()
            .map(|decl| stream_index[&decl.stream])
            .collect();
        let input_side_decls = contract
            .input_side_packets
            .iter()
            .map(|decl| InSideDecl {
                tag: decl.tag.clone(),
                name: decl.name.clone(),
                ty: decl.ty.unwrap_or(PacketType::Any),
            })
            .collect();
        let side_output_decls = contract
            .output_side_packets
            .iter()
            .map(|decl| SideOutputDecl {
                tag: decl.tag.clone(),
                name: decl.name.clone(),
                ty: decl.ty.unwrap_or(PacketType::Any),
            })
            .collect();

        nodes.push(NodeSpec {
            name: Arc::from(node_display_name(node, index).as_str()),
            kind: NodeKind::Calculator { factory },
            is_source: contract.inputs.is_empty(),
            policy: node.input_policy.unwrap_or(contract.input_policy),
            process_timestamp_bounds: contract.process_timestamp_bounds,
            timestamp_offset: contract.timestamp_offset,
            inputs,
            outputs,
            input_tags,
            output_tags,
            input_side_decls,
            side_output_decls,
        });
    }

    Ok(Topology {
        nodes,
        streams,
        graph_inputs,
        topo_order,
        output_side_packet_names,
    })
}
