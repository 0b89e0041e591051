//! Graph configuration types.
//!
//! A [`GraphConfig`] describes the static shape of a calculator graph: which
//! calculators run, how their ports are wired to named streams, which side
//! packets they consume and produce, and the execution limits (worker count,
//! queue sizes, deadlock policy). Configs are plain serde types and can be
//! written inline or loaded from YAML.
//!
//! Parsing the upstream textual graph-definition language is out of scope;
//! these structs are the boundary the (external) configuration layer targets.

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};

/// Which input-readiness policy a node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Wait until every input stream either has a packet at the minimum
    /// pending timestamp or is guaranteed (by its bound) to skip it. Default.
    Synchronized,
    /// Run as soon as anything is available; used by callback-style sinks.
    Immediate,
}

impl Default for InputPolicy {
    fn default() -> Self {
        InputPolicy::Synchronized
    }
}

/// One port-to-stream binding on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPort {
    /// Symbolic tag; ports sharing a tag are indexed by position. May be empty.
    #[serde(default)]
    pub tag: String,
    /// The named stream this port is bound to.
    pub stream: String,
    /// Marks a declared feedback edge (inputs only). An empty back edge is
    /// exempt from the synchronization bound-wait on the consuming node's
    /// first round, so the initial iteration of a loop can proceed.
    #[serde(default)]
    pub back_edge: bool,
    /// Per-port queue capacity override (inputs only).
    #[serde(default)]
    pub max_queue_size: Option<usize>,
}

impl StreamPort {
    /// An untagged binding to `stream`.
    pub fn new(stream: impl Into<String>) -> StreamPort {
        StreamPort {
            tag: String::new(),
            stream: stream.into(),
            back_edge: false,
            max_queue_size: None,
        }
    }

    /// A binding to `stream` under `tag`.
    pub fn tagged(tag: impl Into<String>, stream: impl Into<String>) -> StreamPort {
        StreamPort {
            tag: tag.into(),
            stream: stream.into(),
            back_edge: false,
            max_queue_size: None,
        }
    }

    /// Marks this input as a declared back edge.
    #[must_use]
    pub fn as_back_edge(mut self) -> StreamPort {
        self.back_edge = true;
        self
    }
}

/// Configuration of a single node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name; when empty the graph derives one from the
    /// calculator name and the node's position.
    #[serde(default)]
    pub name: String,
    /// Registered calculator type to instantiate.
    pub calculator: String,
    /// Input stream bindings, in port order.
    #[serde(default)]
    pub inputs: Vec<StreamPort>,
    /// Output stream bindings, in port order.
    #[serde(default)]
    pub outputs: Vec<StreamPort>,
    /// Input side packets: contract tag → graph-level side packet name.
    #[serde(default)]
    pub input_side_packets: std::collections::BTreeMap<String, String>,
    /// Output side packets: contract tag → graph-level side packet name.
    #[serde(default)]
    pub output_side_packets: std::collections::BTreeMap<String, String>,
    /// Overrides the input policy declared by the calculator's contract.
    #[serde(default)]
    pub input_policy: Option<InputPolicy>,
}

impl NodeConfig {
    /// A node running `calculator`, to be wired with the builder methods.
    pub fn new(calculator: impl Into<String>) -> NodeConfig {
        NodeConfig {
            calculator: calculator.into(),
            ..NodeConfig::default()
        }
    }

    /// Sets the node name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> NodeConfig {
        self.name = name.into();
        self
    }

    /// Appends an untagged input bound to `stream`.
    #[must_use]
    pub fn input(mut self, stream: impl Into<String>) -> NodeConfig {
        self.inputs.push(StreamPort::new(stream));
        self
    }

    /// Appends an input port.
    #[must_use]
    pub fn input_port(mut self, port: StreamPort) -> NodeConfig {
        self.inputs.push(port);
        self
    }

    /// Appends an untagged output bound to `stream`.
    #[must_use]
    pub fn output(mut self, stream: impl Into<String>) -> NodeConfig {
        self.outputs.push(StreamPort::new(stream));
        self
    }

    /// Appends an output port.
    #[must_use]
    pub fn output_port(mut self, port: StreamPort) -> NodeConfig {
        self.outputs.push(port);
        self
    }

    /// Binds input side packet `tag` to the graph-level side packet `name`.
    #[must_use]
    pub fn input_side_packet(
        mut self,
        tag: impl Into<String>,
        name: impl Into<String>,
    ) -> NodeConfig {
        self.input_side_packets.insert(tag.into(), name.into());
        self
    }

    /// Binds output side packet `tag` to the graph-level side packet `name`.
    #[must_use]
    pub fn output_side_packet(
        mut self,
        tag: impl Into<String>,
        name: impl Into<String>,
    ) -> NodeConfig {
        self.output_side_packets.insert(tag.into(), name.into());
        self
    }

    /// Overrides the contract's input policy.
    #[must_use]
    pub fn with_input_policy(mut self, policy: InputPolicy) -> NodeConfig {
        self.input_policy = Some(policy);
        self
    }
}

/// Behavior of `add_packet_to_input_stream` when a downstream queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphInputStreamAddMode {
    /// Block the (external) caller until space is available. Default.
    WaitUntilNotFull,
    /// Fail immediately with [`GraphError::Throttled`](crate::GraphError::Throttled).
    AddIfNotFull,
}

impl Default for GraphInputStreamAddMode {
    fn default() -> Self {
        GraphInputStreamAddMode::WaitUntilNotFull
    }
}

/// Executor sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of node callbacks in flight at once. `1` gives strictly
    /// sequential execution, which is useful for deterministic tests.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_num_workers() -> usize {
    4
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            num_workers: default_num_workers(),
        }
    }
}

/// Static description of a calculator graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Graph-level input streams fed by the caller.
    #[serde(default)]
    pub input_streams: Vec<String>,
    /// The nodes of the graph.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Executor sizing.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Default capacity of every input queue; `None` disables the bound.
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    /// Fail the run with a [`Deadlock`](crate::GraphError::Deadlock) error
    /// when no progress is possible under the queue limits, instead of
    /// resolving the stall by growing a queue.
    #[serde(default)]
    pub report_deadlock: bool,
    /// Packets of headroom added to a stalled queue per resolution episode
    /// when `report_deadlock` is disabled.
    #[serde(default = "default_deadlock_queue_growth")]
    pub deadlock_queue_growth: usize,
}

fn default_deadlock_queue_growth() -> usize {
    1
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            input_streams: Vec::new(),
            nodes: Vec::new(),
            executor: ExecutorConfig::default(),
            max_queue_size: None,
            report_deadlock: false,
            deadlock_queue_growth: default_deadlock_queue_growth(),
        }
    }
}

impl GraphConfig {
    /// An empty config to be filled with the builder methods.
    pub fn new() -> GraphConfig {
        GraphConfig::default()
    }

    /// Parses a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<GraphConfig> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GraphError::Validation(format!("failed to parse graph config: {e}")))
    }

    /// Declares a graph-level input stream.
    #[must_use]
    pub fn input_stream(mut self, name: impl Into<String>) -> GraphConfig {
        self.input_streams.push(name.into());
        self
    }

    /// Appends a node.
    #[must_use]
    pub fn node(mut self, node: NodeConfig) -> GraphConfig {
        self.nodes.push(node);
        self
    }

    /// Sets the default input queue capacity.
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> GraphConfig {
        self.max_queue_size = Some(size);
        self
    }

    /// Enables deadlock reporting.
    #[must_use]
    pub fn with_report_deadlock(mut self, report: bool) -> GraphConfig {
        self.report_deadlock = report;
        self
    }

    /// Sets the worker cap.
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> GraphConfig {
        self.executor.num_workers = num_workers;
        self
    }
}
