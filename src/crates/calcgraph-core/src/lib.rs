//! # calcgraph-core - Streaming Calculator-Graph Execution
//!
//! A multi-threaded dataflow engine for timestamped stream processing: wire
//! independently implemented processing nodes ("calculators") into a directed
//! graph, feed them timestamped packets, and let the scheduler enforce
//! synchronization, backpressure, and ordered delivery while driving the run
//! to completion or failure.
//!
//! ## Core Concepts
//!
//! ### 1. Packets and Timestamps
//!
//! Data flows as [`Packet`]s: immutable, cheaply clonable, type-erased values
//! stamped with a [`Timestamp`]. Timestamps on one stream strictly increase,
//! and every stream tracks a *bound* — the lower limit on anything that may
//! still arrive — so consumers can make progress without waiting for data
//! that will never come.
//!
//! ### 2. Calculators
//!
//! A [`Calculator`] declares its static shape once (a pure contract mapping
//! the configured ports to payload types and scheduling hints) and then
//! implements the `open` / `process` / `close` lifecycle. Calculator types
//! are registered by name in a [`CalculatorRegistry`] and instantiated fresh
//! for every run.
//!
//! ### 3. Synchronization policies
//!
//! Each node consumes its inputs through an input stream handler: the
//! default [`SynchronizedHandler`] aligns all input streams on a common
//! timestamp barrier, while [`ImmediateHandler`] reacts to whatever arrives,
//! packet by packet. Declared back edges make feedback loops explicit and
//! are exempted from the barrier's initial wait.
//!
//! ### 4. Scheduling and backpressure
//!
//! The scheduler dispatches ready nodes onto a bounded worker pool (size 1
//! gives deterministic sequential execution), drives source nodes in
//! timestamp order, throttles external input when queues fill up, and either
//! reports or resolves full-queue deadlocks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use calcgraph_core::{
//!     Calculator, CalculatorContext, CalculatorContract, CalculatorGraph,
//!     CalculatorRegistry, GraphConfig, NodeConfig, Packet, PacketType, Result, Timestamp,
//! };
//! use async_trait::async_trait;
//!
//! #[derive(Default)]
//! struct Doubler;
//!
//! #[async_trait]
//! impl Calculator for Doubler {
//!     fn contract(contract: &mut CalculatorContract) -> Result<()> {
//!         contract.set_all_input_types(PacketType::of::<i64>());
//!         contract.set_all_output_types(PacketType::of::<i64>());
//!         contract.set_timestamp_offset(0);
//!         Ok(())
//!     }
//!
//!     async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
//!         let value = *ctx.input(0).get::<i64>();
//!         let at = ctx.input_timestamp();
//!         ctx.output(0).add(value * 2, at);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut registry = CalculatorRegistry::new();
//!     registry.register::<Doubler>("Doubler");
//!
//!     let config = GraphConfig::new()
//!         .input_stream("in")
//!         .node(NodeConfig::new("Doubler").input("in").output("out"));
//!
//!     let mut graph = CalculatorGraph::new(config, &registry)?;
//!     graph.observe_output_stream("out", |packet| {
//!         println!("{} -> {}", packet.timestamp(), packet.get::<i64>());
//!         Ok(())
//!     })?;
//!
//!     graph.start_run(Default::default()).await?;
//!     graph
//!         .add_packet_to_input_stream("in", Packet::new(21i64).at(Timestamp::new(0)))
//!         .await?;
//!     graph.close_all_input_streams()?;
//!     graph.wait_until_done().await
//! }
//! ```

pub mod calculator;
pub mod config;
pub mod context;
pub mod counters;
pub mod error;
pub mod graph;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod timestamp;

pub use calculator::{Calculator, CalculatorContract, PacketType};
pub use config::{
    ExecutorConfig, GraphConfig, GraphInputStreamAddMode, InputPolicy, NodeConfig, StreamPort,
};
pub use context::{CalculatorContext, InputStreamShard, OutputStreamShard};
pub use counters::{Counter, CounterSet};
pub use error::{GraphError, NodeStage, Result};
pub use graph::{CalculatorGraph, OutputStreamCallback};
pub use packet::Packet;
pub use registry::CalculatorRegistry;
pub use scheduler::handlers::{
    ImmediateHandler, InputStreamHandler, NodeReadiness, SynchronizedHandler,
};
pub use scheduler::stream::InputPortState;
pub use timestamp::{Timestamp, TimestampDiff};
