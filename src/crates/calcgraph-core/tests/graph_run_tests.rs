//! End-to-end scenarios for the graph execution core.
//!
//! These tests run complete graphs through the public API and verify the
//! scheduler's externally observable guarantees: ordering, synchronization,
//! backpressure, deadlock handling, graceful stop, and error propagation.

use async_trait::async_trait;
use calcgraph_core::{
    Calculator, CalculatorContext, CalculatorContract, CalculatorGraph, CalculatorRegistry,
    GraphConfig, GraphError, GraphInputStreamAddMode, NodeConfig, Packet, PacketType, Result,
    StreamPort, Timestamp, TimestampDiff,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type RoundLog = Arc<Mutex<Vec<(Timestamp, Vec<bool>)>>>;

/// Copies its single input to its single output.
#[derive(Default)]
struct Relay;

#[async_trait]
impl Calculator for Relay {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_input_types(PacketType::Any);
        contract.set_all_output_types(PacketType::Any);
        contract.set_timestamp_offset(0);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let (inputs, outputs) = ctx.io();
        let packet = inputs[0].value();
        if !packet.is_empty() {
            outputs[0].add_packet(packet.clone());
        }
        Ok(())
    }
}

/// Synchronized fan-in that records, per round, the input timestamp and
/// which ports were empty.
struct JoinRecorder {
    log: RoundLog,
}

#[async_trait]
impl Calculator for JoinRecorder {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_input_types(PacketType::Any);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let empties = ctx.inputs().iter().map(|shard| shard.is_empty()).collect();
        self.log.lock().push((ctx.input_timestamp(), empties));
        Ok(())
    }
}

/// A source emitting `0..limit` at timestamps `0..limit`, then stopping.
struct CountSource {
    limit: i64,
    next: i64,
}

#[async_trait]
impl Calculator for CountSource {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_output_types(PacketType::of::<i64>());
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        if self.next >= self.limit {
            return Err(GraphError::Stop);
        }
        let value = self.next;
        ctx.output(0).add(value, Timestamp::new(value));
        self.next += 1;
        Ok(())
    }
}

/// Forwards packets, requesting a graceful stop on the `stop_after`-th round.
struct StopAfter {
    stop_after: usize,
    seen: usize,
}

#[async_trait]
impl Calculator for StopAfter {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_input_types(PacketType::Any);
        contract.set_all_output_types(PacketType::Any);
        contract.set_timestamp_offset(0);
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let (inputs, outputs) = ctx.io();
        let packet = inputs[0].value();
        if !packet.is_empty() {
            outputs[0].add_packet(packet.clone());
            self.seen += 1;
            if self.seen == self.stop_after {
                return Err(GraphError::Stop);
            }
        }
        Ok(())
    }
}

/// A sink that parks on a semaphore before consuming each packet, to hold
/// queues full while the test inspects backpressure behavior.
struct BlockableSink {
    gate: Arc<tokio::sync::Semaphore>,
    consumed: Arc<AtomicUsize>,
}

#[async_trait]
impl Calculator for BlockableSink {
    fn contract(contract: &mut CalculatorContract) -> Result<()> {
        contract.set_all_input_types(PacketType::of::<i64>());
        Ok(())
    }

    async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        if !ctx.input(0).is_empty() {
            let permit = self.gate.acquire().await.expect("gate open");
            permit.forget();
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn registry_with<C, F>(name: &str, factory: F) -> CalculatorRegistry
where
    C: Calculator + 'static,
    F: Fn() -> C + Send + Sync + 'static,
{
    let mut registry = CalculatorRegistry::new();
    registry.register_with(name, factory);
    registry
}

fn observe_i64(graph: &mut CalculatorGraph, stream: &str) -> Arc<Mutex<Vec<(Timestamp, i64)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    graph
        .observe_output_stream(stream, move |packet| {
            sink.lock().push((packet.timestamp(), *packet.get::<i64>()));
            Ok(())
        })
        .expect("stream exists");
    seen
}

#[tokio::test]
async fn pass_through_preserves_order_and_payloads() {
    let mut registry = CalculatorRegistry::new();
    registry.register::<Relay>("Relay");
    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("Relay").input("in").output("out"))
        .with_num_workers(1);

    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    graph
        .observe_output_stream("out", move |packet| {
            sink.lock()
                .push((packet.timestamp(), packet.get::<String>().clone()));
            Ok(())
        })
        .expect("stream exists");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("in", Packet::new("a".to_string()).at(Timestamp::new(0)))
        .await
        .expect("add");
    graph
        .add_packet_to_input_stream("in", Packet::new("b".to_string()).at(Timestamp::new(1)))
        .await
        .expect("add");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(
        *seen.lock(),
        vec![
            (Timestamp::new(0), "a".to_string()),
            (Timestamp::new(1), "b".to_string()),
        ]
    );
}

#[tokio::test]
async fn add_rejects_non_monotonic_timestamps() {
    let mut registry = CalculatorRegistry::new();
    registry.register::<Relay>("Relay");
    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("Relay").input("in").output("out"));
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("in", Packet::new(1i64).at(Timestamp::new(5)))
        .await
        .expect("add");
    let err = graph
        .add_packet_to_input_stream("in", Packet::new(2i64).at(Timestamp::new(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)));

    let err = graph
        .add_packet_to_input_stream("missing", Packet::new(3i64).at(Timestamp::new(9)))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)));

    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");
}

#[tokio::test]
async fn fan_in_synchronization_fills_gaps_with_empty_inputs() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();
    let registry = registry_with("JoinRecorder", move || JoinRecorder {
        log: rounds.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("a")
        .input_stream("b")
        .node(NodeConfig::new("JoinRecorder").input("a").input("b"))
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("a", Packet::new(0i64).at(Timestamp::new(0)))
        .await
        .expect("add");
    graph
        .add_packet_to_input_stream("b", Packet::new(0i64).at(Timestamp::new(0)))
        .await
        .expect("add");
    graph
        .add_packet_to_input_stream("a", Packet::new(1i64).at(Timestamp::new(1)))
        .await
        .expect("add");
    // Stream b skips t=1: promise that nothing below t=2 will arrive.
    graph
        .set_input_stream_timestamp_bound("b", Timestamp::new(2))
        .expect("bound");
    graph.wait_until_idle().await.expect("idle");
    graph
        .add_packet_to_input_stream("a", Packet::new(2i64).at(Timestamp::new(2)))
        .await
        .expect("add");
    graph
        .add_packet_to_input_stream("b", Packet::new(2i64).at(Timestamp::new(2)))
        .await
        .expect("add");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(
        *log.lock(),
        vec![
            (Timestamp::new(0), vec![false, false]),
            (Timestamp::new(1), vec![false, true]),
            (Timestamp::new(2), vec![false, false]),
        ]
    );
}

#[tokio::test]
async fn bounds_propagate_through_idle_nodes_with_offsets() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();
    let mut registry = CalculatorRegistry::new();
    registry.register::<Relay>("Relay");
    registry.register_with("JoinRecorder", move || JoinRecorder {
        log: rounds.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("in")
        .input_stream("direct")
        .node(NodeConfig::new("Relay").input("in").output("copied"))
        .node(NodeConfig::new("JoinRecorder").input("copied").input("direct"))
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("direct", Packet::new(7i64).at(Timestamp::new(0)))
        .await
        .expect("add");
    // Nothing flows through the Relay node, but advancing its input bound
    // must release the join via Relay's declared offset.
    graph
        .set_input_stream_timestamp_bound("in", Timestamp::new(1))
        .expect("bound");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(
        *log.lock(),
        vec![(Timestamp::new(0), vec![true, false])]
    );
}

#[tokio::test]
async fn backpressure_throttles_and_recovers() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let (sink_gate, sink_consumed) = (gate.clone(), consumed.clone());
    let registry = registry_with("BlockableSink", move || BlockableSink {
        gate: sink_gate.clone(),
        consumed: sink_consumed.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("BlockableSink").input("in"))
        .with_max_queue_size(2)
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    graph.set_input_stream_add_mode(GraphInputStreamAddMode::AddIfNotFull);

    graph.start_run(HashMap::new()).await.expect("start");
    // First packet is dispatched immediately (and blocks in the sink); the
    // next two fill the queue.
    for t in 0..3i64 {
        graph
            .add_packet_to_input_stream("in", Packet::new(t).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    let err = graph
        .add_packet_to_input_stream("in", Packet::new(3i64).at(Timestamp::new(3)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, GraphError::Throttled { ref stream } if stream == "in"),
        "expected a throttled error, got {err:?}"
    );

    // Unblock the sink, let it drain, and the add succeeds.
    gate.add_permits(16);
    graph.wait_until_idle().await.expect("idle");
    graph
        .add_packet_to_input_stream("in", Packet::new(3i64).at(Timestamp::new(3)))
        .await
        .expect("add after drain");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(consumed.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn deadlock_is_reported_when_enabled() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();
    let registry = registry_with("JoinRecorder", move || JoinRecorder {
        log: rounds.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("a")
        .input_stream("b")
        .node(NodeConfig::new("JoinRecorder").input("a").input("b"))
        .with_max_queue_size(2)
        .with_report_deadlock(true)
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    graph.set_input_stream_add_mode(GraphInputStreamAddMode::AddIfNotFull);

    graph.start_run(HashMap::new()).await.expect("start");
    for t in 0..2i64 {
        graph
            .add_packet_to_input_stream("a", Packet::new(t).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    // The queue on `a` is full and the join cannot run without data on `b`.
    let err = graph
        .add_packet_to_input_stream("a", Packet::new(2i64).at(Timestamp::new(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Deadlock(_)), "got {err:?}");

    // The run fails, but the buffered packets still drain first.
    let err = graph.wait_until_done().await.unwrap_err();
    assert!(matches!(err, GraphError::Deadlock(_)));
    assert_eq!(
        *log.lock(),
        vec![
            (Timestamp::new(0), vec![false, true]),
            (Timestamp::new(1), vec![false, true]),
        ]
    );
}

#[tokio::test]
async fn stall_grows_queues_when_reporting_is_disabled() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();
    let registry = registry_with("JoinRecorder", move || JoinRecorder {
        log: rounds.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("a")
        .input_stream("b")
        .node(NodeConfig::new("JoinRecorder").input("a").input("b"))
        .with_max_queue_size(2)
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    graph.set_input_stream_add_mode(GraphInputStreamAddMode::AddIfNotFull);

    graph.start_run(HashMap::new()).await.expect("start");
    for t in 0..4i64 {
        graph
            .add_packet_to_input_stream("a", Packet::new(t).at(Timestamp::new(t)))
            .await
            .unwrap_or_else(|e| panic!("add {t} should grow the queue, got {e:?}"));
    }
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(log.lock().len(), 4);
}

#[tokio::test]
async fn source_stops_gracefully_after_emitting() {
    let registry = registry_with("CountSource", || CountSource { limit: 4, next: 0 });
    let config = GraphConfig::new()
        .node(NodeConfig::new("CountSource").output("numbers"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = observe_i64(&mut graph, "numbers");

    graph.run(HashMap::new()).await.expect("run");

    let seen = seen.lock();
    assert_eq!(
        *seen,
        (0..4)
            .map(|v| (Timestamp::new(v), v))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn non_source_stop_closes_sources_and_keeps_output() {
    let mut registry = CalculatorRegistry::new();
    registry.register_with("CountSource", || CountSource {
        limit: 1_000_000,
        next: 0,
    });
    registry.register_with("StopAfter", || StopAfter {
        stop_after: 3,
        seen: 0,
    });

    let config = GraphConfig::new()
        .node(NodeConfig::new("CountSource").output("numbers"))
        .node(NodeConfig::new("StopAfter").input("numbers").output("limited"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = observe_i64(&mut graph, "limited");

    graph.run(HashMap::new()).await.expect("run ends ok");

    // Exactly three rounds ran before the stop; the source was closed
    // instead of emitting forever.
    assert_eq!(
        *seen.lock(),
        vec![
            (Timestamp::new(0), 0),
            (Timestamp::new(1), 1),
            (Timestamp::new(2), 2),
        ]
    );
}

#[tokio::test]
async fn calculator_error_becomes_terminal_status_after_draining() {
    struct FailAt {
        at: Timestamp,
    }

    #[async_trait]
    impl Calculator for FailAt {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::Any);
            contract.set_all_output_types(PacketType::Any);
            contract.set_timestamp_offset(0);
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            if ctx.input_timestamp() == self.at {
                return Err(GraphError::execution("synthetic failure"));
            }
            let (inputs, outputs) = ctx.io();
            outputs[0].add_packet(inputs[0].value().clone());
            Ok(())
        }
    }

    let registry = registry_with("FailAt", || FailAt {
        at: Timestamp::new(1),
    });
    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("FailAt").named("flaky").input("in").output("out"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = observe_i64(&mut graph, "out");

    graph.start_run(HashMap::new()).await.expect("start");
    for t in 0..3i64 {
        graph
            .add_packet_to_input_stream("in", Packet::new(t).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    graph.close_all_input_streams().expect("close");
    let err = graph.wait_until_done().await.unwrap_err();

    match err {
        GraphError::Calculator { node, message, .. } => {
            assert_eq!(node, "flaky");
            assert!(message.contains("synthetic failure"));
        }
        other => panic!("unexpected terminal status: {other:?}"),
    }
    // Output computed before the failure is preserved, not retracted.
    assert_eq!(*seen.lock(), vec![(Timestamp::new(0), 0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_calls_never_overlap_per_node() {
    struct ConcurrencyProbe {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Calculator for ConcurrencyProbe {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::Any);
            Ok(())
        }

        async fn process(&mut self, _ctx: &mut CalculatorContext) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (probe_active, probe_peak) = (active.clone(), peak.clone());
    let registry = registry_with("ConcurrencyProbe", move || ConcurrencyProbe {
        active: probe_active.clone(),
        peak: probe_peak.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("ConcurrencyProbe").input("in"))
        .with_num_workers(4);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    for t in 0..16i64 {
        graph
            .add_packet_to_input_stream("in", Packet::new(t).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(peak.load(Ordering::SeqCst), 1, "process calls overlapped");
}

#[tokio::test]
async fn cancel_terminates_with_cancelled_status() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let (sink_gate, sink_consumed) = (gate.clone(), consumed.clone());
    let registry = registry_with("BlockableSink", move || BlockableSink {
        gate: sink_gate.clone(),
        consumed: sink_consumed.clone(),
    });

    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("BlockableSink").input("in"))
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    for t in 0..3i64 {
        graph
            .add_packet_to_input_stream("in", Packet::new(t).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    graph.cancel();
    gate.add_permits(16);

    let err = graph.wait_until_done().await.unwrap_err();
    assert!(matches!(err, GraphError::Cancelled));
    // The in-flight round completed; the buffered remainder was skipped.
    assert!(consumed.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn declared_back_edge_runs_a_feedback_loop() {
    /// Adds the previous output (arriving on the feedback edge) to the input.
    #[derive(Default)]
    struct Accumulate;

    #[async_trait]
    impl Calculator for Accumulate {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::of::<i64>());
            contract.set_all_output_types(PacketType::of::<i64>());
            contract.set_timestamp_offset(0);
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            let (inputs, outputs) = ctx.io();
            let feedback = inputs[1].value().try_get::<i64>().copied().unwrap_or(0);
            match inputs[0].value().try_get::<i64>() {
                Some(value) => {
                    let at = inputs[0].value().timestamp();
                    outputs[0].add(value + feedback, at);
                }
                None => {
                    // Main input exhausted: end the loop instead of chasing
                    // the feedback stream forever.
                    if inputs[0].is_done() && !outputs[0].is_closed() {
                        outputs[0].close();
                    }
                }
            }
            Ok(())
        }
    }

    /// Re-emits its input one timestamp later, closing the loop.
    #[derive(Default)]
    struct Delay;

    #[async_trait]
    impl Calculator for Delay {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::of::<i64>());
            contract.set_all_output_types(PacketType::of::<i64>());
            contract.set_timestamp_offset(1);
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            let (inputs, outputs) = ctx.io();
            if let Some(value) = inputs[0].value().try_get::<i64>().copied() {
                let at = inputs[0].value().timestamp() + TimestampDiff(1);
                outputs[0].add(value, at);
            }
            Ok(())
        }
    }

    let mut registry = CalculatorRegistry::new();
    registry.register::<Accumulate>("Accumulate");
    registry.register::<Delay>("Delay");

    let config = GraphConfig::new()
        .input_stream("in")
        .node(
            NodeConfig::new("Accumulate")
                .input("in")
                .input_port(StreamPort::new("feedback").as_back_edge())
                .output("sums"),
        )
        .node(NodeConfig::new("Delay").input("sums").output("feedback"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = observe_i64(&mut graph, "sums");

    graph.start_run(HashMap::new()).await.expect("start");
    for (t, v) in [(0i64, 1i64), (1, 2), (2, 3)] {
        graph
            .add_packet_to_input_stream("in", Packet::new(v).at(Timestamp::new(t)))
            .await
            .expect("add");
    }
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    // Running sums: 1, 1+2, (1+2)+3.
    assert_eq!(
        *seen.lock(),
        vec![
            (Timestamp::new(0), 1),
            (Timestamp::new(1), 3),
            (Timestamp::new(2), 6),
        ]
    );
}

#[tokio::test]
async fn undeclared_cycle_is_rejected() {
    let mut registry = CalculatorRegistry::new();
    registry.register::<Relay>("Relay");
    let config = GraphConfig::new()
        .node(NodeConfig::new("Relay").input("b").output("a"))
        .node(NodeConfig::new("Relay").input("a").output("b"));
    let err = match CalculatorGraph::new(config, &registry) {
        Ok(_) => panic!("expected graph construction to fail for undeclared cycle"),
        Err(e) => e,
    };
    assert!(
        err.to_string().contains("cycle without a declared back edge"),
        "got {err}"
    );
}

#[tokio::test]
async fn process_timestamp_bounds_rounds_report_settled_progress() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();

    struct BoundProbe {
        log: RoundLog,
    }

    #[async_trait]
    impl Calculator for BoundProbe {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::Any);
            contract.set_process_timestamp_bounds(true);
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            let empties = ctx.inputs().iter().map(|shard| shard.is_empty()).collect();
            self.log.lock().push((ctx.input_timestamp(), empties));
            Ok(())
        }
    }

    let registry = registry_with("BoundProbe", move || BoundProbe {
        log: rounds.clone(),
    });
    let config = GraphConfig::new()
        .input_stream("in")
        .node(NodeConfig::new("BoundProbe").input("in"))
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("in", Packet::new(0i64).at(Timestamp::new(0)))
        .await
        .expect("add");
    graph.wait_until_idle().await.expect("idle");
    graph
        .set_input_stream_timestamp_bound("in", Timestamp::new(5))
        .expect("bound");
    graph.wait_until_idle().await.expect("idle");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(
        *log.lock(),
        vec![
            (Timestamp::new(0), vec![false]),
            (Timestamp::new(4), vec![true]),
        ]
    );
}

#[tokio::test]
async fn headers_and_output_side_packets_flow() {
    struct HeaderSource;

    #[async_trait]
    impl Calculator for HeaderSource {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_output_types(PacketType::of::<i64>());
            contract.set_output_side_packet_type("TOTAL", PacketType::of::<u64>())?;
            Ok(())
        }

        async fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            ctx.output(0).set_header(Packet::new("stream of ints".to_string()));
            ctx.set_output_side_packet("TOTAL", Packet::new(1u64));
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            ctx.output(0).add(42i64, Timestamp::new(0));
            Err(GraphError::Stop)
        }
    }

    let headers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let side_values: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    struct HeaderReader {
        headers: Arc<Mutex<Vec<String>>>,
        side_values: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Calculator for HeaderReader {
        fn contract(contract: &mut CalculatorContract) -> Result<()> {
            contract.set_all_input_types(PacketType::of::<i64>());
            contract.require_input_side_packet("TOTAL", PacketType::of::<u64>())?;
            Ok(())
        }

        async fn open(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            self.side_values
                .lock()
                .push(*ctx.input_side_packet("TOTAL").get::<u64>());
            Ok(())
        }

        async fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
            let header = ctx.input(0).header();
            if !header.is_empty() {
                self.headers.lock().push(header.get::<String>().clone());
            }
            Ok(())
        }
    }

    let mut registry = CalculatorRegistry::new();
    registry.register_with("HeaderSource", || HeaderSource);
    let (reader_headers, reader_sides) = (headers.clone(), side_values.clone());
    registry.register_with("HeaderReader", move || HeaderReader {
        headers: reader_headers.clone(),
        side_values: reader_sides.clone(),
    });

    let config = GraphConfig::new()
        .node(
            NodeConfig::new("HeaderSource")
                .output("ints")
                .output_side_packet("TOTAL", "total"),
        )
        .node(
            NodeConfig::new("HeaderReader")
                .input("ints")
                .input_side_packet("TOTAL", "total"),
        )
        .with_num_workers(1);
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    assert_eq!(
        *graph
            .output_side_packet("total")
            .expect("available after open")
            .get::<u64>(),
        1
    );
    graph.wait_until_done().await.expect("done");

    assert_eq!(*headers.lock(), vec!["stream of ints".to_string()]);
    assert_eq!(*side_values.lock(), vec![1]);
}

#[tokio::test]
async fn graphs_rerun_with_fresh_state() {
    let registry = registry_with("CountSource", || CountSource { limit: 2, next: 0 });
    let config = GraphConfig::new()
        .node(NodeConfig::new("CountSource").output("numbers"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");
    let seen = observe_i64(&mut graph, "numbers");

    graph.run(HashMap::new()).await.expect("first run");
    graph.run(HashMap::new()).await.expect("second run");

    // Each run starts from a fresh calculator instance.
    assert_eq!(
        *seen.lock(),
        vec![
            (Timestamp::new(0), 0),
            (Timestamp::new(1), 1),
            (Timestamp::new(0), 0),
            (Timestamp::new(1), 1),
        ]
    );
}

#[tokio::test]
async fn observed_output_collects_as_a_stream() {
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_stream::StreamExt;

    let registry = registry_with("CountSource", || CountSource { limit: 3, next: 0 });
    let config = GraphConfig::new()
        .node(NodeConfig::new("CountSource").output("numbers"))
        .with_num_workers(1);
    let mut graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    graph
        .observe_output_stream("numbers", move |packet| {
            tx.send(*packet.get::<i64>())
                .map_err(|e| GraphError::execution(e.to_string()))
        })
        .expect("stream exists");

    graph.run(HashMap::new()).await.expect("run");
    drop(graph);

    let values: Vec<i64> = UnboundedReceiverStream::new(rx).collect().await;
    assert_eq!(values, vec![0, 1, 2]);
}

#[tokio::test]
async fn graph_config_from_yaml_runs() {
    let log: RoundLog = Arc::new(Mutex::new(Vec::new()));
    let rounds = log.clone();
    let mut registry = CalculatorRegistry::new();
    registry.register::<Relay>("Relay");
    registry.register_with("JoinRecorder", move || JoinRecorder {
        log: rounds.clone(),
    });

    let yaml = r#"
input_streams: [frames]
executor:
  num_workers: 1
nodes:
  - calculator: Relay
    name: relay
    inputs:
      - { stream: frames }
    outputs:
      - { stream: relayed }
  - calculator: JoinRecorder
    name: record
    inputs:
      - { stream: relayed }
"#;
    let config = GraphConfig::from_yaml(yaml).expect("parses");
    let graph = CalculatorGraph::new(config, &registry).expect("valid graph");

    graph.start_run(HashMap::new()).await.expect("start");
    graph
        .add_packet_to_input_stream("frames", Packet::new(1i64).at(Timestamp::new(3)))
        .await
        .expect("add");
    graph.close_all_input_streams().expect("close");
    graph.wait_until_done().await.expect("done");

    assert_eq!(*log.lock(), vec![(Timestamp::new(3), vec![false])]);
}
