//! The scheduler: readiness tracking, dispatch, backpressure, and shutdown.
//!
//! Execution is event-driven. Every event that can change a node's readiness
//! (a packet propagated, a bound advanced, a stream closed, a round finished)
//! marks the affected nodes dirty and re-runs the dispatch loop ([`pump`]):
//!
//! 1. drain the dirty set, re-evaluating each node's input stream handler;
//! 2. dispatch runnable nodes onto worker tasks while capacity remains
//!    (`num_workers` caps concurrent callbacks; `1` is strictly sequential);
//! 3. with no regular node runnable, drive the source node whose outputs are
//!    furthest behind in timestamp order.
//!
//! A node is dispatched at most once at a time; its callbacks are serialized
//! by construction. Packets and bound updates buffered during a round are
//! propagated *after* the callback returns, then the consumers re-evaluate.
//!
//! Backpressure: queues are soft-bounded. Producers (nodes and the graph
//! input streams) of a full stream are not scheduled until the consumer
//! drains; external adds either block or fail with a throttled error,
//! according to the configured add mode. When the whole graph stalls with a
//! full queue, the stall is either reported as a deadlock error or resolved
//! by growing the stalled queue, per configuration.
//!
//! [`pump`]: Scheduler::pump

pub mod handlers;
pub(crate) mod node;
pub mod stream;

use crate::config::{GraphInputStreamAddMode, InputPolicy};
use crate::context::{InputStreamShard, OutputStreamShard};
use crate::error::{GraphError, NodeStage, Result};
use crate::packet::Packet;
use crate::timestamp::{Timestamp, TimestampDiff};
use handlers::{InputStreamHandler, NodeReadiness};
use node::NodeRuntime;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stream::{InputQueue, OutputChannel, WakeSet};
use tokio::sync::watch;

/// Immutable per-node scheduling data, shared by the dispatch loop and the
/// worker tasks without touching the node's own lock.
pub(crate) struct NodeMeta {
    pub(crate) name: Arc<str>,
    pub(crate) is_source: bool,
    pub(crate) policy: InputPolicy,
    pub(crate) handler: Arc<dyn InputStreamHandler>,
    pub(crate) process_timestamp_bounds: bool,
    pub(crate) timestamp_offset: Option<TimestampDiff>,
    pub(crate) input_queues: Vec<Arc<InputQueue>>,
    pub(crate) outputs: Vec<Arc<OutputChannel>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Prepared,
    Opened,
    Closed,
}

#[derive(Debug)]
struct NodeEntry {
    exec: ExecState,
    lifecycle: Lifecycle,
    last_presented: Timestamp,
    stopped: bool,
    failed: bool,
}

impl NodeEntry {
    fn fresh() -> NodeEntry {
        NodeEntry {
            exec: ExecState::Idle,
            lifecycle: Lifecycle::Prepared,
            last_presented: Timestamp::UNSET,
            stopped: false,
            failed: false,
        }
    }
}

struct SchedState {
    entries: Vec<NodeEntry>,
    dirty: BTreeSet<usize>,
    running: usize,
    started: bool,
    stopping: bool,
    cancelled: bool,
}

/// Run progress bits published through a watch channel so waiters never miss
/// a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) idle: bool,
    pub(crate) done: bool,
}

/// A graph-level input stream: the virtual producer fed by external callers.
pub(crate) struct GraphInputStream {
    pub(crate) name: Arc<str>,
    pub(crate) channel: Arc<OutputChannel>,
    closed: AtomicBool,
    /// Serializes adds on this stream and guards the monotonicity check.
    add_state: Mutex<Timestamp>,
}

impl GraphInputStream {
    pub(crate) fn new(name: Arc<str>, channel: Arc<OutputChannel>) -> GraphInputStream {
        GraphInputStream {
            name,
            channel,
            closed: AtomicBool::new(false),
            add_state: Mutex::new(Timestamp::UNSET),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> WakeSet {
        self.closed.store(true, Ordering::Release);
        self.channel.close()
    }

    fn reset(&self) {
        self.closed.store(false, Ordering::Release);
        *self.add_state.lock() = Timestamp::UNSET;
    }
}

/// What a worker task has been asked to do.
enum Action {
    Process {
        at: Timestamp,
        inputs: Vec<InputStreamShard>,
    },
    SourceProcess,
    Close,
}

/// Outcome of a read-only dispatchability check.
enum Peek {
    Process(Timestamp),
    Source,
    Close,
}

pub(crate) struct SchedulerOptions {
    pub(crate) num_workers: usize,
    pub(crate) report_deadlock: bool,
    pub(crate) deadlock_queue_growth: usize,
}

pub(crate) struct Scheduler {
    pub(crate) metas: Vec<NodeMeta>,
    pub(crate) nodes: Vec<tokio::sync::Mutex<NodeRuntime>>,
    pub(crate) graph_inputs: Vec<GraphInputStream>,
    options: SchedulerOptions,
    state: Mutex<SchedState>,
    error: Mutex<Option<GraphError>>,
    progress_tx: watch::Sender<Progress>,
    /// Signalled once per full→non-full queue transition and on shutdown, to
    /// wake blocked external adds without busy-looping.
    unthrottle: tokio::sync::Notify,
}

impl Scheduler {
    pub(crate) fn new(
        metas: Vec<NodeMeta>,
        nodes: Vec<tokio::sync::Mutex<NodeRuntime>>,
        graph_inputs: Vec<GraphInputStream>,
        options: SchedulerOptions,
    ) -> Scheduler {
        let entries = metas.iter().map(|_| NodeEntry::fresh()).collect();
        let (progress_tx, _) = watch::channel(Progress::default());
        Scheduler {
            metas,
            nodes,
            graph_inputs,
            options,
            state: Mutex::new(SchedState {
                entries,
                dirty: BTreeSet::new(),
                running: 0,
                started: false,
                stopping: false,
                cancelled: false,
            }),
            error: Mutex::new(None),
            progress_tx,
            unthrottle: tokio::sync::Notify::new(),
        }
    }

    /// Clears all per-run state for a fresh `start_run`.
    pub(crate) fn reset(&self) {
        let mut st = self.state.lock();
        for entry in &mut st.entries {
            *entry = NodeEntry::fresh();
        }
        st.dirty.clear();
        st.running = 0;
        st.started = false;
        st.stopping = false;
        st.cancelled = false;
        for meta in &self.metas {
            for queue in &meta.input_queues {
                queue.reset();
            }
            for channel in &meta.outputs {
                channel.reset();
            }
        }
        for input in &self.graph_inputs {
            input.channel.reset();
            input.reset();
        }
        *self.error.lock() = None;
        self.progress_tx.send_replace(Progress::default());
    }

    pub(crate) fn mark_opened(&self, idx: usize) {
        self.state.lock().entries[idx].lifecycle = Lifecycle::Opened;
    }

    pub(crate) fn note_wake(&self, wake: WakeSet) {
        self.state.lock().dirty.extend(wake);
    }

    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.started = true;
            let all: Vec<usize> = (0..self.metas.len()).collect();
            st.dirty.extend(all);
        }
        self.pump();
    }

    pub(crate) fn current_error(&self) -> Option<GraphError> {
        self.error.lock().clone()
    }

    pub(crate) fn take_error(&self) -> Option<GraphError> {
        self.error.lock().take()
    }

    pub(crate) fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    fn graph_input(&self, name: &str) -> Result<&GraphInputStream> {
        self.graph_inputs
            .iter()
            .find(|input| &*input.name == name)
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!("'{name}' is not a graph input stream"))
            })
    }

    /// Feeds one packet into a graph input stream, honoring the add mode.
    pub(crate) async fn add_packet(
        self: &Arc<Self>,
        name: &str,
        packet: Packet,
        mode: GraphInputStreamAddMode,
    ) -> Result<()> {
        let input = self.graph_input(name)?;
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(GraphError::InvalidArgument(format!(
                "timestamp {ts} is not allowed on input stream '{name}'"
            )));
        }
        let expected = input.channel.packet_type();
        if !expected.matches_payload(packet.payload_type_id()) {
            return Err(GraphError::InvalidArgument(format!(
                "input stream '{name}' carries {}, got a packet of {}",
                expected.name(),
                packet.type_name().unwrap_or("<empty>")
            )));
        }

        loop {
            let notified = self.unthrottle.notified();
            if let Some(error) = self.current_error() {
                return Err(error);
            }
            if input.is_closed() {
                return Err(GraphError::InvalidState(format!(
                    "input stream '{name}' is closed"
                )));
            }

            if !input.channel.any_consumer_full() {
                let wake = {
                    let mut last = input.add_state.lock();
                    if input.is_closed() {
                        return Err(GraphError::InvalidState(format!(
                            "input stream '{name}' is closed"
                        )));
                    }
                    if ts <= *last {
                        let previous = *last;
                        return Err(GraphError::InvalidArgument(format!(
                            "timestamp {ts} on input stream '{name}' is not greater than the \
                             last added timestamp {previous}"
                        )));
                    }
                    *last = ts;
                    input.channel.commit(
                        vec![packet],
                        ts.next_allowed_in_stream(),
                        None,
                        false,
                    )
                };
                self.note_wake(wake);
                self.pump();
                return Ok(());
            }

            // A consumer queue is full. If the graph cannot make progress on
            // its own, this is a deadlock: report it or grow the queue.
            let stalled = {
                let st = self.state.lock();
                st.started && st.running == 0 && !self.any_dispatchable(&st)
            };
            if stalled {
                if self.options.report_deadlock {
                    let error = GraphError::Deadlock(format!(
                        "input stream '{name}' is full and no node can run; \
                         consider raising max_queue_size"
                    ));
                    self.record_error_and_stop(error.clone());
                    self.pump();
                    return Err(error);
                }
                let growth = self.options.deadlock_queue_growth.max(1);
                input.channel.for_each_full_queue(|queue| {
                    let new_cap = queue.grow(growth);
                    tracing::warn!(
                        stream = queue.stream_name(),
                        queued = queue.len(),
                        new_capacity = ?new_cap,
                        "graph stalled on a full queue; growing it past its configured limit"
                    );
                });
                continue;
            }

            match mode {
                GraphInputStreamAddMode::AddIfNotFull => {
                    return Err(GraphError::Throttled {
                        stream: name.to_string(),
                    });
                }
                GraphInputStreamAddMode::WaitUntilNotFull => {
                    notified.await;
                }
            }
        }
    }

    /// Advances a graph input stream's timestamp bound without a packet.
    pub(crate) fn set_input_timestamp_bound(
        self: &Arc<Self>,
        name: &str,
        bound: Timestamp,
    ) -> Result<()> {
        let input = self.graph_input(name)?;
        if input.is_closed() {
            return Err(GraphError::InvalidState(format!(
                "input stream '{name}' is closed"
            )));
        }
        {
            let mut last = input.add_state.lock();
            // Future packets must respect the promise just made.
            if bound > *last {
                *last = bound.previous_allowed_in_stream();
            }
        }
        let wake = input.channel.advance_bound(bound);
        self.note_wake(wake);
        self.pump();
        Ok(())
    }

    pub(crate) fn close_input(self: &Arc<Self>, name: &str) -> Result<()> {
        let input = self.graph_input(name)?;
        let wake = input.close();
        self.note_wake(wake);
        self.unthrottle.notify_waiters();
        self.pump();
        Ok(())
    }

    pub(crate) fn close_all_inputs(self: &Arc<Self>) {
        let mut wake = WakeSet::new();
        for input in &self.graph_inputs {
            wake.extend(input.close());
        }
        self.note_wake(wake);
        self.unthrottle.notify_waiters();
        self.pump();
    }

    /// Closes every packet source: all graph input streams immediately, and
    /// every source node before its next round. In-flight rounds complete and
    /// buffered packets drain.
    pub(crate) fn close_all_packet_sources(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            self.initiate_stop(&mut st);
        }
        self.pump();
    }

    /// Hard stop: records `Cancelled`, closes all sources, and skips the
    /// remaining buffered work. Nodes still shut down through `close`.
    pub(crate) fn cancel(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.cancelled = true;
            self.initiate_stop(&mut st);
            {
                let mut error = self.error.lock();
                if error.is_none() {
                    *error = Some(GraphError::Cancelled);
                }
            }
            let all: Vec<usize> = (0..self.metas.len()).collect();
            st.dirty.extend(all);
        }
        self.pump();
    }

    pub(crate) async fn wait_until_idle(&self) -> Result<()> {
        let mut rx = self.progress();
        rx.wait_for(|progress| progress.idle)
            .await
            .map_err(|_| GraphError::InvalidState("scheduler is gone".into()))?;
        match self.current_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub(crate) async fn wait_until_done(&self) -> Result<()> {
        let mut rx = self.progress();
        rx.wait_for(|progress| progress.done)
            .await
            .map_err(|_| GraphError::InvalidState("scheduler is gone".into()))?;
        match self.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Marks sources and graph inputs closed; callers pump afterwards.
    fn initiate_stop(&self, st: &mut SchedState) {
        if !st.stopping {
            st.stopping = true;
            tracing::debug!("closing all packet sources");
        }
        let mut wake = WakeSet::new();
        for input in &self.graph_inputs {
            wake.extend(input.close());
        }
        st.dirty.extend(wake);
        for (idx, meta) in self.metas.iter().enumerate() {
            if meta.is_source {
                st.dirty.insert(idx);
            }
        }
        self.unthrottle.notify_waiters();
    }

    fn record_error_and_stop(self: &Arc<Self>, error: GraphError) {
        let mut st = self.state.lock();
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                tracing::error!(error = %error, "recording terminal graph error");
                *slot = Some(error);
            }
        }
        self.initiate_stop(&mut st);
        self.refresh_progress(&mut st);
    }

    /// The dispatch loop. Cheap to call; every state transition funnels
    /// through here.
    pub(crate) fn pump(self: &Arc<Self>) {
        let mut to_spawn: Vec<(usize, Action)> = Vec::new();
        {
            let mut st = self.state.lock();
            if !st.started {
                return;
            }
            let mut propagated: Vec<bool> = vec![false; self.metas.len()];
            let mut freed_any = false;

            while st.running + to_spawn.len() < self.options.num_workers {
                let Some((idx, action)) = self.next_action(&mut st, &mut propagated, &mut freed_any)
                else {
                    break;
                };
                st.entries[idx].exec = ExecState::Running;
                to_spawn.push((idx, action));
            }

            if freed_any {
                self.unthrottle.notify_waiters();
                // A drained queue may unblock upstream producers anywhere in
                // the graph; re-evaluate everything that is still open.
                for idx in 0..self.metas.len() {
                    if st.entries[idx].lifecycle == Lifecycle::Opened {
                        st.dirty.insert(idx);
                    }
                }
            }

            st.running += to_spawn.len();
            self.refresh_progress(&mut st);
        }

        for (idx, action) in to_spawn {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_node(idx, action).await;
            });
        }
    }

    /// Finds the next dispatchable node: regular nodes from the dirty set
    /// first, then the dispatchable source that is furthest behind.
    fn next_action(
        &self,
        st: &mut SchedState,
        propagated: &mut [bool],
        freed_any: &mut bool,
    ) -> Option<(usize, Action)> {
        while let Some(&idx) = st.dirty.iter().next() {
            st.dirty.remove(&idx);
            if let Some(action) = self.decide(idx, st, propagated, freed_any) {
                return Some((idx, action));
            }
        }

        if !st.stopping && !st.cancelled {
            let mut best: Option<(Timestamp, usize)> = None;
            for (idx, meta) in self.metas.iter().enumerate() {
                if !meta.is_source {
                    continue;
                }
                let entry = &st.entries[idx];
                if entry.exec != ExecState::Idle
                    || entry.lifecycle != Lifecycle::Opened
                    || entry.stopped
                    || entry.failed
                    || self.output_backpressured(idx)
                {
                    continue;
                }
                let order = self.source_process_order(idx);
                if best.map_or(true, |(key, _)| order < key) {
                    best = Some((order, idx));
                }
            }
            if let Some((_, idx)) = best {
                return Some((idx, Action::SourceProcess));
            }
        }
        None
    }

    /// Scheduling key for sources: the minimum next-timestamp bound across
    /// the node's output streams, so the source most behind runs first.
    fn source_process_order(&self, idx: usize) -> Timestamp {
        self.metas[idx]
            .outputs
            .iter()
            .map(|channel| channel.bound())
            .min()
            .unwrap_or(Timestamp::DONE)
    }

    fn output_backpressured(&self, idx: usize) -> bool {
        self.metas[idx]
            .outputs
            .iter()
            .any(|channel| channel.any_consumer_full())
    }

    /// Read-only dispatchability check, shared by dispatch and stall
    /// detection.
    fn peek(&self, idx: usize, st: &SchedState) -> Option<Peek> {
        let entry = &st.entries[idx];
        let meta = &self.metas[idx];
        if entry.exec != ExecState::Idle || entry.lifecycle != Lifecycle::Opened {
            return None;
        }
        if st.cancelled || entry.failed || entry.stopped {
            return Some(Peek::Close);
        }
        if meta.is_source {
            if st.stopping {
                return Some(Peek::Close);
            }
            if self.output_backpressured(idx) {
                return None;
            }
            return Some(Peek::Source);
        }
        let ports: Vec<_> = meta.input_queues.iter().map(|q| q.snapshot()).collect();
        match meta.handler.readiness(
            &ports,
            entry.last_presented,
            meta.process_timestamp_bounds,
        ) {
            NodeReadiness::CloseNode => Some(Peek::Close),
            NodeReadiness::ProcessAt(at) => {
                if self.output_backpressured(idx) {
                    None
                } else {
                    Some(Peek::Process(at))
                }
            }
            NodeReadiness::NotReady => None,
        }
    }

    fn any_dispatchable(&self, st: &SchedState) -> bool {
        (0..self.metas.len()).any(|idx| self.peek(idx, st).is_some())
    }

    /// Commits a dispatch decision: fills the input set and advances the
    /// node's presented clock. For non-runnable nodes with a declared
    /// timestamp offset, propagates the input bound through to the outputs.
    fn decide(
        &self,
        idx: usize,
        st: &mut SchedState,
        propagated: &mut [bool],
        freed_any: &mut bool,
    ) -> Option<Action> {
        let meta = &self.metas[idx];
        match self.peek(idx, st) {
            Some(Peek::Close) => Some(Action::Close),
            Some(Peek::Source) => {
                // Sources are ordered globally; leave dispatch to the
                // source-selection step in `next_action`.
                None
            }
            Some(Peek::Process(at)) => {
                let filled = handlers::fill_inputs(meta.policy, &meta.input_queues, at);
                *freed_any |= filled.unthrottled;
                st.entries[idx].last_presented = at;
                let inputs = filled
                    .packets
                    .into_iter()
                    .zip(&meta.input_queues)
                    .map(|(packet, queue)| InputStreamShard {
                        packet,
                        header: queue.header(),
                        done: queue.snapshot().is_done(),
                    })
                    .collect();
                Some(Action::Process { at, inputs })
            }
            None => {
                if !meta.is_source
                    && !propagated[idx]
                    && st.entries[idx].lifecycle == Lifecycle::Opened
                    && st.entries[idx].exec == ExecState::Idle
                {
                    propagated[idx] = true;
                    self.propagate_idle_bound(idx, st);
                }
                None
            }
        }
    }

    /// A node that is not runnable but declared a timestamp offset still
    /// promises "nothing earlier than input-bound + offset" downstream; this
    /// keeps bounds flowing through idle pass-through chains.
    fn propagate_idle_bound(&self, idx: usize, st: &mut SchedState) {
        let meta = &self.metas[idx];
        let Some(offset) = meta.timestamp_offset else {
            return;
        };
        let Some(settled) = meta
            .input_queues
            .iter()
            .map(|queue| queue.snapshot().next_possible())
            .min()
        else {
            return;
        };
        let out_bound = settled + offset;
        for channel in &meta.outputs {
            let wake = channel.advance_bound(out_bound);
            st.dirty.extend(wake);
        }
    }

    async fn run_node(self: Arc<Self>, idx: usize, action: Action) {
        let meta = &self.metas[idx];
        let (stage, at, inputs) = match action {
            Action::Process { at, inputs } => (NodeStage::Process, at, inputs),
            Action::SourceProcess => (NodeStage::Process, Timestamp::UNSET, Vec::new()),
            Action::Close => {
                let inputs = meta
                    .input_queues
                    .iter()
                    .map(|queue| InputStreamShard {
                        packet: Packet::empty(),
                        header: queue.header(),
                        done: true,
                    })
                    .collect();
                (NodeStage::Close, Timestamp::DONE, inputs)
            }
        };

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

        tracing::debug!(node = %meta.name, stage = %stage, ts = %at, "dispatching node");
        let outcome = {
            let mut node = self.nodes[idx].lock().await;
            node.run_stage(stage, at, inputs, outputs).await
        };

        let mut wake = WakeSet::new();
        for (shard, channel) in outcome.outputs.into_iter().zip(&meta.outputs) {
            let mut final_bound = shard.bound;
            if stage == NodeStage::Process && at.is_range_value() {
                if let Some(offset) = meta.timestamp_offset {
                    final_bound = final_bound.max((at + offset).next_allowed_in_stream());
                }
            }
            let close = shard.close_requested || stage == NodeStage::Close;
            wake.extend(channel.commit(shard.packets, final_bound, shard.header_update, close));
        }

        {
            let mut st = self.state.lock();
            st.running -= 1;
            st.entries[idx].exec = ExecState::Idle;
            if stage == NodeStage::Close {
                st.entries[idx].lifecycle = Lifecycle::Closed;
                tracing::debug!(node = %meta.name, "node closed");
            } else {
                st.dirty.insert(idx);
            }
            st.dirty.extend(wake);

            match outcome.result {
                Ok(()) => {}
                Err(error) if error.is_stop() => {
                    if stage == NodeStage::Process {
                        st.entries[idx].stopped = true;
                        if meta.is_source {
                            tracing::debug!(node = %meta.name, "source reports end of data");
                        } else {
                            // A non-source stop also shuts the whole graph's
                            // packet sources; buffered data still drains.
                            tracing::debug!(node = %meta.name, "node requested a graceful stop");
                            self.initiate_stop(&mut st);
                        }
                    }
                }
                Err(error) => {
                    if stage != NodeStage::Close {
                        st.entries[idx].failed = true;
                    }
                    {
                        let mut slot = self.error.lock();
                        if slot.is_none() {
                            tracing::error!(error = %error, "recording terminal graph error");
                            *slot = Some(error);
                        }
                    }
                    self.initiate_stop(&mut st);
                }
            }
        }
        self.pump();
    }

    fn refresh_progress(&self, st: &mut SchedState) {
        let idle = st.started && st.running == 0 && !self.any_dispatchable(st);
        let done = st.started
            && st.running == 0
            && st
                .entries
                .iter()
                .all(|entry| entry.lifecycle == Lifecycle::Closed);
        let progress = Progress { idle, done };
        self.progress_tx.send_if_modified(|current| {
            if *current != progress {
                *current = progress;
                true
            } else {
                false
            }
        });
        if done {
            self.unthrottle.notify_waiters();
        }
    }
}
