//! Topology execution runtime
//!
//! A [`Topology`] owns a set of named nodes (sources, boxes, sinks) wired by
//! labeled edges, and drives each node with one tokio task. Lifecycle follows
//! a small state machine:
//!
//! ```text
//! INITIALIZED -> RUNNING <-> PAUSED
//!        \          |
//!         \         v
//!          +--> STOPPING -> STOPPED
//! ```
//!
//! Each node worker is controlled through a [`NodeControl`] channel: the
//! runtime can attach and detach input channels of a running worker and flag
//! it for drain. Backpressure is natural: per-edge channels are bounded, so a
//! slow consumer blocks its upstream.
//!
//! While running, the graph may be mutated: `add_source` / `add_box` /
//! `add_sink` / `input` / `remove`. Every edge mutation re-runs the cycle
//! check against the live graph before committing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

use crate::builder::find_cycle;
use crate::connector::{
    BoxWriterAdapter, Destinations, EdgeKey, InputConfig, NodeControl, TraceWriter, Writer,
    DEFAULT_INPUT_NAME, SINK_INPUT_NAME,
};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::{validate_node_name, BoxOp, InputConstraints, NodeKind, NodeState, Sink, Source};
use crate::tuple::{trace, EventKind, Tuple};

// ---------------------------------------------------------------------------
// Topology state
// ---------------------------------------------------------------------------

/// Lifecycle state of a topology. The ordering matters: `wait_for` resolves
/// once the observed state is at or past the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TopologyState {
    Initialized,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyState::Initialized => "initialized",
            TopologyState::Running => "running",
            TopologyState::Paused => "paused",
            TopologyState::Stopping => "stopping",
            TopologyState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A directed, labeled connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub input_name: String,
}

// ---------------------------------------------------------------------------
// Node table
// ---------------------------------------------------------------------------

struct BoxSeed {
    box_op: Box<dyn BoxOp>,
    control_rx: mpsc::UnboundedReceiver<NodeControl>,
}

struct SinkSeed {
    sink: Box<dyn Sink>,
    control_rx: mpsc::UnboundedReceiver<NodeControl>,
}

enum NodeRuntime {
    Source {
        source: Arc<dyn Source>,
        dests: Arc<Destinations>,
        join: Option<JoinHandle<()>>,
    },
    Box {
        dests: Arc<Destinations>,
        control_tx: mpsc::UnboundedSender<NodeControl>,
        constraints: Option<InputConstraints>,
        seed: Option<BoxSeed>,
        join: Option<JoinHandle<()>>,
    },
    Sink {
        control_tx: mpsc::UnboundedSender<NodeControl>,
        seed: Option<SinkSeed>,
        join: Option<JoinHandle<()>>,
    },
}

struct NodeEntry {
    kind: NodeKind,
    state_tx: watch::Sender<NodeState>,
    stop_on_disconnect: bool,
    runtime: NodeRuntime,
}

impl NodeEntry {
    fn new_source(source: Arc<dyn Source>, pause: watch::Receiver<bool>) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Initialized);
        Self {
            kind: NodeKind::Source,
            state_tx,
            stop_on_disconnect: false,
            runtime: NodeRuntime::Source {
                source,
                dests: Arc::new(Destinations::with_pause_gate(pause)),
                join: None,
            },
        }
    }

    fn new_box(box_op: Box<dyn BoxOp>, constraints: Option<InputConstraints>) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Initialized);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            kind: NodeKind::Box,
            state_tx,
            stop_on_disconnect: false,
            runtime: NodeRuntime::Box {
                dests: Arc::new(Destinations::new()),
                control_tx,
                constraints,
                seed: Some(BoxSeed { box_op, control_rx }),
                join: None,
            },
        }
    }

    fn new_sink(sink: Box<dyn Sink>) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Initialized);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            kind: NodeKind::Sink,
            state_tx,
            stop_on_disconnect: false,
            runtime: NodeRuntime::Sink {
                control_tx,
                seed: Some(SinkSeed { sink, control_rx }),
                join: None,
            },
        }
    }

    fn dests(&self) -> Option<&Arc<Destinations>> {
        match &self.runtime {
            NodeRuntime::Source { dests, .. } | NodeRuntime::Box { dests, .. } => Some(dests),
            NodeRuntime::Sink { .. } => None,
        }
    }

    fn control_tx(&self) -> Option<&mpsc::UnboundedSender<NodeControl>> {
        match &self.runtime {
            NodeRuntime::Box { control_tx, .. } | NodeRuntime::Sink { control_tx, .. } => {
                Some(control_tx)
            }
            NodeRuntime::Source { .. } => None,
        }
    }

    fn constraints(&self) -> Option<&InputConstraints> {
        match &self.runtime {
            NodeRuntime::Box { constraints, .. } => constraints.as_ref(),
            _ => None,
        }
    }

    fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }
}

struct NodeTable {
    nodes: HashMap<String, NodeEntry>,
    edges: Vec<Edge>,
}

impl NodeTable {
    fn source_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, e)| e.kind == NodeKind::Source)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

struct TopologyInner {
    name: String,
    ctx: Context,
    state_tx: watch::Sender<TopologyState>,
    state_lock: std::sync::Mutex<()>,
    pause_tx: watch::Sender<bool>,
    table: Mutex<NodeTable>,
}

/// A running dataflow graph. Cheap to clone; all clones share the same
/// underlying topology.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

/// Non-owning handle to a [`Topology`].
///
/// Nodes stored inside the topology must not hold a strong `Topology`
/// clone: the node table owns the nodes, so a strong handle captured by a
/// node (e.g. a self-removal hook) would form a reference cycle and leak the
/// whole topology. Such hooks hold a `WeakTopology` and upgrade it when they
/// fire; if the topology is already gone, there is nothing left to detach
/// from.
#[derive(Clone)]
pub struct WeakTopology {
    inner: Weak<TopologyInner>,
}

impl WeakTopology {
    /// Recover a strong handle, or `None` when the topology has been
    /// dropped.
    pub fn upgrade(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }
}

impl Topology {
    /// Create an empty topology in the `Initialized` state. Nodes are
    /// usually added through [`crate::builder::TopologyBuilder`] or the
    /// dynamic mutation API.
    pub fn new(name: impl Into<String>, ctx: Context) -> Self {
        Self::assemble(name.into(), ctx, NodeTable {
            nodes: HashMap::new(),
            edges: Vec::new(),
        })
    }

    fn assemble(name: String, ctx: Context, table: NodeTable) -> Self {
        let (state_tx, _) = watch::channel(TopologyState::Initialized);
        let (pause_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TopologyInner {
                name,
                ctx,
                state_tx,
                state_lock: std::sync::Mutex::new(()),
                pause_tx,
                table: Mutex::new(table),
            }),
        }
    }

    /// Materialize a frozen builder. Inputs are assumed validated.
    pub(crate) fn from_parts(
        name: String,
        ctx: Context,
        sources: Vec<(String, Arc<dyn Source>)>,
        boxes: Vec<(String, Box<dyn BoxOp>, Option<InputConstraints>)>,
        sinks: Vec<(String, Box<dyn Sink>)>,
        edges: Vec<Edge>,
    ) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let mut table = NodeTable {
            nodes: HashMap::new(),
            edges: Vec::new(),
        };
        for (n, s) in sources {
            table
                .nodes
                .insert(n, NodeEntry::new_source(s, pause_tx.subscribe()));
        }
        for (n, b, c) in boxes {
            table.nodes.insert(n, NodeEntry::new_box(b, c));
        }
        for (n, s) in sinks {
            table.nodes.insert(n, NodeEntry::new_sink(s));
        }
        for edge in edges {
            wire_edge(&mut table, edge, crate::connector::DEFAULT_EDGE_CAPACITY);
        }

        let (state_tx, _) = watch::channel(TopologyState::Initialized);
        Self {
            inner: Arc::new(TopologyInner {
                name,
                ctx,
                state_tx,
                state_lock: std::sync::Mutex::new(()),
                pause_tx,
                table: Mutex::new(table),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// A non-owning handle to this topology, for callbacks stored inside
    /// nodes the topology itself owns.
    pub fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TopologyState {
        *self.inner.state_tx.borrow()
    }

    /// Wait until the topology reaches `target` (or any later state) and
    /// return the state actually observed.
    pub async fn wait_for(&self, target: TopologyState) -> TopologyState {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current >= target {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }

    fn transition(&self, allowed_from: &[TopologyState], to: TopologyState) -> Result<()> {
        let _guard = self.inner.state_lock.lock().expect("state lock poisoned");
        let current = *self.inner.state_tx.borrow();
        if current == TopologyState::Stopped {
            return Err(Error::Stopped);
        }
        if !allowed_from.contains(&current) {
            return Err(Error::InvalidStateTransition { from: current, to });
        }
        self.inner.state_tx.send_replace(to);
        Ok(())
    }

    fn force_state(&self, to: TopologyState) {
        let _guard = self.inner.state_lock.lock().expect("state lock poisoned");
        self.inner.state_tx.send_replace(to);
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        match self.state() {
            TopologyState::Stopping | TopologyState::Stopped => Err(Error::Stopped),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every node worker and transition to `Running`.
    ///
    /// All boxes are initialized before any worker starts; consumers are
    /// spawned before sources so that every edge has a reader when the first
    /// tuple is produced.
    pub async fn run(&self) -> Result<()> {
        self.transition(&[TopologyState::Initialized], TopologyState::Running)?;

        let mut table = self.inner.table.lock().await;
        if !table.nodes.values().any(|e| e.kind == NodeKind::Source) {
            self.force_state(TopologyState::Initialized);
            return Err(Error::NoSources);
        }

        let ctx = self.inner.ctx.clone();
        for (name, entry) in table.nodes.iter_mut() {
            if let NodeRuntime::Box {
                seed: Some(seed), ..
            } = &mut entry.runtime
            {
                if let Err(e) = seed.box_op.init(&ctx).await {
                    error!(node_type = "box", node_name = %name, error = %e, "box failed to initialize");
                    self.force_state(TopologyState::Initialized);
                    return Err(e);
                }
            }
        }

        for (name, entry) in table.nodes.iter_mut() {
            if entry.kind != NodeKind::Source {
                spawn_node_worker(&ctx, name, entry);
            }
        }
        for (name, entry) in table.nodes.iter_mut() {
            if entry.kind == NodeKind::Source {
                spawn_node_worker(&ctx, name, entry);
            }
        }

        info!(topology = %self.inner.name, "topology started");
        Ok(())
    }

    /// Pause tuple ingress. Only valid while `Running`.
    pub async fn pause(&self) -> Result<()> {
        self.transition(&[TopologyState::Running], TopologyState::Paused)?;
        self.inner.pause_tx.send_replace(true);
        info!(topology = %self.inner.name, "topology paused");
        Ok(())
    }

    /// Resume a paused topology.
    pub async fn resume(&self) -> Result<()> {
        self.transition(&[TopologyState::Paused], TopologyState::Running)?;
        self.inner.pause_tx.send_replace(false);
        info!(topology = %self.inner.name, "topology resumed");
        Ok(())
    }

    /// Stop the topology: ask every source to stop, drain boxes and sinks
    /// through channel-close propagation, and wait until every worker exited.
    ///
    /// Idempotent: calling `stop` on a stopped topology returns `Ok`, and
    /// concurrent callers block until `Stopped` is reached.
    pub async fn stop(&self) -> Result<()> {
        let claimed = {
            let _guard = self.inner.state_lock.lock().expect("state lock poisoned");
            match *self.inner.state_tx.borrow() {
                TopologyState::Stopped => return Ok(()),
                TopologyState::Stopping => false,
                _ => {
                    self.inner.state_tx.send_replace(TopologyState::Stopping);
                    // Unblock any write gated on pause.
                    self.inner.pause_tx.send_replace(false);
                    true
                }
            }
        };
        if !claimed {
            // Another caller is stopping; block until it finishes.
            self.wait_for(TopologyState::Stopped).await;
            return Ok(());
        }

        let ctx = self.inner.ctx.clone();
        let mut result = Ok(());
        {
            let mut table = self.inner.table.lock().await;

            for (name, entry) in table.nodes.iter() {
                if let NodeRuntime::Source { source, .. } = &entry.runtime {
                    if let Err(e) = source.stop(&ctx).await {
                        warn!(node_type = "source", node_name = %name, error = %e, "source failed to stop");
                        result = Err(e);
                    }
                }
            }
            for entry in table.nodes.values_mut() {
                if let NodeRuntime::Source { join, dests, .. } = &mut entry.runtime {
                    if let Some(j) = join.take() {
                        let _ = j.await;
                    } else {
                        dests.close();
                    }
                }
            }

            for entry in table.nodes.values() {
                if let Some(control) = entry.control_tx() {
                    let _ = control.send(NodeControl::StopOnDisconnect);
                }
            }
            for entry in table.nodes.values_mut() {
                if entry.kind == NodeKind::Box {
                    if let NodeRuntime::Box { join, dests, .. } = &mut entry.runtime {
                        if let Some(j) = join.take() {
                            let _ = j.await;
                        } else {
                            dests.close();
                        }
                    }
                }
            }
            for entry in table.nodes.values_mut() {
                if entry.kind == NodeKind::Sink {
                    if let NodeRuntime::Sink { join, .. } = &mut entry.runtime {
                        if let Some(j) = join.take() {
                            let _ = j.await;
                        }
                    }
                }
            }
        }

        self.force_state(TopologyState::Stopped);
        info!(topology = %self.inner.name, "topology stopped");
        result
    }

    // -----------------------------------------------------------------------
    // Dynamic mutation
    // -----------------------------------------------------------------------

    /// Add a source. When the topology is running, the source's worker
    /// starts immediately.
    pub async fn add_source(&self, name: &str, source: Arc<dyn Source>) -> Result<()> {
        self.ensure_not_stopped()?;
        validate_node_name(name)?;
        let mut table = self.inner.table.lock().await;
        if table.nodes.contains_key(name) {
            return Err(Error::NameTaken(name.to_string()));
        }
        let mut entry = NodeEntry::new_source(source, self.inner.pause_tx.subscribe());
        if self.is_live() {
            spawn_node_worker(&self.inner.ctx, name, &mut entry);
        }
        table.nodes.insert(name.to_string(), entry);
        Ok(())
    }

    /// Add a box. When the topology is running, the box is initialized here
    /// (propagating any error) and its worker starts immediately.
    pub async fn add_box(&self, name: &str, box_op: Box<dyn BoxOp>) -> Result<()> {
        self.ensure_not_stopped()?;
        validate_node_name(name)?;
        let mut table = self.inner.table.lock().await;
        if table.nodes.contains_key(name) {
            return Err(Error::NameTaken(name.to_string()));
        }
        let constraints = box_op.input_constraints()?;
        let mut entry = NodeEntry::new_box(box_op, constraints);
        if self.is_live() {
            if let NodeRuntime::Box {
                seed: Some(seed), ..
            } = &mut entry.runtime
            {
                if let Err(e) = seed.box_op.init(&self.inner.ctx).await {
                    return Err(e);
                }
            }
            spawn_node_worker(&self.inner.ctx, name, &mut entry);
        }
        table.nodes.insert(name.to_string(), entry);
        Ok(())
    }

    /// Add a sink. When the topology is running, the sink's worker starts
    /// immediately.
    pub async fn add_sink(&self, name: &str, sink: Box<dyn Sink>) -> Result<()> {
        self.ensure_not_stopped()?;
        validate_node_name(name)?;
        let mut table = self.inner.table.lock().await;
        if table.nodes.contains_key(name) {
            return Err(Error::NameTaken(name.to_string()));
        }
        let mut entry = NodeEntry::new_sink(sink);
        if self.is_live() {
            spawn_node_worker(&self.inner.ctx, name, &mut entry);
        }
        table.nodes.insert(name.to_string(), entry);
        Ok(())
    }

    /// Connect `from` into `node`. For boxes the edge label comes from
    /// `cfg.input_name` (default `"*"`); sinks always receive `"output"`.
    ///
    /// The mutation is rejected - leaving the graph untouched - when the
    /// referenced nodes are missing, the label is not accepted, the edge
    /// already exists, or the new edge would create a cycle.
    pub async fn input(&self, node: &str, from: &str, cfg: InputConfig) -> Result<()> {
        self.ensure_not_stopped()?;
        let mut table = self.inner.table.lock().await;

        let to_entry = table
            .nodes
            .get(node)
            .ok_or_else(|| Error::NotFound(node.to_string()))?;
        let input_name = match to_entry.kind {
            NodeKind::Box => cfg
                .input_name
                .clone()
                .unwrap_or_else(|| DEFAULT_INPUT_NAME.to_string()),
            NodeKind::Sink => SINK_INPUT_NAME.to_string(),
            NodeKind::Source => return Err(Error::NotFound(node.to_string())),
        };
        if let Some(constraints) = to_entry.constraints() {
            if !constraints.accepts(&input_name) {
                return Err(Error::LabelRejected {
                    name: node.to_string(),
                    input_name,
                });
            }
        }

        let from_entry = table
            .nodes
            .get(from)
            .ok_or_else(|| Error::UnknownRef(from.to_string()))?;
        if from_entry.kind == NodeKind::Sink {
            return Err(Error::UnknownRef(from.to_string()));
        }

        let edge = Edge {
            from: from.to_string(),
            to: node.to_string(),
            input_name: input_name.clone(),
        };
        if table.edges.iter().any(|e| *e == edge) {
            return Err(Error::DuplicateEdge {
                from: edge.from,
                to: edge.to,
                input_name: edge.input_name,
            });
        }

        let mut candidate = table.edges.clone();
        candidate.push(edge.clone());
        if let Some(path) = find_cycle(&table.source_names(), &candidate) {
            return Err(Error::CycleDetected { path });
        }

        wire_edge_checked(&mut table, edge, cfg.capacity.max(1))?;
        Ok(())
    }

    /// Flag a box or sink so that it terminates once every input channel has
    /// closed. No effect on sources.
    pub async fn set_stop_on_disconnect(&self, name: &str) -> Result<()> {
        let mut table = self.inner.table.lock().await;
        let entry = table
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        entry.stop_on_disconnect = true;
        if let Some(control) = entry.control_tx() {
            let _ = control.send(NodeControl::StopOnDisconnect);
        }
        Ok(())
    }

    /// Remove a node: detach its inbound edges, wait for its worker to drain
    /// and exit (which closes its outbound channels and runs its terminate
    /// hook), and drop it from the table.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.ensure_not_stopped()?;
        let mut table = self.inner.table.lock().await;
        let mut entry = table
            .nodes
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let inbound: Vec<Edge> = table
            .edges
            .iter()
            .filter(|e| e.to == name)
            .cloned()
            .collect();
        for e in &inbound {
            if let Some(up) = table.nodes.get(&e.from) {
                if let Some(dests) = up.dests() {
                    dests.remove_destination(&EdgeKey::new(name, e.input_name.clone()));
                }
            }
        }
        table.edges.retain(|e| e.to != name && e.from != name);

        let ctx = self.inner.ctx.clone();
        match &mut entry.runtime {
            NodeRuntime::Source {
                source,
                dests,
                join,
            } => {
                if let Err(e) = source.stop(&ctx).await {
                    warn!(node_type = "source", node_name = %name, error = %e, "source failed to stop");
                }
                if let Some(j) = join.take() {
                    let _ = j.await;
                } else {
                    dests.close();
                }
            }
            NodeRuntime::Box {
                control_tx,
                dests,
                join,
                seed,
                ..
            } => {
                let _ = control_tx.send(NodeControl::StopOnDisconnect);
                if let Some(j) = join.take() {
                    let _ = j.await;
                } else {
                    dests.close();
                    seed.take();
                }
            }
            NodeRuntime::Sink {
                control_tx,
                join,
                seed,
            } => {
                let _ = control_tx.send(NodeControl::StopOnDisconnect);
                if let Some(j) = join.take() {
                    let _ = j.await;
                } else {
                    seed.take();
                }
            }
        }

        info!(topology = %self.inner.name, node_name = %name, "node removed");
        Ok(())
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state(),
            TopologyState::Running | TopologyState::Paused
        )
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Names of every node currently in the topology.
    pub async fn node_names(&self) -> Vec<String> {
        let table = self.inner.table.lock().await;
        table.nodes.keys().cloned().collect()
    }

    /// Whether a node with the given name exists.
    pub async fn contains(&self, name: &str) -> bool {
        let table = self.inner.table.lock().await;
        table.nodes.contains_key(name)
    }

    /// Kind of the named node, if present.
    pub async fn node_kind(&self, name: &str) -> Option<NodeKind> {
        let table = self.inner.table.lock().await;
        table.nodes.get(name).map(|e| e.kind)
    }

    /// Lifecycle state of the named node, if present.
    pub async fn node_state(&self, name: &str) -> Option<NodeState> {
        let table = self.inner.table.lock().await;
        table.nodes.get(name).map(|e| e.state())
    }

    /// Snapshot of the current edge set.
    pub async fn edges(&self) -> Vec<Edge> {
        let table = self.inner.table.lock().await;
        table.edges.clone()
    }
}

// ---------------------------------------------------------------------------
// Edge wiring
// ---------------------------------------------------------------------------

/// Wire an already-validated edge into the table.
fn wire_edge(table: &mut NodeTable, edge: Edge, capacity: usize) {
    let _ = wire_edge_checked(table, edge, capacity);
}

fn wire_edge_checked(table: &mut NodeTable, edge: Edge, capacity: usize) -> Result<()> {
    let (tx, rx) = mpsc::channel(capacity);
    if let Some(from_entry) = table.nodes.get(&edge.from) {
        if let Some(dests) = from_entry.dests() {
            dests.add_destination(EdgeKey::new(edge.to.clone(), edge.input_name.clone()), tx)?;
        }
    }
    if let Some(to_entry) = table.nodes.get(&edge.to) {
        if let Some(control) = to_entry.control_tx() {
            let _ = control.send(NodeControl::AddInput {
                key: EdgeKey::new(edge.from.clone(), edge.input_name.clone()),
                rx,
            });
        }
    }
    table.edges.push(edge);
    Ok(())
}

// ---------------------------------------------------------------------------
// Node workers
// ---------------------------------------------------------------------------

fn spawn_node_worker(ctx: &Context, name: &str, entry: &mut NodeEntry) {
    let state_tx = entry.state_tx.clone();
    let sod = entry.stop_on_disconnect;
    match &mut entry.runtime {
        NodeRuntime::Source {
            source,
            dests,
            join,
        } => {
            *join = Some(spawn_source_worker(
                ctx.clone(),
                name.to_string(),
                source.clone(),
                dests.clone(),
                state_tx,
            ));
        }
        NodeRuntime::Box {
            dests, seed, join, ..
        } => {
            if let Some(seed) = seed.take() {
                *join = Some(spawn_box_worker(
                    ctx.clone(),
                    name.to_string(),
                    seed.box_op,
                    seed.control_rx,
                    dests.clone(),
                    state_tx,
                    sod,
                ));
            }
        }
        NodeRuntime::Sink { seed, join, .. } => {
            if let Some(seed) = seed.take() {
                *join = Some(spawn_sink_worker(
                    ctx.clone(),
                    name.to_string(),
                    seed.sink,
                    seed.control_rx,
                    state_tx,
                    sod,
                ));
            }
        }
    }
}

fn spawn_source_worker(
    ctx: Context,
    name: String,
    source: Arc<dyn Source>,
    dests: Arc<Destinations>,
    state_tx: watch::Sender<NodeState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        state_tx.send_replace(NodeState::Running);
        let writer = TraceWriter::new(name.clone(), EventKind::Output, dests.clone());
        if let Err(e) = source.generate_stream(&ctx, &writer).await {
            error!(node_type = "source", node_name = %name, error = %e, "source exited with an error");
        }
        state_tx.send_replace(NodeState::Stopping);
        dests.close();
        state_tx.send_replace(NodeState::Stopped);
        debug!(node_type = "source", node_name = %name, "worker exited");
    })
}

fn spawn_box_worker(
    ctx: Context,
    name: String,
    mut box_op: Box<dyn BoxOp>,
    mut control_rx: mpsc::UnboundedReceiver<NodeControl>,
    dests: Arc<Destinations>,
    state_tx: watch::Sender<NodeState>,
    mut stop_on_disconnect: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        state_tx.send_replace(NodeState::Running);
        let writer: Arc<dyn Writer> = Arc::new(BoxWriterAdapter::new(name.clone(), dests.clone()));
        let mut inputs: StreamMap<EdgeKey, ReceiverStream<Tuple>> = StreamMap::new();
        loop {
            tokio::select! {
                ctrl = control_rx.recv() => match ctrl {
                    Some(NodeControl::AddInput { key, rx }) => {
                        inputs.insert(key, ReceiverStream::new(rx));
                    }
                    Some(NodeControl::RemoveUpstream { upstream }) => {
                        remove_upstream(&mut inputs, &upstream);
                    }
                    Some(NodeControl::StopOnDisconnect) => {
                        stop_on_disconnect = true;
                        if inputs.is_empty() {
                            break;
                        }
                    }
                    None => break,
                },
                next = inputs.next(), if !inputs.is_empty() => match next {
                    Some((_, mut tuple)) => {
                        trace(&ctx, &mut tuple, EventKind::Input, &name);
                        if let Err(e) = box_op.process(&ctx, tuple, &writer).await {
                            error!(node_type = "box", node_name = %name, error = %e, "failed to process a tuple");
                        }
                    }
                    // Every input channel has closed.
                    None => {
                        if stop_on_disconnect {
                            break;
                        }
                    }
                },
            }
        }
        state_tx.send_replace(NodeState::Stopping);
        dests.close();
        if let Err(e) = box_op.terminate(&ctx).await {
            error!(node_type = "box", node_name = %name, error = %e, "failed to terminate");
        }
        state_tx.send_replace(NodeState::Stopped);
        debug!(node_type = "box", node_name = %name, "worker exited");
    })
}

fn spawn_sink_worker(
    ctx: Context,
    name: String,
    mut sink: Box<dyn Sink>,
    mut control_rx: mpsc::UnboundedReceiver<NodeControl>,
    state_tx: watch::Sender<NodeState>,
    mut stop_on_disconnect: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        state_tx.send_replace(NodeState::Running);
        let mut inputs: StreamMap<EdgeKey, ReceiverStream<Tuple>> = StreamMap::new();
        loop {
            tokio::select! {
                ctrl = control_rx.recv() => match ctrl {
                    Some(NodeControl::AddInput { key, rx }) => {
                        inputs.insert(key, ReceiverStream::new(rx));
                    }
                    Some(NodeControl::RemoveUpstream { upstream }) => {
                        remove_upstream(&mut inputs, &upstream);
                    }
                    Some(NodeControl::StopOnDisconnect) => {
                        stop_on_disconnect = true;
                        if inputs.is_empty() {
                            break;
                        }
                    }
                    None => break,
                },
                next = inputs.next(), if !inputs.is_empty() => match next {
                    Some((_, mut tuple)) => {
                        trace(&ctx, &mut tuple, EventKind::Input, &name);
                        if let Err(e) = sink.write(&ctx, tuple).await {
                            error!(node_type = "sink", node_name = %name, error = %e, "failed to write a tuple");
                        }
                    }
                    None => {
                        if stop_on_disconnect {
                            break;
                        }
                    }
                },
            }
        }
        state_tx.send_replace(NodeState::Stopping);
        if let Err(e) = sink.close(&ctx).await {
            error!(node_type = "sink", node_name = %name, error = %e, "failed to close");
        }
        state_tx.send_replace(NodeState::Stopped);
        debug!(node_type = "sink", node_name = %name, "worker exited");
    })
}

fn remove_upstream(inputs: &mut StreamMap<EdgeKey, ReceiverStream<Tuple>>, upstream: &str) {
    let keys: Vec<EdgeKey> = inputs
        .keys()
        .filter(|k| k.node == upstream)
        .cloned()
        .collect();
    for key in keys {
        inputs.remove(&key);
    }
}
