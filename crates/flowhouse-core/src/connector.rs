//! Fan-out and writer adapters between nodes
//!
//! Every producing node (source or box) owns a [`Destinations`] fan-out that
//! multiplexes each outgoing tuple onto one channel per outbound edge. On the
//! consuming side, each box or sink worker merges its input channels with a
//! fair select (see the worker loops in [`crate::topology`]); the
//! [`NodeControl`] messages defined here let the runtime mutate a running
//! worker's input set.
//!
//! Two writer adapters shape tuples on their way out of a node:
//! [`TraceWriter`] appends a trace event, [`BoxWriterAdapter`] additionally
//! re-stamps the processing timestamp at the moment of emission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::tuple::{trace, EventKind, Tuple};

/// Input label carried by every sink-bound edge. Using a fixed label prevents
/// upstream box names from leaking into sink semantics.
pub const SINK_INPUT_NAME: &str = "output";

/// Default input label for box-bound edges.
pub const DEFAULT_INPUT_NAME: &str = "*";

/// Default per-edge channel capacity, the closest analogue of an unbuffered
/// channel: a send completes only once the consumer has taken the previous
/// tuple.
pub const DEFAULT_EDGE_CAPACITY: usize = 1;

/// Configuration for one inbound edge.
#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Logical input label the consuming box expects. `None` means the
    /// default label (`"*"`). Ignored for sinks, which always use
    /// [`SINK_INPUT_NAME`].
    pub input_name: Option<String>,
    /// Channel capacity for this edge.
    pub capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            input_name: None,
            capacity: DEFAULT_EDGE_CAPACITY,
        }
    }
}

/// Identifies one edge endpoint: the peer node plus the edge's input label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub node: String,
    pub input_name: String,
}

impl EdgeKey {
    pub fn new(node: impl Into<String>, input_name: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            input_name: input_name.into(),
        }
    }
}

/// Control messages delivered to a running box or sink worker.
#[derive(Debug)]
pub enum NodeControl {
    /// Attach a new input channel under the given edge key.
    AddInput {
        key: EdgeKey,
        rx: mpsc::Receiver<Tuple>,
    },
    /// Detach all input channels from the named upstream.
    RemoveUpstream { upstream: String },
    /// Flag the worker for drain: once every input channel has closed, the
    /// worker exits and the node terminates.
    StopOnDisconnect,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Anything a node can emit tuples into.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Destinations (fan-out)
// ---------------------------------------------------------------------------

struct DestinationsInner {
    senders: HashMap<EdgeKey, mpsc::Sender<Tuple>>,
    closed: bool,
}

/// Per-producer fan-out: one labeled channel per outbound edge.
///
/// `write` clones the tuple for every destination; sends are sequential and
/// each may block on backpressure. Safe against concurrent
/// `add_destination` / `remove_destination` calls. A pause gate, when
/// present, holds writes while the owning topology is paused.
pub struct Destinations {
    inner: Mutex<DestinationsInner>,
    pause: Option<watch::Receiver<bool>>,
}

impl Destinations {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DestinationsInner {
                senders: HashMap::new(),
                closed: false,
            }),
            pause: None,
        }
    }

    /// A fan-out whose writes are held while `pause` reads `true`. Used for
    /// source fan-outs so that pausing a topology stops tuple ingress.
    pub fn with_pause_gate(pause: watch::Receiver<bool>) -> Self {
        Self {
            inner: Mutex::new(DestinationsInner {
                senders: HashMap::new(),
                closed: false,
            }),
            pause: Some(pause),
        }
    }

    /// Attach an outbound edge. Fails with `Stopped` when the producing node
    /// has already shut down.
    pub fn add_destination(&self, key: EdgeKey, tx: mpsc::Sender<Tuple>) -> Result<()> {
        let mut inner = self.inner.lock().expect("destinations lock poisoned");
        if inner.closed {
            return Err(Error::Stopped);
        }
        inner.senders.insert(key, tx);
        Ok(())
    }

    /// Drop one outbound edge, closing its channel.
    pub fn remove_destination(&self, key: &EdgeKey) {
        let mut inner = self.inner.lock().expect("destinations lock poisoned");
        inner.senders.remove(key);
    }

    /// Drop every outbound edge towards `node`.
    pub fn remove_node(&self, node: &str) {
        let mut inner = self.inner.lock().expect("destinations lock poisoned");
        inner.senders.retain(|key, _| key.node != node);
    }

    /// Close the fan-out: drop all senders so downstream channels close.
    /// Further `add_destination` calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("destinations lock poisoned");
        inner.closed = true;
        inner.senders.clear();
    }

    /// Number of attached destinations.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("destinations lock poisoned")
            .senders
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait_while_paused(&self) {
        if let Some(gate) = &self.pause {
            let mut rx = gate.clone();
            loop {
                if !*rx.borrow_and_update() {
                    return;
                }
                // The pause controller went away; treat as resumed.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

impl Default for Destinations {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Writer for Destinations {
    async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
        self.wait_while_paused().await;

        let targets: Vec<(EdgeKey, mpsc::Sender<Tuple>)> = {
            let inner = self.inner.lock().expect("destinations lock poisoned");
            inner
                .senders
                .iter()
                .map(|(k, tx)| (k.clone(), tx.clone()))
                .collect()
        };

        for (key, tx) in targets {
            // Each destination gets its own copy; sends are independent and
            // may block on backpressure.
            if tx.send(tuple.clone()).await.is_err() {
                // The consumer went away; drop the edge.
                self.remove_destination(&key);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TraceWriter
// ---------------------------------------------------------------------------

/// Writer adapter that appends a trace event before forwarding.
///
/// Sources are wrapped in a `TraceWriter` with [`EventKind::Output`] so that
/// every produced tuple records where it entered the topology.
pub struct TraceWriter {
    name: String,
    kind: EventKind,
    inner: Arc<Destinations>,
}

impl TraceWriter {
    pub fn new(name: impl Into<String>, kind: EventKind, inner: Arc<Destinations>) -> Self {
        Self {
            name: name.into(),
            kind,
            inner,
        }
    }
}

#[async_trait]
impl Writer for TraceWriter {
    async fn write(&self, ctx: &Context, mut tuple: Tuple) -> Result<()> {
        trace(ctx, &mut tuple, self.kind, &self.name);
        self.inner.write(ctx, tuple).await
    }
}

// ---------------------------------------------------------------------------
// BoxWriterAdapter
// ---------------------------------------------------------------------------

/// Writer handed to a box's `process`.
///
/// Re-stamps `proc_timestamp` to wall time at the moment of emission and
/// appends an `Output` trace event carrying the box name, then forwards to
/// the box's fan-out.
pub struct BoxWriterAdapter {
    name: String,
    dests: Arc<Destinations>,
}

impl BoxWriterAdapter {
    pub fn new(name: impl Into<String>, dests: Arc<Destinations>) -> Self {
        Self {
            name: name.into(),
            dests,
        }
    }
}

#[async_trait]
impl Writer for BoxWriterAdapter {
    async fn write(&self, ctx: &Context, mut tuple: Tuple) -> Result<()> {
        tuple.proc_timestamp = Utc::now();
        trace(ctx, &mut tuple, EventKind::Output, &self.name);
        self.dests.write(ctx, tuple).await
    }
}
