//! FlowHouse Core Dataflow Engine
//!
//! Composes sources (producers), boxes (stateful stream operators), and
//! sinks (consumers) into a directed acyclic graph - the topology - and
//! moves timestamped tuples through it.
//!
//! ## Architecture
//!
//! - **Builder**: [`TopologyBuilder`] assembles and validates the DAG (name
//!   uniqueness, input labels, acyclicity) and freezes it on `build()`.
//! - **Runtime**: [`Topology`] drives each node with one tokio task, wiring
//!   bounded channels per edge for natural backpressure, and enforces the
//!   lifecycle state machine (initialized → running ⇄ paused → stopping →
//!   stopped). The graph may be mutated while running; every mutation
//!   re-runs the cycle check before committing.
//! - **Connectors**: per-producer fan-out, per-consumer fair merge, and
//!   writer adapters that stamp trace events at node boundaries.
//!
//! ## Guarantees
//!
//! - Per-edge FIFO delivery; no drops, no reordering within an edge.
//! - Fair merge across a node's input channels.
//! - `init` before any `process`; `terminate` exactly once, after the last
//!   `process`.
//! - A tuple's trace after a node is a prefix-extension of its trace before.

pub mod builder;
pub mod connector;
pub mod context;
pub mod error;
pub mod node;
pub mod topology;
pub mod tuple;

pub use builder::{BoxDeclarer, SinkDeclarer, SourceDeclarer, TopologyBuilder};
pub use connector::{
    BoxWriterAdapter, Destinations, EdgeKey, InputConfig, TraceWriter, Writer,
    DEFAULT_INPUT_NAME, SINK_INPUT_NAME,
};
pub use context::{Context, ContextConfig, SharedState, SharedStateRegistry};
pub use error::{Error, Result};
pub use node::{validate_node_name, BoxOp, InputConstraints, NodeKind, NodeState, Sink, Source};
pub use topology::{Edge, Topology, TopologyState, WeakTopology};
pub use tuple::{trace, EventKind, TraceEvent, Tuple};
