//! Node primitives: the Source, Box, and Sink operator traits
//!
//! A topology is composed of three kinds of nodes. They are deliberately
//! modeled as three separate capability sets rather than one unified
//! "operator" trait because their start/stop semantics differ: sources own a
//! production loop, boxes react to input tuples, sinks only consume.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::Writer;
use crate::context::Context;
use crate::error::Result;
use crate::tuple::Tuple;

/// Which kind of node a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Box,
    Sink,
}

impl NodeKind {
    /// Lower-case label used in structured log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Box => "box",
            NodeKind::Sink => "sink",
        }
    }
}

/// Lifecycle state of an individual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// Created but its worker has not started yet.
    Initialized,
    /// Worker is running.
    Running,
    /// Worker is shutting down.
    Stopping,
    /// Worker has exited; terminal.
    Stopped,
}

/// A tuple producer.
///
/// `generate_stream` owns its production clock: it blocks until the source is
/// exhausted or until `stop` asks it to return. Both methods take `&self`;
/// implementations coordinate between them with interior mutability (an
/// atomic flag or a watch channel).
#[async_trait]
pub trait Source: Send + Sync {
    /// Push tuples into `writer` until exhausted or stopped.
    async fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<()>;

    /// Ask a running `generate_stream` to return.
    async fn stop(&self, ctx: &Context) -> Result<()>;
}

/// A stateful 1-N stream operator.
///
/// The runtime guarantees `init` is called before any `process`, that
/// `process` calls are serialized, and that `terminate` is called at most
/// once, after the last `process`.
#[async_trait]
pub trait BoxOp: Send {
    /// Prepare the operator. Called once before the first `process`.
    async fn init(&mut self, ctx: &Context) -> Result<()>;

    /// Handle one input tuple, emitting derived tuples through `writer`.
    ///
    /// The writer is shared so operators that emit asynchronously (e.g. on a
    /// timer) can retain a clone of it.
    async fn process(
        &mut self,
        ctx: &Context,
        tuple: Tuple,
        writer: &std::sync::Arc<dyn Writer>,
    ) -> Result<()>;

    /// Release resources. Called at most once, after the last `process`.
    async fn terminate(&mut self, ctx: &Context) -> Result<()>;

    /// The input labels this box accepts. `None` means "accept anything".
    fn input_constraints(&self) -> Result<Option<InputConstraints>> {
        Ok(None)
    }
}

/// A tuple consumer.
#[async_trait]
pub trait Sink: Send {
    /// Consume one tuple.
    async fn write(&mut self, ctx: &Context, tuple: Tuple) -> Result<()>;

    /// Release resources once the sink's worker exits.
    async fn close(&mut self, ctx: &Context) -> Result<()>;
}

/// Declared input-label constraints of a box.
///
/// The map's keys are accepted input labels; `"*"` accepts any label. A
/// label may carry an optional schema document (reserved; schema checking is
/// not performed by the engine). `schema: None` accepts anything, like an
/// absent constraint set.
#[derive(Debug, Clone, Default)]
pub struct InputConstraints {
    pub schema: Option<HashMap<String, Option<Value>>>,
}

impl InputConstraints {
    /// Constrain the box to exactly the given labels.
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema: Some(labels.into_iter().map(|l| (l.into(), None)).collect()),
        }
    }

    /// Whether an edge with `input_name` may attach to this box.
    pub fn accepts(&self, input_name: &str) -> bool {
        match &self.schema {
            None => true,
            Some(schema) => schema.contains_key(input_name) || schema.contains_key("*"),
        }
    }
}

/// Validate a node name against `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_node_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(crate::error::Error::InvalidNodeName(name.to_string()))
    }
}
