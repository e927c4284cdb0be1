//! Topology builder
//!
//! Assembles a DAG of sources, boxes, and sinks, validating names, edge
//! labels, and acyclicity before anything runs. `build` freezes the builder
//! and materializes a [`Topology`] in the `Initialized` state.
//!
//! Errors are collected lazily on declarer objects: the first error sticks
//! and suppresses subsequent operations on that declarer; it is retrieved
//! with `err()` or `into_result()`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connector::DEFAULT_INPUT_NAME;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::{validate_node_name, BoxOp, InputConstraints, Sink, Source};
use crate::topology::{Edge, Topology};

struct BuilderBox {
    box_op: Box<dyn BoxOp>,
    constraints: Option<InputConstraints>,
}

struct BuilderInner {
    name: String,
    sources: HashMap<String, Arc<dyn Source>>,
    boxes: HashMap<String, BuilderBox>,
    sinks: HashMap<String, Box<dyn Sink>>,
    edges: Vec<Edge>,
    frozen: bool,
}

impl BuilderInner {
    fn check_name(&self, name: &str) -> Result<()> {
        validate_node_name(name)?;
        if self.sources.contains_key(name)
            || self.boxes.contains_key(name)
            || self.sinks.contains_key(name)
        {
            return Err(Error::NameTaken(name.to_string()));
        }
        Ok(())
    }

    fn is_valid_output_ref(&self, name: &str) -> bool {
        self.sources.contains_key(name) || self.boxes.contains_key(name)
    }

    fn add_edge(&mut self, edge: Edge) -> Result<()> {
        // Scan the whole edge list; a duplicate may sit anywhere in it.
        if self.edges.iter().any(|e| *e == edge) {
            return Err(Error::DuplicateEdge {
                from: edge.from,
                to: edge.to,
                input_name: edge.input_name,
            });
        }
        self.edges.push(edge);
        Ok(())
    }
}

/// Builds a topology declaratively, then freezes it with [`build`].
///
/// [`build`]: TopologyBuilder::build
///
/// # Example
///
/// ```ignore
/// let builder = TopologyBuilder::new("metrics");
/// builder.add_source("events", my_source).into_result()?;
/// builder.add_box("enrich", my_box).input("events").into_result()?;
/// builder.add_sink("store", my_sink).input("enrich").into_result()?;
/// let topology = builder.build(Context::default())?;
/// topology.run().await?;
/// ```
pub struct TopologyBuilder {
    inner: Arc<Mutex<BuilderInner>>,
}

impl TopologyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BuilderInner {
                name: name.into(),
                sources: HashMap::new(),
                boxes: HashMap::new(),
                sinks: HashMap::new(),
                edges: Vec::new(),
                frozen: false,
            })),
        }
    }

    /// Register a source under `name`.
    pub fn add_source(&self, name: &str, source: Arc<dyn Source>) -> SourceDeclarer {
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            return SourceDeclarer {
                err: Some(Error::Frozen),
            };
        }
        if let Err(e) = inner.check_name(name) {
            return SourceDeclarer { err: Some(e) };
        }
        inner.sources.insert(name.to_string(), source);
        SourceDeclarer { err: None }
    }

    /// Register a box under `name`. Its input constraints are captured here
    /// and checked on every later `input`/`named_input` call.
    pub fn add_box(&self, name: &str, box_op: Box<dyn BoxOp>) -> BoxDeclarer {
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            return BoxDeclarer {
                inner: self.inner.clone(),
                name: name.to_string(),
                err: Some(Error::Frozen),
            };
        }
        if let Err(e) = inner.check_name(name) {
            return BoxDeclarer {
                inner: self.inner.clone(),
                name: name.to_string(),
                err: Some(e),
            };
        }
        let constraints = match box_op.input_constraints() {
            Ok(c) => c,
            Err(e) => {
                return BoxDeclarer {
                    inner: self.inner.clone(),
                    name: name.to_string(),
                    err: Some(e),
                }
            }
        };
        inner
            .boxes
            .insert(name.to_string(), BuilderBox { box_op, constraints });
        BoxDeclarer {
            inner: self.inner.clone(),
            name: name.to_string(),
            err: None,
        }
    }

    /// Register a sink under `name`.
    pub fn add_sink(&self, name: &str, sink: Box<dyn Sink>) -> SinkDeclarer {
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            return SinkDeclarer {
                inner: self.inner.clone(),
                name: name.to_string(),
                err: Some(Error::Frozen),
            };
        }
        if let Err(e) = inner.check_name(name) {
            return SinkDeclarer {
                inner: self.inner.clone(),
                name: name.to_string(),
                err: Some(e),
            };
        }
        inner.sinks.insert(name.to_string(), sink);
        SinkDeclarer {
            inner: self.inner.clone(),
            name: name.to_string(),
            err: None,
        }
    }

    /// Freeze the builder and materialize the runtime topology.
    ///
    /// Fails with `Frozen` when called twice, `NoSources` when no source was
    /// registered, or `CycleDetected` when the edge set contains a cycle.
    pub fn build(&self, ctx: Context) -> Result<Topology> {
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            return Err(Error::Frozen);
        }
        if inner.sources.is_empty() {
            return Err(Error::NoSources);
        }
        let source_names: Vec<String> = inner.sources.keys().cloned().collect();
        if let Some(path) = find_cycle(&source_names, &inner.edges) {
            return Err(Error::CycleDetected { path });
        }
        inner.frozen = true;

        let name = inner.name.clone();
        let sources = std::mem::take(&mut inner.sources).into_iter().collect();
        let boxes = std::mem::take(&mut inner.boxes)
            .into_iter()
            .map(|(n, b)| (n, b.box_op, b.constraints))
            .collect();
        let sinks = std::mem::take(&mut inner.sinks).into_iter().collect();
        let edges = std::mem::take(&mut inner.edges);

        Ok(Topology::from_parts(name, ctx, sources, boxes, sinks, edges))
    }
}

// ---------------------------------------------------------------------------
// Declarers
// ---------------------------------------------------------------------------

/// Result of registering a source.
pub struct SourceDeclarer {
    err: Option<Error>,
}

impl SourceDeclarer {
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn into_result(self) -> Result<()> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Result of registering a box; used to declare its inbound edges.
pub struct BoxDeclarer {
    inner: Arc<Mutex<BuilderInner>>,
    name: String,
    err: Option<Error>,
}

impl BoxDeclarer {
    /// Add an inbound edge from `from` with the default label (`"*"`).
    pub fn input(self, from: &str) -> Self {
        self.named_input(from, DEFAULT_INPUT_NAME)
    }

    /// Add an inbound edge from `from` labeled `input_name`.
    pub fn named_input(mut self, from: &str, input_name: &str) -> Self {
        if self.err.is_some() {
            return self;
        }
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            self.err = Some(Error::Frozen);
            drop(inner);
            return self;
        }
        if !inner.is_valid_output_ref(from) {
            self.err = Some(Error::UnknownRef(from.to_string()));
            drop(inner);
            return self;
        }
        let accepted = inner
            .boxes
            .get(&self.name)
            .and_then(|b| b.constraints.as_ref())
            .map_or(true, |c| c.accepts(input_name));
        if !accepted {
            self.err = Some(Error::LabelRejected {
                name: self.name.clone(),
                input_name: input_name.to_string(),
            });
            drop(inner);
            return self;
        }
        if let Err(e) = inner.add_edge(Edge {
            from: from.to_string(),
            to: self.name.clone(),
            input_name: input_name.to_string(),
        }) {
            self.err = Some(e);
        }
        drop(inner);
        self
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn into_result(self) -> Result<()> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Result of registering a sink; used to declare its inbound edges.
pub struct SinkDeclarer {
    inner: Arc<Mutex<BuilderInner>>,
    name: String,
    err: Option<Error>,
}

impl SinkDeclarer {
    /// Add an inbound edge from `from`. Sink edges always carry the reserved
    /// `"output"` label so upstream box names never leak into sink semantics.
    pub fn input(mut self, from: &str) -> Self {
        if self.err.is_some() {
            return self;
        }
        let mut inner = self.inner.lock().expect("builder lock poisoned");
        if inner.frozen {
            self.err = Some(Error::Frozen);
            drop(inner);
            return self;
        }
        if !inner.is_valid_output_ref(from) {
            self.err = Some(Error::UnknownRef(from.to_string()));
            drop(inner);
            return self;
        }
        if let Err(e) = inner.add_edge(Edge {
            from: from.to_string(),
            to: self.name.clone(),
            input_name: crate::connector::SINK_INPUT_NAME.to_string(),
        }) {
            self.err = Some(e);
        }
        drop(inner);
        self
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn into_result(self) -> Result<()> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Three-color DFS from each source. Returns the cycle path in forward
/// order, with identical first and last elements, when a cycle exists.
pub(crate) fn find_cycle(sources: &[String], edges: &[Edge]) -> Option<Vec<String>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges {
        adj.entry(e.from.as_str()).or_default().push(e.to.as_str());
    }

    // 0: unvisited, 1: visiting, 2: visited
    let mut visited: HashMap<&str, u8> = HashMap::new();
    for s in sources {
        if let Some(mut path) = visit(s.as_str(), &adj, &mut visited) {
            path.reverse();
            return Some(path);
        }
    }
    None
}

/// Returns a non-empty path in reverse discovery order when a cycle was hit.
fn visit<'a>(
    node: &'a str,
    adj: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, u8>,
) -> Option<Vec<String>> {
    match visited.get(node) {
        Some(1) => return Some(vec![node.to_string()]),
        Some(2) => return None,
        _ => {}
    }
    visited.insert(node, 1);
    if let Some(neighbors) = adj.get(node) {
        for n in neighbors {
            if let Some(mut path) = visit(n, adj, visited) {
                // Once both ends of the cycle are on the path, stop
                // extending it with the nodes that led there.
                if path.len() > 1 && path.first() == path.last() {
                    return Some(path);
                }
                path.push(node.to_string());
                return Some(path);
            }
        }
    }
    visited.insert(node, 2);
    None
}
