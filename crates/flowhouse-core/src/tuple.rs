//! Tuple Data Structure
//!
//! This module defines the `Tuple` type - the unit of data flowing through a
//! topology - together with the trace events the engine attaches to it at
//! node boundaries.
//!
//! ## Structure
//! Each tuple contains:
//! - **data**: tree-structured payload (`serde_json::Value`), untyped at the
//!   framework level
//! - **timestamp**: event time assigned by the producing source
//! - **proc_timestamp**: processing-time ingress stamp, rewritten whenever a
//!   box emits the tuple
//! - **batch_id**: monotonic ingress counter assigned by the source; opaque
//!   to operators
//! - **trace**: ordered log of node-boundary events, populated only when
//!   tuple tracing is enabled on the [`Context`](crate::context::Context)
//!
//! Tuples are logically immutable per edge traversal: the fan-out connector
//! hands each destination its own clone, and a box emission carries a copy of
//! the parent's trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;

/// Direction of a trace event relative to the node that recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The tuple entered the node.
    Input,
    /// The tuple (or a derived tuple) left the node.
    Output,
    /// Any other noteworthy event.
    Other,
}

/// A single entry in a tuple's trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Wall-clock time the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Direction of the event.
    pub kind: EventKind,
    /// Human-readable message, conventionally the node name.
    pub message: String,
}

impl TraceEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn now(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        }
    }
}

/// A single record flowing through the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// The payload.
    pub data: Value,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Processing-time ingress stamp.
    pub proc_timestamp: DateTime<Utc>,
    /// Monotonic ingress counter assigned by the source.
    pub batch_id: u64,
    /// Trace log, empty unless tracing is enabled.
    pub trace: Vec<TraceEvent>,
}

impl Tuple {
    /// Create a tuple whose event and processing timestamps are both `now`.
    pub fn new(data: Value, batch_id: u64) -> Self {
        let now = Utc::now();
        Self {
            data,
            timestamp: now,
            proc_timestamp: now,
            batch_id,
            trace: Vec::new(),
        }
    }

    /// Append a trace event to this tuple.
    pub fn add_event(&mut self, event: TraceEvent) {
        self.trace.push(event);
    }
}

/// Append a node-boundary trace event to `t` iff tracing is enabled in `ctx`.
pub fn trace(ctx: &Context, t: &mut Tuple, kind: EventKind, message: &str) {
    if !ctx.is_tuple_trace_enabled() {
        return;
    }
    t.add_event(TraceEvent::now(kind, message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextConfig};
    use serde_json::json;

    #[test]
    fn test_new_tuple_has_empty_trace() {
        let t = Tuple::new(json!({"n": 1}), 0);
        assert!(t.trace.is_empty());
        assert_eq!(t.batch_id, 0);
        assert_eq!(t.data, json!({"n": 1}));
    }

    #[test]
    fn test_new_tuple_timestamps_match() {
        let t = Tuple::new(json!(null), 7);
        assert_eq!(t.timestamp, t.proc_timestamp);
    }

    #[test]
    fn test_add_event_appends_in_order() {
        let mut t = Tuple::new(json!(1), 0);
        t.add_event(TraceEvent::now(EventKind::Output, "s"));
        t.add_event(TraceEvent::now(EventKind::Input, "b"));
        assert_eq!(t.trace.len(), 2);
        assert_eq!(t.trace[0].message, "s");
        assert_eq!(t.trace[0].kind, EventKind::Output);
        assert_eq!(t.trace[1].message, "b");
        assert_eq!(t.trace[1].kind, EventKind::Input);
    }

    #[test]
    fn test_clone_trace_is_independent() {
        let mut parent = Tuple::new(json!(1), 0);
        parent.add_event(TraceEvent::now(EventKind::Output, "s"));
        let mut child = parent.clone();
        child.add_event(TraceEvent::now(EventKind::Input, "b"));
        assert_eq!(parent.trace.len(), 1);
        assert_eq!(child.trace.len(), 2);
        // The child's trace is a prefix-extension of the parent's.
        assert_eq!(child.trace[0], parent.trace[0]);
    }

    #[test]
    fn test_trace_disabled_is_noop() {
        let ctx = Context::new(ContextConfig::default());
        let mut t = Tuple::new(json!(1), 0);
        trace(&ctx, &mut t, EventKind::Input, "b");
        assert!(t.trace.is_empty());
    }

    #[test]
    fn test_trace_enabled_appends() {
        let ctx = Context::new(ContextConfig {
            tuple_trace_enabled: true,
        });
        let mut t = Tuple::new(json!(1), 0);
        trace(&ctx, &mut t, EventKind::Input, "b");
        assert_eq!(t.trace.len(), 1);
        assert_eq!(t.trace[0].message, "b");
    }

    #[test]
    fn test_tuple_serde_roundtrip() {
        let mut t = Tuple::new(json!({"k": "v"}), 42);
        t.add_event(TraceEvent::now(EventKind::Other, "note"));
        let encoded = serde_json::to_string(&t).unwrap();
        let decoded: Tuple = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, t);
    }
}
