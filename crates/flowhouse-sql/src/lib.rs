//! FlowHouse Stream Query Surface
//!
//! Turns stream query statements into running dataflow nodes on a
//! [`flowhouse_core::Topology`]:
//!
//! - `CREATE SOURCE` / `CREATE SINK` instantiate creators registered under a
//!   type name (see [`registry`]).
//! - `CREATE STATE` populates the topology's shared-state directory.
//! - `CREATE STREAM ... AS SELECT` inserts a [`SelectBox`]: a stream
//!   operator that runs a compiled plan per input tuple with LIMIT and
//!   count/random/time sampling applied to its output.
//! - `INSERT INTO ... SELECT` desugars into a temporary stream connected to
//!   an existing sink.
//!
//! Interactive SELECTs build a transient pipeline whose results stream over
//! a channel ([`TopologyBuilder::add_select_stmt`]).
//!
//! The statement *text* parser and full plan compiler are external; this
//! crate defines the statement model ([`ast`]) and the compiler seam
//! ([`plan::PlanCompiler`]) plus a minimal built-in compiler.

pub mod ast;
pub mod builder;
pub mod error;
pub mod plan;
pub mod registry;
pub mod select_box;

pub use ast::{
    BinOp, CreateSinkStmt, CreateSourceStmt, CreateStateStmt, CreateStreamStmt, Emitter,
    EmitterType, Expr, InsertIntoSelectStmt, Projection, Range, RangeUnit, SamplingClause,
    SelectStmt, Statement, StreamWindow,
};
pub use builder::TopologyBuilder;
pub use error::{Result, SqlError};
pub use plan::{DefaultPlanCompiler, EmissionShaping, PhysicalPlan, PlanCompiler, Sampling};
pub use registry::{
    copy_global_functions, copy_global_sink_creators, copy_global_source_creators,
    copy_global_state_creators, register_global_function, register_global_sink_creator,
    register_global_source_creator, register_global_state_creator, CreatorRegistry, Function,
    FunctionRegistry, SinkCreator, SourceCreator, StateCreator,
};
pub use select_box::{DetachHook, SelectBox};
