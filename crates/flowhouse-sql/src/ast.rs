//! Statement model for the stream query language
//!
//! Statements enter the engine as values of these types; the text parser is
//! an external collaborator. Only the statements the core recognizes are
//! modeled: CREATE SOURCE / SINK / STATE, CREATE STREAM ... AS SELECT, and
//! INSERT INTO ... SELECT.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Any statement the builder can apply to a topology.
#[derive(Debug, Clone)]
pub enum Statement {
    CreateSource(CreateSourceStmt),
    CreateSink(CreateSinkStmt),
    CreateState(CreateStateStmt),
    CreateStream(CreateStreamStmt),
    InsertIntoSelect(InsertIntoSelectStmt),
}

/// `CREATE SOURCE <name> TYPE <type> WITH (<params>)`
#[derive(Debug, Clone)]
pub struct CreateSourceStmt {
    pub name: String,
    pub source_type: String,
    pub params: HashMap<String, Value>,
}

/// `CREATE SINK <name> TYPE <type> WITH (<params>)`
#[derive(Debug, Clone)]
pub struct CreateSinkStmt {
    pub name: String,
    pub sink_type: String,
    pub params: HashMap<String, Value>,
}

/// `CREATE STATE <name> TYPE <type> WITH (<params>)`
#[derive(Debug, Clone)]
pub struct CreateStateStmt {
    pub name: String,
    pub state_type: String,
    pub params: HashMap<String, Value>,
}

/// `CREATE STREAM <name> AS SELECT ...`
#[derive(Debug, Clone)]
pub struct CreateStreamStmt {
    pub name: String,
    pub select: SelectStmt,
}

/// `INSERT INTO <sink> SELECT ...`
///
/// Carries the SELECT components directly: the emitter and per-relation
/// ranges must be absent, since the desugaring to a temporary stream forces
/// `RSTREAM` and `[RANGE 1 TUPLES]`.
#[derive(Debug, Clone)]
pub struct InsertIntoSelectStmt {
    pub sink: String,
    pub emitter: Option<Emitter>,
    pub projections: Vec<Projection>,
    pub relations: Vec<StreamWindow>,
    pub filter: Option<Expr>,
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

/// A parsed SELECT statement.
#[derive(Debug, Clone)]
pub struct SelectStmt {
    pub emitter: Emitter,
    pub projections: Vec<Projection>,
    pub relations: Vec<StreamWindow>,
    pub filter: Option<Expr>,
}

impl SelectStmt {
    /// A `SELECT RSTREAM * FROM <relation>` skeleton.
    pub fn wildcard_over(relation: impl Into<String>) -> Self {
        Self {
            emitter: Emitter::rstream(),
            projections: vec![Projection::Wildcard],
            relations: vec![StreamWindow::new(relation)],
            filter: None,
        }
    }

    /// Set the emitter's LIMIT clause.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.emitter.limit = Some(limit);
        self
    }

    /// Set the emitter's sampling clause.
    pub fn with_sampling(mut self, sampling: SamplingClause) -> Self {
        self.emitter.sampling = Some(sampling);
        self
    }
}

/// Relation-to-stream emission strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitterType {
    /// Emit the whole relation on every change.
    Rstream,
    /// Emit rows added to the relation.
    Istream,
    /// Emit rows removed from the relation.
    Dstream,
}

/// The emitter clause of a SELECT: type plus output shaping.
#[derive(Debug, Clone)]
pub struct Emitter {
    pub emitter_type: EmitterType,
    /// `LIMIT n`; `None` means unlimited.
    pub limit: Option<i64>,
    /// Optional sampling of the output stream.
    pub sampling: Option<SamplingClause>,
}

impl Emitter {
    pub fn rstream() -> Self {
        Self {
            emitter_type: EmitterType::Rstream,
            limit: None,
            sampling: None,
        }
    }

    pub fn istream() -> Self {
        Self {
            emitter_type: EmitterType::Istream,
            limit: None,
            sampling: None,
        }
    }
}

/// Output sampling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingClause {
    /// `EVERY <k>-TH TUPLE`: emit one of every `k` generated rows.
    CountBased { every_nth: i64 },
    /// `SAMPLE <p>%`: emit each row with probability `p`/100.
    Randomized { probability: i64 },
    /// `EVERY <ms> MILLISECONDS`: emit the latest row on a fixed cadence.
    TimeBased { interval_ms: i64 },
}

/// One entry of the projection list.
#[derive(Debug, Clone)]
pub enum Projection {
    /// `*`
    Wildcard,
    /// An expression, optionally aliased with `AS`.
    Expr { expr: Expr, alias: Option<String> },
}

/// A windowed input relation of a SELECT.
#[derive(Debug, Clone)]
pub struct StreamWindow {
    /// Name of the source or stream the relation reads from. Doubles as the
    /// input label of the edge wired for it.
    pub name: String,
    pub alias: Option<String>,
    /// `[RANGE <n> <unit>]`; `None` when the statement did not specify one.
    pub range: Option<Range>,
}

impl StreamWindow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            range: None,
        }
    }

    pub fn with_range(mut self, value: i64, unit: RangeUnit) -> Self {
        self.range = Some(Range { value, unit });
        self
    }
}

/// A window range specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub value: i64,
    pub unit: RangeUnit,
}

/// Unit of a window range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Tuples,
    Seconds,
    Milliseconds,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A scalar expression over a tuple's payload.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal JSON value.
    Literal(Value),
    /// A top-level field of the payload object.
    Field(String),
    /// A registered function applied to arguments.
    FunctionCall { name: String, args: Vec<Expr> },
    /// A binary operation.
    BinaryOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// Binary operators usable in projections and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcard_over_shape() {
        let stmt = SelectStmt::wildcard_over("events");
        assert_eq!(stmt.emitter.emitter_type, EmitterType::Rstream);
        assert!(stmt.emitter.limit.is_none());
        assert!(stmt.emitter.sampling.is_none());
        assert_eq!(stmt.relations.len(), 1);
        assert_eq!(stmt.relations[0].name, "events");
        assert!(matches!(stmt.projections[0], Projection::Wildcard));
    }

    #[test]
    fn test_with_limit_and_sampling() {
        let stmt = SelectStmt::wildcard_over("events")
            .with_limit(10)
            .with_sampling(SamplingClause::CountBased { every_nth: 3 });
        assert_eq!(stmt.emitter.limit, Some(10));
        assert_eq!(
            stmt.emitter.sampling,
            Some(SamplingClause::CountBased { every_nth: 3 })
        );
    }

    #[test]
    fn test_stream_window_with_range() {
        let w = StreamWindow::new("trades").with_range(1, RangeUnit::Tuples);
        assert_eq!(w.range, Some(Range { value: 1, unit: RangeUnit::Tuples }));
    }

    #[test]
    fn test_expr_builders() {
        let e = Expr::binary(BinOp::Gt, Expr::field("amount"), Expr::literal(json!(100)));
        match e {
            Expr::BinaryOp { op, left, right } => {
                assert_eq!(op, BinOp::Gt);
                assert!(matches!(*left, Expr::Field(_)));
                assert!(matches!(*right, Expr::Literal(_)));
            }
            _ => panic!("expected a binary op"),
        }
    }
}
