//! Plan compilation seam and emission-shaping analysis
//!
//! The logical/physical plan compiler is an external collaborator behind the
//! [`PlanCompiler`] trait: given a SELECT statement and a function registry
//! it produces a [`PhysicalPlan`] that maps one input tuple to an ordered
//! list of result values.
//!
//! Two things live here regardless of which compiler is plugged in:
//!
//! - [`EmissionShaping::from_stmt`], the analysis step that derives the
//!   LIMIT and sampling configuration a `SelectBox` enforces.
//! - [`DefaultPlanCompiler`], a minimal built-in compiler (pass-through `*`,
//!   top-level field projection, scalar functions, and filters) that makes
//!   the engine executable end-to-end without an external planner.

use serde_json::{json, Value};

use flowhouse_core::Tuple;

use crate::ast::{BinOp, Expr, Projection, SamplingClause, SelectStmt};
use crate::error::{Result, SqlError};
use crate::registry::FunctionRegistry;

// ---------------------------------------------------------------------------
// Plan traits
// ---------------------------------------------------------------------------

/// A compiled per-tuple execution plan.
pub trait PhysicalPlan: Send {
    /// Feed one tuple into the plan, producing zero or more result values in
    /// order.
    fn process(&mut self, tuple: &Tuple) -> Result<Vec<Value>>;
}

/// Compiles SELECT statements into physical plans.
pub trait PlanCompiler: Send + Sync {
    fn compile(
        &self,
        stmt: &SelectStmt,
        functions: &FunctionRegistry,
    ) -> Result<Box<dyn PhysicalPlan>>;
}

// ---------------------------------------------------------------------------
// Emission shaping
// ---------------------------------------------------------------------------

/// Output sampling policy of a select box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    None,
    CountBased { every_nth: i64 },
    Randomized { probability: i64 },
    TimeBased { interval_ms: i64 },
}

/// LIMIT and sampling configuration derived from a SELECT's emitter clause.
#[derive(Debug, Clone, Copy)]
pub struct EmissionShaping {
    /// Maximum number of emissions; `None` means unlimited.
    pub limit: Option<i64>,
    pub sampling: Sampling,
}

impl EmissionShaping {
    /// Analyze the emitter clause of `stmt`.
    ///
    /// A negative LIMIT is treated as unlimited. Sampling parameters are
    /// validated here so that a bad statement fails at `init` rather than
    /// mid-stream.
    pub fn from_stmt(stmt: &SelectStmt) -> Result<Self> {
        let limit = stmt.emitter.limit.filter(|l| *l >= 0);
        let sampling = match stmt.emitter.sampling {
            None => Sampling::None,
            Some(SamplingClause::CountBased { every_nth }) => {
                if every_nth < 1 {
                    return Err(SqlError::Plan(format!(
                        "count-based sampling requires a positive interval, got {every_nth}"
                    )));
                }
                Sampling::CountBased { every_nth }
            }
            Some(SamplingClause::Randomized { probability }) => {
                if !(0..=100).contains(&probability) {
                    return Err(SqlError::Plan(format!(
                        "sampling probability must be between 0 and 100, got {probability}"
                    )));
                }
                Sampling::Randomized { probability }
            }
            Some(SamplingClause::TimeBased { interval_ms }) => {
                if interval_ms < 1 {
                    return Err(SqlError::Plan(format!(
                        "time-based sampling requires a positive interval, got {interval_ms}"
                    )));
                }
                Sampling::TimeBased { interval_ms }
            }
        };
        Ok(Self { limit, sampling })
    }

    /// Whether `emit_count` has reached the limit.
    pub fn limit_reached(&self, emit_count: i64) -> bool {
        matches!(self.limit, Some(limit) if emit_count >= limit)
    }
}

// ---------------------------------------------------------------------------
// Default compiler
// ---------------------------------------------------------------------------

/// Minimal built-in plan compiler.
///
/// Supports `SELECT *`, top-level field projections with optional aliases,
/// registered scalar functions, and binary-expression filters. Windowing and
/// aggregation stay with external compilers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlanCompiler;

impl PlanCompiler for DefaultPlanCompiler {
    fn compile(
        &self,
        stmt: &SelectStmt,
        functions: &FunctionRegistry,
    ) -> Result<Box<dyn PhysicalPlan>> {
        let wildcard = matches!(stmt.projections.as_slice(), [Projection::Wildcard]);
        if !wildcard
            && stmt
                .projections
                .iter()
                .any(|p| matches!(p, Projection::Wildcard))
        {
            return Err(SqlError::Plan(
                "a wildcard projection cannot be combined with other projections".to_string(),
            ));
        }
        if stmt.projections.is_empty() {
            return Err(SqlError::Plan("the projection list is empty".to_string()));
        }
        Ok(Box::new(ProjectionPlan {
            wildcard,
            projections: stmt.projections.clone(),
            filter: stmt.filter.clone(),
            functions: functions.clone(),
        }))
    }
}

struct ProjectionPlan {
    wildcard: bool,
    projections: Vec<Projection>,
    filter: Option<Expr>,
    functions: FunctionRegistry,
}

impl PhysicalPlan for ProjectionPlan {
    fn process(&mut self, tuple: &Tuple) -> Result<Vec<Value>> {
        if let Some(filter) = &self.filter {
            let keep = eval(filter, &tuple.data, &self.functions)?;
            if !keep.as_bool().unwrap_or(false) {
                return Ok(vec![]);
            }
        }

        if self.wildcard {
            return Ok(vec![tuple.data.clone()]);
        }

        let mut row = serde_json::Map::new();
        for (i, projection) in self.projections.iter().enumerate() {
            if let Projection::Expr { expr, alias } = projection {
                let name = alias.clone().unwrap_or_else(|| default_column_name(expr, i));
                row.insert(name, eval(expr, &tuple.data, &self.functions)?);
            }
        }
        Ok(vec![Value::Object(row)])
    }
}

fn default_column_name(expr: &Expr, index: usize) -> String {
    match expr {
        Expr::Field(name) => name.clone(),
        Expr::FunctionCall { name, .. } => name.clone(),
        _ => format!("col_{index}"),
    }
}

/// Evaluate an expression against a tuple payload.
pub fn eval(expr: &Expr, data: &Value, functions: &FunctionRegistry) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(name) => Ok(data.get(name).cloned().unwrap_or(Value::Null)),
        Expr::FunctionCall { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, data, functions)?);
            }
            let f = functions.lookup(name, values.len())?;
            f.call(&values)
        }
        Expr::BinaryOp { op, left, right } => {
            let l = eval(left, data, functions)?;
            let r = eval(right, data, functions)?;
            apply_binary(*op, &l, &r)
        }
    }
}

fn apply_binary(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(json!(l == r)),
        BinOp::Ne => Ok(json!(l != r)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
                Ok(json!(match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                }))
            } else if let (Some(a), Some(b)) = (l.as_str(), r.as_str()) {
                Ok(json!(match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                }))
            } else {
                Err(SqlError::Eval(format!(
                    "cannot compare {l} and {r}"
                )))
            }
        }
        BinOp::And | BinOp::Or => match (l.as_bool(), r.as_bool()) {
            (Some(a), Some(b)) => Ok(json!(if op == BinOp::And { a && b } else { a || b })),
            _ => Err(SqlError::Eval(format!(
                "logical operators need boolean operands, got {l} and {r}"
            ))),
        },
        BinOp::Add | BinOp::Sub => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(json!(if op == BinOp::Add { a + b } else { a - b })),
            _ => Err(SqlError::Eval(format!(
                "arithmetic needs numeric operands, got {l} and {r}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Emitter, StreamWindow};
    use crate::registry::Function;
    use std::sync::Arc;

    fn stmt_with(emitter: Emitter) -> SelectStmt {
        SelectStmt {
            emitter,
            projections: vec![Projection::Wildcard],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        }
    }

    // ---------------------------------------------------------------
    // Emission shaping
    // ---------------------------------------------------------------

    #[test]
    fn test_shaping_defaults() {
        let shaping = EmissionShaping::from_stmt(&stmt_with(Emitter::rstream())).unwrap();
        assert!(shaping.limit.is_none());
        assert_eq!(shaping.sampling, Sampling::None);
        assert!(!shaping.limit_reached(i64::MAX));
    }

    #[test]
    fn test_negative_limit_means_unlimited() {
        let mut emitter = Emitter::rstream();
        emitter.limit = Some(-1);
        let shaping = EmissionShaping::from_stmt(&stmt_with(emitter)).unwrap();
        assert!(shaping.limit.is_none());
    }

    #[test]
    fn test_limit_reached() {
        let mut emitter = Emitter::rstream();
        emitter.limit = Some(2);
        let shaping = EmissionShaping::from_stmt(&stmt_with(emitter)).unwrap();
        assert!(!shaping.limit_reached(1));
        assert!(shaping.limit_reached(2));
        assert!(shaping.limit_reached(3));
    }

    #[test]
    fn test_invalid_sampling_parameters() {
        for sampling in [
            SamplingClause::CountBased { every_nth: 0 },
            SamplingClause::Randomized { probability: 101 },
            SamplingClause::Randomized { probability: -1 },
            SamplingClause::TimeBased { interval_ms: 0 },
        ] {
            let mut emitter = Emitter::rstream();
            emitter.sampling = Some(sampling);
            let result = EmissionShaping::from_stmt(&stmt_with(emitter));
            assert!(matches!(result, Err(SqlError::Plan(_))), "{sampling:?}");
        }
    }

    // ---------------------------------------------------------------
    // Default compiler
    // ---------------------------------------------------------------

    fn compile(stmt: &SelectStmt) -> Box<dyn PhysicalPlan> {
        DefaultPlanCompiler
            .compile(stmt, &FunctionRegistry::new())
            .unwrap()
    }

    #[test]
    fn test_wildcard_passthrough() {
        let stmt = SelectStmt::wildcard_over("s");
        let mut plan = compile(&stmt);
        let t = Tuple::new(json!({"a": 1}), 0);
        assert_eq!(plan.process(&t).unwrap(), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_field_projection_with_alias() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![
                Projection::Expr {
                    expr: Expr::field("a"),
                    alias: None,
                },
                Projection::Expr {
                    expr: Expr::field("b"),
                    alias: Some("renamed".to_string()),
                },
            ],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let mut plan = compile(&stmt);
        let t = Tuple::new(json!({"a": 1, "b": 2, "c": 3}), 0);
        assert_eq!(
            plan.process(&t).unwrap(),
            vec![json!({"a": 1, "renamed": 2})]
        );
    }

    #[test]
    fn test_missing_field_projects_null() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![Projection::Expr {
                expr: Expr::field("missing"),
                alias: None,
            }],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let mut plan = compile(&stmt);
        let t = Tuple::new(json!({"a": 1}), 0);
        assert_eq!(plan.process(&t).unwrap(), vec![json!({"missing": null})]);
    }

    #[test]
    fn test_filter_drops_rows() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![Projection::Wildcard],
            relations: vec![StreamWindow::new("s")],
            filter: Some(Expr::binary(
                BinOp::Gt,
                Expr::field("amount"),
                Expr::literal(json!(100)),
            )),
        };
        let mut plan = compile(&stmt);
        assert!(plan
            .process(&Tuple::new(json!({"amount": 50}), 0))
            .unwrap()
            .is_empty());
        assert_eq!(
            plan.process(&Tuple::new(json!({"amount": 150}), 0))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_mixed_wildcard_rejected() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![
                Projection::Wildcard,
                Projection::Expr {
                    expr: Expr::field("a"),
                    alias: None,
                },
            ],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let result = DefaultPlanCompiler.compile(&stmt, &FunctionRegistry::new());
        assert!(matches!(result, Err(SqlError::Plan(_))));
    }

    #[test]
    fn test_empty_projections_rejected() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let result = DefaultPlanCompiler.compile(&stmt, &FunctionRegistry::new());
        assert!(matches!(result, Err(SqlError::Plan(_))));
    }

    #[test]
    fn test_function_call_in_projection() {
        struct Double;
        impl Function for Double {
            fn accept(&self, arity: usize) -> bool {
                arity == 1
            }
            fn call(&self, args: &[Value]) -> Result<Value> {
                let n = args[0]
                    .as_f64()
                    .ok_or_else(|| SqlError::Eval("double expects a number".to_string()))?;
                Ok(json!(n * 2.0))
            }
        }

        let functions = FunctionRegistry::new();
        functions.register("double", Arc::new(Double)).unwrap();
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![Projection::Expr {
                expr: Expr::FunctionCall {
                    name: "double".to_string(),
                    args: vec![Expr::field("n")],
                },
                alias: None,
            }],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let mut plan = DefaultPlanCompiler.compile(&stmt, &functions).unwrap();
        let t = Tuple::new(json!({"n": 21}), 0);
        assert_eq!(plan.process(&t).unwrap(), vec![json!({"double": 42.0})]);
    }

    #[test]
    fn test_unknown_function_fails_at_eval() {
        let stmt = SelectStmt {
            emitter: Emitter::rstream(),
            projections: vec![Projection::Expr {
                expr: Expr::FunctionCall {
                    name: "nope".to_string(),
                    args: vec![],
                },
                alias: None,
            }],
            relations: vec![StreamWindow::new("s")],
            filter: None,
        };
        let mut plan = compile(&stmt);
        let result = plan.process(&Tuple::new(json!({}), 0));
        assert!(matches!(result, Err(SqlError::NotRegistered(_))));
    }

    // ---------------------------------------------------------------
    // Expression evaluation
    // ---------------------------------------------------------------

    #[test]
    fn test_eval_comparisons() {
        let functions = FunctionRegistry::new();
        let data = json!({"a": 2, "s": "abc"});
        let cases = [
            (BinOp::Eq, json!(2), true),
            (BinOp::Ne, json!(3), true),
            (BinOp::Lt, json!(3), true),
            (BinOp::Ge, json!(2), true),
            (BinOp::Gt, json!(2), false),
        ];
        for (op, rhs, expected) in cases {
            let e = Expr::binary(op, Expr::field("a"), Expr::Literal(rhs));
            assert_eq!(eval(&e, &data, &functions).unwrap(), json!(expected));
        }
        let e = Expr::binary(BinOp::Lt, Expr::field("s"), Expr::literal(json!("abd")));
        assert_eq!(eval(&e, &data, &functions).unwrap(), json!(true));
    }

    #[test]
    fn test_eval_arithmetic_and_logic() {
        let functions = FunctionRegistry::new();
        let data = json!({"a": 2.0});
        let sum = Expr::binary(BinOp::Add, Expr::field("a"), Expr::literal(json!(3)));
        assert_eq!(eval(&sum, &data, &functions).unwrap(), json!(5.0));

        let both = Expr::binary(
            BinOp::And,
            Expr::literal(json!(true)),
            Expr::literal(json!(false)),
        );
        assert_eq!(eval(&both, &data, &functions).unwrap(), json!(false));
    }

    #[test]
    fn test_eval_type_errors() {
        let functions = FunctionRegistry::new();
        let data = json!({"a": "str"});
        let bad = Expr::binary(BinOp::Add, Expr::field("a"), Expr::literal(json!(1)));
        assert!(matches!(
            eval(&bad, &data, &functions),
            Err(SqlError::Eval(_))
        ));
    }
}
