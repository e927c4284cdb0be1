//! Errors for the stream query surface

use thiserror::Error;

/// Errors surfaced by statement handling, plan compilation, and registries.
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("plan error: {0}")]
    Plan(String),

    #[error("a creator for type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("a creator for type '{0}' is not registered")]
    NotRegistered(String),

    #[error("function '{name}' does not accept {arity} argument(s)")]
    ArityMismatch { name: String, arity: usize },

    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error(transparent)]
    Core(#[from] flowhouse_core::Error),
}

/// Result type for query-surface operations.
pub type Result<T> = std::result::Result<T, SqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_error_display() {
        let err = SqlError::Plan("unsupported projection".to_string());
        assert_eq!(err.to_string(), "plan error: unsupported projection");
    }

    #[test]
    fn test_already_registered_display() {
        let err = SqlError::AlreadyRegistered("file".to_string());
        assert_eq!(
            err.to_string(),
            "a creator for type 'file' is already registered"
        );
    }

    #[test]
    fn test_not_registered_display() {
        let err = SqlError::NotRegistered("kafka".to_string());
        assert_eq!(
            err.to_string(),
            "a creator for type 'kafka' is not registered"
        );
    }

    #[test]
    fn test_arity_mismatch_display() {
        let err = SqlError::ArityMismatch {
            name: "concat".to_string(),
            arity: 0,
        };
        assert_eq!(
            err.to_string(),
            "function 'concat' does not accept 0 argument(s)"
        );
    }

    #[test]
    fn test_core_error_passthrough() {
        let err: SqlError = flowhouse_core::Error::NoSources.into();
        assert_eq!(err.to_string(), "there must be at least one source");
    }
}
