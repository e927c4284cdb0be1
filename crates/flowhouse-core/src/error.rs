//! Error types for the core dataflow engine

use thiserror::Error;

use crate::topology::TopologyState;

/// Errors surfaced by topology construction and execution.
#[derive(Debug, Error)]
pub enum Error {
    #[error("there is already a node named '{0}'")]
    NameTaken(String),

    #[error("there is no box or source named '{0}'")]
    UnknownRef(String),

    #[error("'{to}' is already connected to '{from}' with input name '{input_name}'")]
    DuplicateEdge {
        from: String,
        to: String,
        input_name: String,
    },

    #[error("input name '{input_name}' is not accepted by box '{name}'")]
    LabelRejected { name: String, input_name: String },

    #[error("this topology builder has already built the topology")]
    Frozen,

    #[error("there must be at least one source")]
    NoSources,

    #[error("the topology has a cycle: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("node '{0}' was not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("the topology is already stopped")]
    Stopped,

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TopologyState,
        to: TopologyState,
    },

    #[error("invalid node name: '{0}'")]
    InvalidNodeName(String),

    #[error("process error: {0}")]
    Process(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary operator failure as a process error.
    pub fn process<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Process(Box::new(err))
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;
