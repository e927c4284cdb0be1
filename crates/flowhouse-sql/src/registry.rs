//! Creator registries for user-defined artifacts
//!
//! Every constructible artifact - sources, sinks, shared states, and scalar
//! functions - is registered under a type name and looked up by it; nothing
//! is ever loaded from strings at call sites.
//!
//! Process-global registries exist for each kind. Registration happens
//! during program startup, before any topology is built; a topology builder
//! takes a [`copy_global_source_creators`]-style snapshot at construction so
//! running topologies are insulated from later registrations.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use flowhouse_core::{Context, SharedState, Sink, Source};

use crate::error::{Result, SqlError};

// ---------------------------------------------------------------------------
// Creator traits
// ---------------------------------------------------------------------------

/// Creates a source from `CREATE SOURCE ... WITH (params)`.
#[async_trait]
pub trait SourceCreator: Send + Sync {
    async fn create_source(
        &self,
        ctx: &Context,
        params: &HashMap<String, Value>,
    ) -> Result<Arc<dyn Source>>;
}

/// Creates a sink from `CREATE SINK ... WITH (params)`.
#[async_trait]
pub trait SinkCreator: Send + Sync {
    async fn create_sink(
        &self,
        ctx: &Context,
        params: &HashMap<String, Value>,
    ) -> Result<Box<dyn Sink>>;
}

/// Creates a shared state from `CREATE STATE ... WITH (params)`.
#[async_trait]
pub trait StateCreator: Send + Sync {
    async fn create_state(
        &self,
        ctx: &Context,
        params: &HashMap<String, Value>,
    ) -> Result<Arc<dyn SharedState>>;
}

/// A scalar function callable from expressions.
pub trait Function: Send + Sync {
    /// Whether the function accepts the given number of arguments.
    fn accept(&self, arity: usize) -> bool;

    /// Apply the function.
    fn call(&self, args: &[Value]) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Generic registry
// ---------------------------------------------------------------------------

/// A thread-safe name -> creator map.
pub struct CreatorRegistry<T: ?Sized> {
    creators: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> CreatorRegistry<T> {
    pub fn new() -> Self {
        Self {
            creators: RwLock::new(HashMap::new()),
        }
    }

    /// Register a creator under `type_name`. Fails with `AlreadyRegistered`
    /// when the name is taken.
    pub fn register(&self, type_name: &str, creator: Arc<T>) -> Result<()> {
        let mut creators = self.creators.write().expect("registry lock poisoned");
        if creators.contains_key(type_name) {
            return Err(SqlError::AlreadyRegistered(type_name.to_string()));
        }
        creators.insert(type_name.to_string(), creator);
        Ok(())
    }

    /// Look up a creator by type name.
    pub fn lookup(&self, type_name: &str) -> Result<Arc<T>> {
        let creators = self.creators.read().expect("registry lock poisoned");
        creators
            .get(type_name)
            .cloned()
            .ok_or_else(|| SqlError::NotRegistered(type_name.to_string()))
    }

    /// A caller-owned copy of the full map.
    pub fn list(&self) -> HashMap<String, Arc<T>> {
        let creators = self.creators.read().expect("registry lock poisoned");
        creators.clone()
    }

    /// Remove a creator. Idempotent: removing an absent name succeeds.
    pub fn unregister(&self, type_name: &str) -> Result<()> {
        let mut creators = self.creators.write().expect("registry lock poisoned");
        creators.remove(type_name);
        Ok(())
    }

    /// An independent copy of this registry.
    pub fn copy(&self) -> Self {
        Self {
            creators: RwLock::new(self.list()),
        }
    }
}

impl<T: ?Sized> Default for CreatorRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Function registry
// ---------------------------------------------------------------------------

/// Registry of scalar functions, looked up by name and arity.
///
/// Cloning shares the underlying map; use [`copy`](FunctionRegistry::copy)
/// for an independent snapshot.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    inner: Arc<CreatorRegistry<dyn Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, function: Arc<dyn Function>) -> Result<()> {
        self.inner.register(name, function)
    }

    /// Look up a function and verify it accepts `arity` arguments.
    pub fn lookup(&self, name: &str, arity: usize) -> Result<Arc<dyn Function>> {
        let f = self.inner.lookup(name)?;
        if !f.accept(arity) {
            return Err(SqlError::ArityMismatch {
                name: name.to_string(),
                arity,
            });
        }
        Ok(f)
    }

    pub fn list(&self) -> HashMap<String, Arc<dyn Function>> {
        self.inner.list()
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.inner.unregister(name)
    }

    /// An independent snapshot of this registry.
    pub fn copy(&self) -> Self {
        Self {
            inner: Arc::new(self.inner.copy()),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-global registries
// ---------------------------------------------------------------------------

static GLOBAL_SOURCE_CREATORS: LazyLock<CreatorRegistry<dyn SourceCreator>> =
    LazyLock::new(CreatorRegistry::new);
static GLOBAL_SINK_CREATORS: LazyLock<CreatorRegistry<dyn SinkCreator>> =
    LazyLock::new(CreatorRegistry::new);
static GLOBAL_STATE_CREATORS: LazyLock<CreatorRegistry<dyn StateCreator>> =
    LazyLock::new(CreatorRegistry::new);
static GLOBAL_FUNCTIONS: LazyLock<FunctionRegistry> = LazyLock::new(FunctionRegistry::new);

/// Register a source creator visible to all topologies built afterwards.
pub fn register_global_source_creator(
    type_name: &str,
    creator: Arc<dyn SourceCreator>,
) -> Result<()> {
    GLOBAL_SOURCE_CREATORS.register(type_name, creator)
}

/// Register a sink creator visible to all topologies built afterwards.
pub fn register_global_sink_creator(type_name: &str, creator: Arc<dyn SinkCreator>) -> Result<()> {
    GLOBAL_SINK_CREATORS.register(type_name, creator)
}

/// Register a state creator visible to all topologies built afterwards.
pub fn register_global_state_creator(
    type_name: &str,
    creator: Arc<dyn StateCreator>,
) -> Result<()> {
    GLOBAL_STATE_CREATORS.register(type_name, creator)
}

/// Register a scalar function visible to all topologies built afterwards.
pub fn register_global_function(name: &str, function: Arc<dyn Function>) -> Result<()> {
    GLOBAL_FUNCTIONS.register(name, function)
}

/// Snapshot of the global source-creator registry.
pub fn copy_global_source_creators() -> CreatorRegistry<dyn SourceCreator> {
    GLOBAL_SOURCE_CREATORS.copy()
}

/// Snapshot of the global sink-creator registry.
pub fn copy_global_sink_creators() -> CreatorRegistry<dyn SinkCreator> {
    GLOBAL_SINK_CREATORS.copy()
}

/// Snapshot of the global state-creator registry.
pub fn copy_global_state_creators() -> CreatorRegistry<dyn StateCreator> {
    GLOBAL_STATE_CREATORS.copy()
}

/// Snapshot of the global function registry.
pub fn copy_global_functions() -> FunctionRegistry {
    GLOBAL_FUNCTIONS.copy()
}
