//! Per-topology ambient context
//!
//! A [`Context`] is shared by every node of a topology. It carries the
//! feature flags that influence the data path (currently tuple tracing) and
//! the directory of named shared states that operators may look up at
//! runtime. The context is created before the topology and outlives all of
//! its nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// A named state shared between operators of one topology.
///
/// The engine only manages the lifecycle; what a state stores and how
/// operators use it is entirely up to the implementation.
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Release any resources held by the state. Called exactly once when the
    /// state is removed from its directory.
    async fn terminate(&self, ctx: &Context) -> Result<()>;
}

/// Thread-safe name -> state directory owned by a [`Context`].
#[derive(Default)]
pub struct SharedStateRegistry {
    states: RwLock<HashMap<String, Arc<dyn SharedState>>>,
}

impl SharedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a state under `name`. Fails with `AlreadyExists` when the name is
    /// taken.
    pub async fn add(&self, name: &str, state: Arc<dyn SharedState>) -> Result<()> {
        let mut states = self.states.write().await;
        if states.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        states.insert(name.to_string(), state);
        Ok(())
    }

    /// Look up a state by name.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn SharedState>> {
        let states = self.states.read().await;
        states
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Remove a state, invoking its `terminate` hook. Termination failures
    /// are logged and do not undo the removal.
    pub async fn remove(&self, ctx: &Context, name: &str) -> Result<()> {
        let state = {
            let mut states = self.states.write().await;
            states
                .remove(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };
        if let Err(e) = state.terminate(ctx).await {
            warn!(state_name = %name, error = %e, "shared state failed to terminate");
        }
        Ok(())
    }

    /// Names of all registered states.
    pub async fn list(&self) -> Vec<String> {
        let states = self.states.read().await;
        states.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Configuration applied when creating a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Whether tuples accumulate trace events at node boundaries.
    pub tuple_trace_enabled: bool,
}

struct ContextInner {
    tuple_trace: AtomicBool,
    shared_states: SharedStateRegistry,
}

/// Shared ambient state for one topology. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                tuple_trace: AtomicBool::new(config.tuple_trace_enabled),
                shared_states: SharedStateRegistry::new(),
            }),
        }
    }

    /// Whether tuple tracing is currently enabled.
    pub fn is_tuple_trace_enabled(&self) -> bool {
        self.inner.tuple_trace.load(Ordering::Relaxed)
    }

    /// Enable or disable tuple tracing at runtime.
    pub fn set_tuple_trace_enabled(&self, enabled: bool) {
        self.inner.tuple_trace.store(enabled, Ordering::Relaxed);
    }

    /// The directory of named shared states.
    pub fn shared_states(&self) -> &SharedStateRegistry {
        &self.inner.shared_states
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopState;

    #[async_trait]
    impl SharedState for NopState {
        async fn terminate(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
    }

    struct FailingState;

    #[async_trait]
    impl SharedState for FailingState {
        async fn terminate(&self, _ctx: &Context) -> Result<()> {
            Err(Error::Stopped)
        }
    }

    #[test]
    fn test_trace_flag_defaults_off() {
        let ctx = Context::default();
        assert!(!ctx.is_tuple_trace_enabled());
    }

    #[test]
    fn test_trace_flag_toggle() {
        let ctx = Context::default();
        ctx.set_tuple_trace_enabled(true);
        assert!(ctx.is_tuple_trace_enabled());
        ctx.set_tuple_trace_enabled(false);
        assert!(!ctx.is_tuple_trace_enabled());
    }

    #[test]
    fn test_context_clone_shares_flags() {
        let ctx = Context::default();
        let other = ctx.clone();
        ctx.set_tuple_trace_enabled(true);
        assert!(other.is_tuple_trace_enabled());
    }

    #[tokio::test]
    async fn test_shared_state_add_and_get() {
        let ctx = Context::default();
        ctx.shared_states()
            .add("counter", Arc::new(NopState))
            .await
            .unwrap();
        assert!(ctx.shared_states().get("counter").await.is_ok());
    }

    #[tokio::test]
    async fn test_shared_state_duplicate_name() {
        let ctx = Context::default();
        ctx.shared_states()
            .add("s", Arc::new(NopState))
            .await
            .unwrap();
        let result = ctx.shared_states().add("s", Arc::new(NopState)).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_shared_state_get_missing() {
        let ctx = Context::default();
        let result = ctx.shared_states().get("ghost").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shared_state_remove() {
        let ctx = Context::default();
        ctx.shared_states()
            .add("s", Arc::new(NopState))
            .await
            .unwrap();
        ctx.shared_states().remove(&ctx, "s").await.unwrap();
        assert!(ctx.shared_states().get("s").await.is_err());
    }

    #[tokio::test]
    async fn test_shared_state_remove_missing() {
        let ctx = Context::default();
        let result = ctx.shared_states().remove(&ctx, "ghost").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_shared_state_remove_survives_terminate_failure() {
        let ctx = Context::default();
        ctx.shared_states()
            .add("bad", Arc::new(FailingState))
            .await
            .unwrap();
        // Removal succeeds even though terminate failed.
        ctx.shared_states().remove(&ctx, "bad").await.unwrap();
        assert!(ctx.shared_states().get("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_shared_state_list() {
        let ctx = Context::default();
        ctx.shared_states()
            .add("a", Arc::new(NopState))
            .await
            .unwrap();
        ctx.shared_states()
            .add("b", Arc::new(NopState))
            .await
            .unwrap();
        let mut names = ctx.shared_states().list().await;
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
