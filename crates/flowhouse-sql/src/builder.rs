//! Statement-driven topology building
//!
//! [`TopologyBuilder`] maps each statement onto node creation against a live
//! [`Topology`]: CREATE SOURCE / SINK instantiate registered creators,
//! CREATE STATE populates the shared-state directory, CREATE STREAM inserts
//! a [`SelectBox`] wired to every referenced relation, and INSERT INTO
//! desugars to a temporary stream connected to an existing sink.
//!
//! Statement building is not atomic across statements: when the second of
//! three statements fails, the node created by the first stays in the
//! topology. A single statement, however, cleans up after itself.
//!
//! For interactive queries, [`add_select_stmt`](TopologyBuilder::add_select_stmt)
//! builds a transient select box plus an anonymous channel sink and hands
//! the receiving half to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use flowhouse_core::{
    Context, Error as CoreError, InputConfig, NodeKind, Result as CoreResult, Sink, Topology,
    Tuple,
};

use crate::ast::{
    Emitter, InsertIntoSelectStmt, RangeUnit, SelectStmt, Statement, StreamWindow,
};
use crate::error::{Result, SqlError};
use crate::plan::{DefaultPlanCompiler, PlanCompiler};
use crate::registry::{
    copy_global_functions, copy_global_sink_creators, copy_global_source_creators,
    copy_global_state_creators, CreatorRegistry, FunctionRegistry, SinkCreator, SourceCreator,
    StateCreator,
};
use crate::select_box::SelectBox;

/// Buffered capacity of the channel behind a transient SELECT sink.
const SELECT_SINK_BUFFER: usize = 1024;

// Temporary node names only need to be unique within the process.
static NEXT_TEMP_ID: AtomicI64 = AtomicI64::new(0);

fn next_temp_id() -> i64 {
    NEXT_TEMP_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// Builds topology nodes from statements.
///
/// Holds topology-local snapshots of the process-global creator registries,
/// taken at construction: registrations made afterwards are not visible to
/// this builder. The target [`Topology`] can be shared by multiple builders.
pub struct TopologyBuilder {
    topology: Topology,
    functions: FunctionRegistry,
    source_creators: CreatorRegistry<dyn SourceCreator>,
    sink_creators: CreatorRegistry<dyn SinkCreator>,
    state_creators: CreatorRegistry<dyn StateCreator>,
    compiler: Arc<dyn PlanCompiler>,
    /// sink name -> box name of transient SELECT pipelines.
    selects: Mutex<HashMap<String, String>>,
}

impl TopologyBuilder {
    /// Create a builder over `topology`, snapshotting the global registries.
    pub fn new(topology: Topology) -> Self {
        Self::with_compiler(topology, Arc::new(DefaultPlanCompiler))
    }

    /// Create a builder using an external plan compiler for select boxes.
    pub fn with_compiler(topology: Topology, compiler: Arc<dyn PlanCompiler>) -> Self {
        Self {
            topology,
            functions: copy_global_functions(),
            source_creators: copy_global_source_creators(),
            sink_creators: copy_global_sink_creators(),
            state_creators: copy_global_state_creators(),
            compiler,
            selects: Mutex::new(HashMap::new()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn context(&self) -> &Context {
        self.topology.context()
    }

    /// Topology-local function registry.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Topology-local source-creator registry.
    pub fn source_creators(&self) -> &CreatorRegistry<dyn SourceCreator> {
        &self.source_creators
    }

    /// Topology-local sink-creator registry.
    pub fn sink_creators(&self) -> &CreatorRegistry<dyn SinkCreator> {
        &self.sink_creators
    }

    /// Topology-local state-creator registry.
    pub fn state_creators(&self) -> &CreatorRegistry<dyn StateCreator> {
        &self.state_creators
    }

    /// Apply one statement to the topology. Returns the name of the created
    /// node, or `None` for CREATE STATE, which creates no node.
    pub async fn add_stmt(&self, stmt: Statement) -> Result<Option<String>> {
        match stmt {
            Statement::CreateSource(s) => {
                let creator = self.source_creators.lookup(&s.source_type)?;
                let source = creator.create_source(self.context(), &s.params).await?;
                self.topology.add_source(&s.name, source).await?;
                info!(node_name = %s.name, source_type = %s.source_type, "source created");
                Ok(Some(s.name))
            }
            Statement::CreateSink(s) => {
                let creator = self.sink_creators.lookup(&s.sink_type)?;
                let sink = creator.create_sink(self.context(), &s.params).await?;
                self.topology.add_sink(&s.name, sink).await?;
                info!(node_name = %s.name, sink_type = %s.sink_type, "sink created");
                Ok(Some(s.name))
            }
            Statement::CreateState(s) => {
                let creator = self.state_creators.lookup(&s.state_type)?;
                let state = creator.create_state(self.context(), &s.params).await?;
                self.context().shared_states().add(&s.name, state).await?;
                info!(state_name = %s.name, state_type = %s.state_type, "shared state created");
                Ok(None)
            }
            Statement::CreateStream(s) => {
                let name = self.add_stream(s.name, s.select).await?;
                Ok(Some(name))
            }
            Statement::InsertIntoSelect(s) => {
                let name = self.add_insert_into(s).await?;
                Ok(Some(name))
            }
        }
    }

    /// Insert a select box named `name`, wiring one labeled edge per
    /// referenced relation and flagging the box stop-on-disconnect.
    async fn add_stream(&self, name: String, select: SelectStmt) -> Result<String> {
        let relations = select.relations.clone();
        let select_box =
            SelectBox::with_compiler(select, self.functions.clone(), self.compiler.clone());

        // The removal hook captures only a weak topology handle and the node
        // name, never the box itself: the topology owns the box, so a strong
        // handle here would form a reference cycle and leak the topology.
        let topology = self.topology.downgrade();
        let node_name = name.clone();
        select_box
            .set_remove_hook(Box::new(move || {
                // Nothing to detach from once the topology is gone.
                if let Some(topology) = topology.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = topology.remove(&node_name).await {
                            warn!(node_name = %node_name, error = %e, "select box failed to detach");
                        }
                    });
                }
            }))
            .await;

        self.topology.add_box(&name, Box::new(select_box)).await?;
        for relation in &relations {
            let cfg = InputConfig {
                input_name: Some(relation.name.clone()),
                ..Default::default()
            };
            if let Err(e) = self.topology.input(&name, &relation.name, cfg).await {
                let _ = self.topology.remove(&name).await;
                return Err(e.into());
            }
        }
        self.topology.set_stop_on_disconnect(&name).await?;
        info!(node_name = %name, "stream created");
        Ok(name)
    }

    /// Desugar `INSERT INTO sink SELECT ...` into a temporary stream with a
    /// forced `[RANGE 1 TUPLES]` window, connected to the sink.
    async fn add_insert_into(&self, stmt: InsertIntoSelectStmt) -> Result<String> {
        match self.topology.node_kind(&stmt.sink).await {
            Some(NodeKind::Sink) => {}
            _ => return Err(CoreError::NotFound(stmt.sink.clone()).into()),
        }
        if stmt.emitter.is_some() {
            return Err(SqlError::InvalidStatement(
                "an emitter clause cannot be used with an INSERT INTO statement".to_string(),
            ));
        }
        let mut relations = Vec::with_capacity(stmt.relations.len());
        for relation in stmt.relations {
            if relation.range.is_some() {
                return Err(SqlError::InvalidStatement(
                    "a RANGE clause cannot be used with an INSERT INTO statement".to_string(),
                ));
            }
            // The window is forced to a single tuple regardless of what the
            // downstream compiler would default to.
            relations.push(relation.with_range(1, RangeUnit::Tuples));
        }

        let tmp_name = format!("_flowhouse_tmp_{}", next_temp_id());
        let select = SelectStmt {
            emitter: Emitter::rstream(),
            projections: stmt.projections,
            relations,
            filter: stmt.filter,
        };
        self.add_stream(tmp_name.clone(), select).await?;

        if let Err(e) = self
            .topology
            .input(&stmt.sink, &tmp_name, InputConfig::default())
            .await
        {
            let _ = self.topology.remove(&tmp_name).await;
            return Err(e.into());
        }
        Ok(tmp_name)
    }

    /// Build a transient pipeline for an interactive SELECT: a select box
    /// plus an anonymous sink that forwards each result's payload into the
    /// returned channel.
    ///
    /// The channel closes once the pipeline stops (end of stream). To tear
    /// the pipeline down early, drop the receiver and call
    /// [`stop_select`](TopologyBuilder::stop_select); with the receiver gone
    /// the sink drains remaining tuples without blocking upstreams.
    pub async fn add_select_stmt(
        &self,
        select: SelectStmt,
    ) -> Result<(String, mpsc::Receiver<Value>)> {
        let id = next_temp_id();
        let box_name = format!("_select_box_{id}");
        let sink_name = format!("_select_sink_{id}");

        self.add_stream(box_name.clone(), select).await?;

        let (tx, rx) = mpsc::channel(SELECT_SINK_BUFFER);
        if let Err(e) = self
            .topology
            .add_sink(&sink_name, Box::new(ChannelSink { tx }))
            .await
        {
            let _ = self.topology.remove(&box_name).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .topology
            .input(&sink_name, &box_name, InputConfig::default())
            .await
        {
            let _ = self.topology.remove(&sink_name).await;
            let _ = self.topology.remove(&box_name).await;
            return Err(e.into());
        }
        self.topology.set_stop_on_disconnect(&sink_name).await?;

        self.selects
            .lock()
            .await
            .insert(sink_name.clone(), box_name);
        Ok((sink_name, rx))
    }

    /// Tear down a transient SELECT pipeline created by `add_select_stmt`.
    pub async fn stop_select(&self, sink_name: &str) -> Result<()> {
        let box_name = self
            .selects
            .lock()
            .await
            .remove(sink_name)
            .ok_or_else(|| SqlError::Core(CoreError::NotFound(sink_name.to_string())))?;

        // Removing the box closes the sink's only input; the sink drains the
        // remaining tuples and stops on disconnect. The box may have already
        // detached itself (LIMIT reached), so NotFound is not an error here.
        match self.topology.remove(&box_name).await {
            Ok(()) | Err(CoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.topology.remove(sink_name).await {
            Ok(()) | Err(CoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Anonymous sink forwarding tuple payloads into an mpsc channel.
struct ChannelSink {
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl Sink for ChannelSink {
    async fn write(&mut self, _ctx: &Context, tuple: Tuple) -> CoreResult<()> {
        // A departed reader means teardown, not failure: keep draining so
        // upstreams never block on a dead consumer.
        let _ = self.tx.send(tuple.data).await;
        Ok(())
    }

    async fn close(&mut self, _ctx: &Context) -> CoreResult<()> {
        Ok(())
    }
}
