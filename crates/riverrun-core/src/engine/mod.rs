//! The process engine: tracked execution arena, unit-of-work coordination,
//! and tree-to-storage synchronization.
//!
//! `ProcessEngine` owns the storage backend, the tracked set of live
//! executions, the cached process definitions, and the event bus. All tree
//! mutation and synchronization happen synchronously within one call stack;
//! "concurrent" branches are concurrent in the process-modeling sense only.
//!
//! # Unit-of-work flow
//!
//! 1. A caller invokes a runtime operation (`start_process`, `signal`, ...).
//! 2. [`ProcessEngine::run_batch`] opens (or reuses) the transaction and
//!    flushes any already-tracked dirty state.
//! 3. The operation mutates the tree, possibly through behaviors and
//!    command handlers, driven by an explicit work queue.
//! 4. A second synchronization pass persists the deltas, then the locally
//!    opened transaction commits (or rolls back on error) and the tracked
//!    set is cleared.

pub mod binary;
pub mod execution;
pub mod info;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use riverrun_types::definition::{Expression, ProcessDefinition};
use riverrun_types::error::{ConsistencyError, EngineError, PolicyError};
use riverrun_types::event::EngineEvent;
use riverrun_types::execution::{ExecutionRecord, ExecutionState};
use serde_json::Value;
use uuid::Uuid;

use crate::behavior;
use crate::command::Command;
use crate::event::bus::EventBus;
use crate::store::ExecutionStore;

use execution::Execution;
use info::{DirtyState, ExecutionInfo};

// ---------------------------------------------------------------------------
// Delegate tasks
// ---------------------------------------------------------------------------

/// A synchronous task resolved by type name and run against an execution's
/// local variable scope.
pub trait DelegateTask: Send + Sync {
    fn run(&self, variables: &mut BTreeMap<String, Value>) -> Result<(), EngineError>;
}

/// Factory collaborating with service-task nodes. Absence is a policy error
/// at the point of use.
pub trait DelegateTaskFactory: Send + Sync {
    fn create_delegate_task(&self, task_type: &str) -> Result<Box<dyn DelegateTask>, EngineError>;
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

/// Internal operation queued while a batch advances executions. Draining the
/// queue iteratively replaces unbounded recursion through behaviors.
#[derive(Debug)]
pub(crate) enum EngineOp {
    ExecuteNode { execution: Uuid },
    TakeTransition { execution: Uuid, transition: String },
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

/// Process-execution runtime over a storage backend.
///
/// Generic over `S: ExecutionStore`; single logical thread of control per
/// engine instance. Concurrent external callers must be serialized by the
/// store's transaction isolation, not by the engine.
pub struct ProcessEngine<S: ExecutionStore> {
    store: S,
    events: EventBus,
    executions: HashMap<Uuid, ExecutionInfo>,
    definitions: HashMap<Uuid, Arc<ProcessDefinition>>,
    delegate_tasks: Option<Box<dyn DelegateTaskFactory>>,
    pending: VecDeque<EngineOp>,
    depth: u32,
    handle_transactions: bool,
}

impl<S: ExecutionStore> ProcessEngine<S> {
    pub fn new(store: S, events: EventBus) -> Self {
        Self::with_transaction_handling(store, events, true)
    }

    /// When `handle_transactions` is false the engine never opens, commits,
    /// or rolls back transactions; the caller owns the boundary.
    pub fn with_transaction_handling(store: S, events: EventBus, handle_transactions: bool) -> Self {
        Self {
            store,
            events,
            executions: HashMap::new(),
            definitions: HashMap::new(),
            delegate_tasks: None,
            pending: VecDeque::new(),
            depth: 0,
            handle_transactions,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct store access for command handlers. Commands ride the
    /// enclosing transaction and must never open their own.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish an engine event to the notification bus.
    pub fn notify(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    pub fn set_delegate_task_factory(&mut self, factory: Option<Box<dyn DelegateTaskFactory>>) {
        self.delegate_tasks = factory;
    }

    /// Resolve a delegate task through the configured factory.
    pub fn delegate_task(&self, task_type: &str) -> Result<Box<dyn DelegateTask>, EngineError> {
        match &self.delegate_tasks {
            Some(factory) => factory.create_delegate_task(task_type),
            None => Err(PolicyError::MissingDelegateTaskFactory.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Deploy a process definition into the engine's cache. Definitions are
    /// immutable and shared by reference across all executions.
    pub fn deploy(&mut self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        self.definitions.insert(definition.id, definition.clone());
        definition
    }

    pub fn definition(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| PolicyError::DefinitionNotDeployed(id).into())
    }

    // -----------------------------------------------------------------------
    // Tracked-set access
    // -----------------------------------------------------------------------

    /// A tracked execution by id. Does not hit storage; use [`find`] for
    /// lookups that may require reconstruction.
    ///
    /// [`find`]: Self::find
    pub fn execution(&self, id: Uuid) -> Result<&Execution, EngineError> {
        self.executions
            .get(&id)
            .map(ExecutionInfo::execution)
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    pub(crate) fn execution_mut(&mut self, id: Uuid) -> Result<&mut Execution, EngineError> {
        self.executions
            .get_mut(&id)
            .map(ExecutionInfo::execution_mut)
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Number of currently tracked executions.
    pub fn tracked_count(&self) -> usize {
        self.executions.len()
    }

    /// Variable lookup along the parent chain: the nearest local binding
    /// toward the root wins.
    pub fn variable(&self, id: Uuid, name: &str) -> Option<Value> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let info = self.executions.get(&current)?;
            if let Some(value) = info.execution().local_variable(name) {
                return Some(value.clone());
            }
            cursor = info.execution().parent();
        }
        None
    }

    /// Write a variable into an execution's local scope.
    pub fn set_variable(
        &mut self,
        id: Uuid,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), EngineError> {
        self.execution_mut(id)?.set_variable(name, value);
        Ok(())
    }

    /// Resolve an optional expression to a string against an execution's
    /// variable chain. Absent expressions and unbound variables resolve to
    /// the empty string.
    pub fn string_value(&self, id: Uuid, expression: Option<&Expression>) -> String {
        match expression {
            None => String::new(),
            Some(Expression::Literal { value }) => value.clone(),
            Some(Expression::Variable { name }) => match self.variable(id, name) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Registration & lookup
    // -----------------------------------------------------------------------

    /// Track an execution. Without a known-persisted baseline the node is
    /// New and is synchronized immediately, so a freshly created node is
    /// durable before any dependent command runs.
    pub async fn register_execution(
        &mut self,
        execution: Execution,
        clean: Option<ExecutionRecord>,
    ) -> Result<(), EngineError> {
        let id = execution.id();
        let current = execution.to_record()?;
        let info = ExecutionInfo::new(execution, clean);
        let state = info.classify(&current);
        self.executions.insert(id, info);

        if state == DirtyState::New {
            self.sync_execution(id).await?;
        }
        Ok(())
    }

    /// Find an execution by id, reconstructing its whole process tree from
    /// storage on a tracked-set miss. Trees are always reconstructed as a
    /// whole; partial reconstruction would violate the parent-must-exist
    /// invariant.
    pub async fn find(&mut self, id: Uuid) -> Result<&Execution, EngineError> {
        if !self.executions.contains_key(&id) {
            self.load_process(id).await?;
        }
        self.execution(id)
    }

    async fn load_process(&mut self, id: Uuid) -> Result<(), EngineError> {
        let records = self.store.load_process_executions(id).await?;
        if records.is_empty() {
            return Err(EngineError::ExecutionNotFound(id));
        }

        let mut built = Vec::with_capacity(records.len());
        for record in &records {
            let definition = self.definition(record.definition_id)?;
            built.push(Execution::from_record(record, definition)?);
        }

        let index: HashMap<Uuid, usize> =
            built.iter().enumerate().map(|(i, e)| (e.id(), i)).collect();
        let edges: Vec<(Uuid, Uuid)> = built
            .iter()
            .filter_map(|e| e.parent().map(|p| (p, e.id())))
            .collect();
        for (parent, child) in edges {
            let Some(&slot) = index.get(&parent) else {
                return Err(ConsistencyError::DanglingParent { child, parent }.into());
            };
            built[slot].add_child(child);
        }

        tracing::debug!(execution = %id, nodes = built.len(), "reconstructed process tree");

        for execution in built {
            let baseline = execution.to_record()?;
            self.register_execution(execution, Some(baseline)).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unit-of-work coordination
    // -----------------------------------------------------------------------

    /// Run a batch of execution steps as one unit of work.
    ///
    /// Depth 0 with no open store transaction begins one locally; nested
    /// calls reuse the outer transaction and share the tracked set. Success
    /// at depth 0 commits and clears the tracked set; an error rolls back,
    /// clears, and is re-raised unchanged.
    pub async fn run_batch<T, F>(&mut self, f: F) -> Result<T, EngineError>
    where
        F: AsyncFnOnce(&mut Self) -> Result<T, EngineError>,
    {
        let mut local_tx = false;
        if self.depth == 0 && self.handle_transactions && !self.store.in_transaction() {
            tracing::debug!("BEGIN transaction");
            self.store.begin().await?;
            local_tx = true;
        }

        self.depth += 1;
        let result = self.perform(f).await;
        self.depth -= 1;

        match result {
            Ok(value) => {
                if local_tx {
                    tracing::debug!("COMMIT transaction");
                    let committed = self.store.commit().await;
                    self.executions.clear();
                    committed?;
                }
                Ok(value)
            }
            Err(err) => {
                if local_tx {
                    tracing::debug!("ROLLBACK transaction");
                    if let Err(rollback_err) = self.store.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback failed");
                    }
                    self.executions.clear();
                }
                Err(err)
            }
        }
    }

    async fn perform<T, F>(&mut self, f: F) -> Result<T, EngineError>
    where
        F: AsyncFnOnce(&mut Self) -> Result<T, EngineError>,
    {
        // Flush state left dirty by an earlier, already-committed batch.
        self.sync_all().await?;
        let value = f(self).await?;
        // Primary persistence point.
        self.sync_all().await?;
        Ok(value)
    }

    /// Whether a unit of work is currently active. Command handlers must
    /// run inside one.
    pub fn in_batch(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn require_active_batch(&self) -> Result<(), EngineError> {
        if self.in_batch() {
            Ok(())
        } else {
            Err(PolicyError::CommandOutsideUnitOfWork.into())
        }
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Synchronize every tracked execution: roots first (recursing into live
    /// children, parent rows before child rows), then leftover detached
    /// nodes awaiting deletion. Sorted-id order keeps passes deterministic.
    pub(crate) async fn sync_all(&mut self) -> Result<(), EngineError> {
        let mut roots: Vec<Uuid> = self
            .executions
            .values()
            .map(ExecutionInfo::execution)
            .filter(|e| {
                e.parent()
                    .is_none_or(|parent| !self.executions.contains_key(&parent))
            })
            .map(Execution::id)
            .collect();
        roots.sort_unstable();
        for id in roots {
            self.sync_execution(id).await?;
        }

        let mut detached: Vec<Uuid> = self.executions.keys().copied().collect();
        detached.sort_unstable();
        for id in detached {
            self.sync_execution(id).await?;
        }
        Ok(())
    }

    /// Synchronize one node and its subtree against storage.
    ///
    /// Removed nodes delete every tracked dependent row first, including
    /// terminated branches already detached from the live child list, then
    /// their own row, and leave the tracked set; a node created and
    /// discarded before ever being persisted is dropped without any I/O.
    pub(crate) async fn sync_execution(&mut self, id: Uuid) -> Result<(), EngineError> {
        let Some(tracked) = self.executions.get(&id) else {
            return Ok(());
        };
        let current = tracked.execution().to_record()?;
        let state = tracked.classify(&current);
        let children = tracked.execution().children().to_vec();
        let persisted = tracked.is_persisted();

        match state {
            DirtyState::Removed => {
                // Terminated branches are detached from the live child list
                // but their rows still reference this one. Collect dependents
                // by parent pointer so every such row is deleted first.
                let mut dependents: Vec<Uuid> = Vec::new();
                for (&child, info) in &self.executions {
                    if child == id || info.execution().parent() != Some(id) {
                        continue;
                    }
                    if !info.execution().state().is_terminated() {
                        return Err(ConsistencyError::RemovedNodeHasLiveChildren(id).into());
                    }
                    dependents.push(child);
                }
                dependents.sort_unstable();
                for child in dependents {
                    Box::pin(self.sync_execution(child)).await?;
                }
                if persisted {
                    tracing::debug!(execution = %id, "sync delete");
                    self.store.delete_execution(id).await?;
                }
                self.executions.remove(&id);
                return Ok(());
            }
            DirtyState::New => {
                tracing::debug!(execution = %id, "sync create");
                self.store.insert_execution(&current).await?;
                if let Some(info) = self.executions.get_mut(&id) {
                    info.commit(current);
                }
            }
            DirtyState::Modified => {
                tracing::debug!(execution = %id, "sync update");
                self.store.update_execution(&current).await?;
                if let Some(info) = self.executions.get_mut(&id) {
                    info.commit(current);
                }
            }
            DirtyState::Unchanged => {}
        }

        for child in children {
            Box::pin(self.sync_execution(child)).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tree mutation
    // -----------------------------------------------------------------------

    /// Terminate an execution and all of its descendants, detaching the
    /// subtree from its parent scope. Rows are removed at the next
    /// synchronization pass, children before parents.
    pub fn terminate(&mut self, id: Uuid) -> Result<(), EngineError> {
        self.mark_terminated(id)?;
        let parent = self.execution(id)?.parent();
        if let Some(parent_id) = parent
            && let Some(info) = self.executions.get_mut(&parent_id)
        {
            info.execution_mut().remove_child(id);
        }
        Ok(())
    }

    fn mark_terminated(&mut self, id: Uuid) -> Result<(), EngineError> {
        let info = self
            .executions
            .get_mut(&id)
            .ok_or(EngineError::ExecutionNotFound(id))?;
        let state = info.execution().state().with(ExecutionState::TERMINATED);
        info.execution_mut().set_state(state);

        let children = info.execution().children().to_vec();
        for child in children {
            self.mark_terminated(child)?;
        }
        Ok(())
    }

    /// End an execution: terminates the subtree and, for the process root,
    /// announces the end of the whole instance.
    pub(crate) fn end_execution(&mut self, id: Uuid) -> Result<(), EngineError> {
        let execution = self.execution(id)?;
        let is_root = execution.parent().is_none();
        let process_id = execution.process_id();
        self.terminate(id)?;
        if is_root {
            self.notify(EngineEvent::ProcessEnded { process_id });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Work queue
    // -----------------------------------------------------------------------

    pub(crate) fn enqueue(&mut self, op: EngineOp) {
        self.pending.push_back(op);
    }

    /// Drain the work queue, advancing executions one operation at a time.
    pub(crate) async fn drain(&mut self) -> Result<(), EngineError> {
        while let Some(op) = self.pending.pop_front() {
            match op {
                EngineOp::ExecuteNode { execution } => {
                    behavior::execute(self, execution).await?;
                }
                EngineOp::TakeTransition {
                    execution,
                    transition,
                } => {
                    self.take(execution, &transition)?;
                }
            }
        }
        Ok(())
    }

    /// Move an execution over a transition onto its target node and queue
    /// the node's behavior.
    fn take(&mut self, id: Uuid, transition: &str) -> Result<(), EngineError> {
        let execution = self.execution(id)?;
        let target = execution
            .definition()
            .find_transition(transition)
            .ok_or_else(|| ConsistencyError::UnknownTransition(transition.to_string()))?
            .to
            .clone();

        let execution = self.execution_mut(id)?;
        execution.set_transition(Some(transition.to_string()));
        execution.set_node(Some(target));
        let state = execution.state().without(ExecutionState::WAITING);
        execution.set_state(state);

        self.enqueue(EngineOp::ExecuteNode { execution: id });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runtime operations (each a unit of work)
    // -----------------------------------------------------------------------

    /// Start a new process instance of a deployed definition. Returns the
    /// root execution id (which is also the process id).
    pub async fn start_process(
        &mut self,
        definition_id: Uuid,
        business_key: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        self.run_batch(async move |engine| {
            let definition = engine.definition(definition_id)?;
            let start = definition.start_node.clone();
            if definition.find_node(&start).is_none() {
                return Err(ConsistencyError::UnknownNode(start).into());
            }

            let mut root = Execution::new_root(definition, business_key, variables);
            root.set_node(Some(start));
            let id = root.id();
            let key = root.business_key().map(String::from);

            engine.register_execution(root, None).await?;
            engine.notify(EngineEvent::ProcessStarted {
                process_id: id,
                definition_id,
                business_key: key,
            });
            engine.enqueue(EngineOp::ExecuteNode { execution: id });
            engine.drain().await?;
            Ok(id)
        })
        .await
    }

    /// Signal a waiting execution, merging the given variables into its
    /// local scope before it continues past its current node.
    pub async fn signal(
        &mut self,
        id: Uuid,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.run_batch(async move |engine| {
            engine.find(id).await?;

            let execution = engine.execution(id)?;
            if !execution.state().is_waiting() {
                return Err(ConsistencyError::NotWaiting(id).into());
            }
            let node = execution
                .node()
                .ok_or(ConsistencyError::NoCurrentNode(id))?
                .to_string();

            let execution = engine.execution_mut(id)?;
            for (name, value) in variables {
                execution.set_variable(name, value);
            }
            let state = execution.state().without(ExecutionState::WAITING);
            execution.set_state(state);

            engine.notify(EngineEvent::ActivityCompleted {
                execution_id: id,
                node: node.clone(),
            });
            behavior::continue_single(engine, id, &node)?;
            engine.drain().await
        })
        .await
    }

    /// Cancel an execution: notifies the canceled activity and removes the
    /// subtree at the next synchronization pass.
    pub async fn cancel_execution(&mut self, id: Uuid) -> Result<(), EngineError> {
        self.run_batch(async move |engine| {
            engine.find(id).await?;
            if let Some(node) = engine.execution(id)?.node().map(String::from) {
                engine.notify(EngineEvent::ActivityCanceled {
                    execution_id: id,
                    node,
                });
            }
            engine.terminate(id)
        })
        .await
    }

    /// Execute a business command inside its own unit of work.
    pub async fn execute_command<C>(&mut self, command: C) -> Result<C::Output, EngineError>
    where
        C: Command<S>,
    {
        self.run_batch(async move |engine| command.execute(engine).await)
            .await
    }
}
