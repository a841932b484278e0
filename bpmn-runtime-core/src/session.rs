//! Execution sessions: the in-memory owners of process instances.
//!
//! A session is single-writer. Every operation takes the session lock, loads
//! the instances it touches (and their call-activity family) from the store,
//! drives the state machine, and commits every touched instance together
//! with mapping and session-record changes in one store transaction. A
//! failed commit restores the in-memory state to what it was before the
//! operation.

use crate::config::StrategyKind;
use crate::definition::ProcessDefinition;
use crate::environment::RuntimeEnvironment;
use crate::error::{EngineError, EngineResult, EntityKind, StateConflict, StoreError};
use crate::instance::ProcessInstance;
use crate::machine::{Machine, MachineReport};
use crate::registry::{EventCorrelationRegistry, Holder, SubscriptionScope, SubscriptionTarget};
use crate::store::{find_as, save_as, Precondition, StoreTransaction};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

// ─── Persisted record ─────────────────────────────────────────

/// What is needed to rebuild a session after its in-memory form is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub strategy: StrategyKind,
    pub key: ContextKey,
    pub process_instances: BTreeSet<Uuid>,
    pub created_at: Timestamp,
}

pub(crate) fn session_record_key(deployment_id: &str, id: SessionId) -> String {
    format!("{deployment_id}/{id}")
}

/// Outcome of a broadcast signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Instances started by definition-level start triggers.
    pub started: Vec<Uuid>,
    /// Subscriptions of existing instances that reacted.
    pub delivered: usize,
}

// ─── Start triggers ───────────────────────────────────────────

/// Definition-level start subscriptions (external scope), rebuilt when the
/// definition source changes.
#[derive(Debug)]
pub struct StartTriggers {
    revision: Option<u64>,
    registry: EventCorrelationRegistry,
}

impl Default for StartTriggers {
    fn default() -> Self {
        Self {
            revision: None,
            registry: EventCorrelationRegistry::new(SubscriptionScope::External),
        }
    }
}

impl StartTriggers {
    fn refresh(&mut self, env: &RuntimeEnvironment) {
        let revision = env.definitions.revision();
        if self.revision == Some(revision) {
            return;
        }
        self.registry.clear();
        for def in env.definitions.all() {
            for (node, start) in def.triggered_starts() {
                if let Some(trigger) = &start.trigger {
                    self.registry.subscribe(
                        Holder::Definition(def.id.clone()),
                        trigger.filter(NodeInstanceId(0), None),
                        None,
                        SubscriptionTarget::Start {
                            process_id: def.id.clone(),
                            node: node.idx,
                        },
                    );
                }
            }
        }
        self.revision = Some(revision);
        tracing::debug!(revision, triggers = self.registry.len(), "Session: start triggers rebuilt");
    }

    /// `(process_id, start node)` pairs listening for `event`, in
    /// registration order.
    pub fn matching(&mut self, env: &RuntimeEnvironment, event: &EventType) -> Vec<(String, NodeIdx)> {
        self.refresh(env);
        self.registry
            .matching(event, None)
            .into_iter()
            .filter_map(|s| match s.target {
                SubscriptionTarget::Start { process_id, node } => Some((process_id, node)),
                _ => None,
            })
            .collect()
    }
}

// ─── Session ──────────────────────────────────────────────────

#[derive(Debug)]
struct Binding {
    key: ContextKey,
    /// Live instances this session owns (per-process-instance sessions).
    owned: BTreeSet<Uuid>,
}

#[derive(Default)]
struct SessionState {
    instances: BTreeMap<Uuid, ProcessInstance>,
    /// Store version each loaded instance was read or last written at.
    versions: BTreeMap<Uuid, u64>,
    start_triggers: StartTriggers,
}

pub struct ExecutionSession {
    id: SessionId,
    strategy: StrategyKind,
    env: Arc<RuntimeEnvironment>,
    binding: RwLock<Binding>,
    state: Mutex<SessionState>,
    disposed: AtomicBool,
    released: AtomicBool,
    created_at: Timestamp,
}

impl ExecutionSession {
    pub fn new(env: Arc<RuntimeEnvironment>, strategy: StrategyKind, key: ContextKey) -> Self {
        let created_at = env.now();
        Self {
            id: SessionId::new(),
            strategy,
            env,
            binding: RwLock::new(Binding {
                key,
                owned: BTreeSet::new(),
            }),
            state: Mutex::new(SessionState::default()),
            disposed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            created_at,
        }
    }

    /// Rebuild a session from its persisted record. Instances are loaded
    /// lazily, so their node instances, subscriptions and timers come back
    /// exactly as last committed.
    pub fn restore(env: Arc<RuntimeEnvironment>, record: SessionRecord) -> Self {
        tracing::info!(session_id = %record.id, key = %record.key, instances = record.process_instances.len(), "Session: restored from record");
        Self {
            id: record.id,
            strategy: record.strategy,
            env,
            binding: RwLock::new(Binding {
                key: record.key,
                owned: record.process_instances,
            }),
            state: Mutex::new(SessionState::default()),
            disposed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            created_at: record.created_at,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn key(&self) -> ContextKey {
        self.binding.read().unwrap_or_else(|e| e.into_inner()).key.clone()
    }

    pub fn owned_instances(&self) -> BTreeSet<Uuid> {
        self.binding.read().unwrap_or_else(|e| e.into_inner()).owned.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// True once every owned instance has finished and the session's
    /// mappings were removed with the final commit.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> SessionRecord {
        let binding = self.binding.read().unwrap_or_else(|e| e.into_inner());
        SessionRecord {
            id: self.id,
            strategy: self.strategy,
            key: binding.key.clone(),
            process_instances: binding.owned.clone(),
            created_at: self.created_at,
        }
    }

    /// Reject use of a disposed session, or of a session for a key it is
    /// not bound to.
    pub fn check_key(&self, key: &ContextKey) -> EngineResult<()> {
        if self.is_disposed() {
            return Err(StateConflict::Disposed(self.id).into());
        }
        if self.strategy != StrategyKind::PerProcessInstance {
            return Ok(());
        }
        let binding = self.binding.read().unwrap_or_else(|e| e.into_inner());
        let accepted = match key {
            k if *k == binding.key => true,
            ContextKey::ProcessInstance(pi) => binding.owned.contains(pi),
            ContextKey::Empty | ContextKey::Correlation(_) => false,
        };
        if accepted {
            Ok(())
        } else {
            Err(StateConflict::SessionKeyMismatch {
                session: self.id,
                bound: binding.key.clone(),
                requested: key.clone(),
            }
            .into())
        }
    }

    /// Release in-memory state. Persisted state is untouched.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.instances.clear();
        state.versions.clear();
        tracing::info!(session_id = %self.id, "Session: disposed");
    }

    /// Store the session record and, for a non-empty key, the key's mapping,
    /// in one transaction.
    pub(crate) async fn persist_binding(&self) -> EngineResult<()> {
        let key = self.key();
        let mut tx = self.env.store.begin().await?;
        if !key.is_empty() || self.strategy == StrategyKind::Singleton {
            self.env
                .mapper
                .save_in(tx.as_mut(), &key, self.id, key_instance(&key), self.env.now())
                .await?;
        }
        self.save_record(tx.as_mut()).await?;
        match tx.commit().await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict {
                kind: EntityKind::ContextMapping,
                ..
            }) => Err(self.env.mapper.duplicate(&key, self.id).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the session record and every mapping pointing at this
    /// session, then drop in-memory state.
    pub(crate) async fn destroy(&self) -> EngineResult<()> {
        let mut tx = self.env.store.begin().await?;
        for mapping in self.env.mapper.mappings_for_session_in(tx.as_mut(), self.id).await? {
            self.env.mapper.remove_in(tx.as_mut(), &mapping.key).await?;
        }
        tx.delete(
            EntityKind::Session,
            &session_record_key(self.env.deployment_id(), self.id),
        )
        .await?;
        tx.commit().await?;
        self.dispose().await;
        tracing::info!(session_id = %self.id, "Session: destroyed");
        Ok(())
    }

    async fn save_record(&self, tx: &mut dyn StoreTransaction) -> EngineResult<()> {
        self.write_record(tx, &self.record()).await
    }

    async fn write_record(&self, tx: &mut dyn StoreTransaction, record: &SessionRecord) -> EngineResult<()> {
        save_as(
            tx,
            EntityKind::Session,
            &session_record_key(self.env.deployment_id(), self.id),
            record,
            Precondition::Any,
        )
        .await?;
        Ok(())
    }

    fn ensure_usable(&self) -> EngineResult<()> {
        if self.is_disposed() {
            return Err(StateConflict::Disposed(self.id).into());
        }
        Ok(())
    }

    // ── Operations ──

    pub async fn start_process(&self, process_id: &str, variables: Variables) -> EngineResult<Uuid> {
        self.start(process_id, None, variables).await
    }

    pub async fn start_process_correlated(
        &self,
        process_id: &str,
        correlation_key: &str,
        variables: Variables,
    ) -> EngineResult<Uuid> {
        self.start(process_id, Some(correlation_key.to_string()), variables)
            .await
    }

    async fn start(
        &self,
        process_id: &str,
        correlation_key: Option<String>,
        variables: Variables,
    ) -> EngineResult<Uuid> {
        let definition = self
            .env
            .definitions
            .get(process_id, None)
            .ok_or_else(|| EngineError::definition(process_id, "process is not deployed"))?;
        self.run(&[], true, move |m| m.start(definition, variables, correlation_key, None))
            .await
    }

    /// Start one instance through a triggered start node.
    pub async fn start_triggered(
        &self,
        definition: Arc<ProcessDefinition>,
        node: NodeIdx,
        payload: Option<Value>,
        correlation_key: Option<String>,
    ) -> EngineResult<Uuid> {
        self.run(&[], true, move |m| {
            m.start(definition, Variables::new(), correlation_key, Some((node, payload)))
        })
        .await
    }

    pub async fn signal_instance(
        &self,
        pi: Uuid,
        event: EventType,
        payload: Option<Value>,
        correlation: Option<String>,
    ) -> EngineResult<usize> {
        self.run(&[pi], false, move |m| {
            m.deliver(pi, event, payload, correlation.as_deref())
        })
        .await
    }

    /// Start every definition whose start trigger matches `event`, then
    /// deliver it to every live instance this session covers.
    pub async fn broadcast(
        &self,
        event: EventType,
        payload: Option<Value>,
        correlation: Option<String>,
    ) -> EngineResult<BroadcastOutcome> {
        self.ensure_usable()?;
        let starts = self.matching_starts(&event).await?;
        let targets = self.broadcast_targets().await?;
        let load = targets.clone();

        self.run(&load, true, move |m| {
            let mut outcome = BroadcastOutcome::default();
            for (definition, node) in starts {
                let pi = m.start(
                    definition,
                    Variables::new(),
                    correlation.clone(),
                    Some((node, payload.clone())),
                )?;
                outcome.started.push(pi);
            }
            for pi in targets {
                if m.is_active(pi) {
                    outcome.delivered +=
                        m.deliver(pi, event.clone(), payload.clone(), correlation.as_deref())?;
                }
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn complete_work_item(
        &self,
        pi: Uuid,
        work_item_id: WorkItemId,
        results: Variables,
    ) -> EngineResult<()> {
        self.run(&[pi], false, move |m| m.complete_work_item(pi, work_item_id, results))
            .await
    }

    pub async fn fail_work_item(
        &self,
        pi: Uuid,
        work_item_id: WorkItemId,
        code: &str,
        message: &str,
    ) -> EngineResult<()> {
        let (code, message) = (code.to_string(), message.to_string());
        self.run(&[pi], false, move |m| m.fail_work_item(pi, work_item_id, code, message))
            .await
    }

    pub async fn abort_process(&self, pi: Uuid) -> EngineResult<()> {
        self.run(&[pi], false, move |m| m.abort(pi)).await
    }

    pub async fn fire_timer(&self, pi: Uuid, timer_id: TimerId) -> EngineResult<bool> {
        self.run(&[pi], false, move |m| m.fire_timer(pi, timer_id))
            .await
    }

    /// Current state of an instance, from memory or the store.
    pub async fn process_instance(&self, pi: Uuid) -> EngineResult<ProcessInstance> {
        self.ensure_usable()?;
        let mut state = self.state.lock().await;
        if let Some(inst) = state.instances.get(&pi) {
            return Ok(inst.clone());
        }
        self.load_family(&mut state, pi).await?;
        state
            .instances
            .get(&pi)
            .cloned()
            .ok_or(EngineError::InstanceNotFound(pi))
    }

    /// Ids of live instances currently held in memory.
    pub async fn loaded_instances(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .instances
            .values()
            .filter(|i| !i.is_terminal())
            .map(|i| i.id)
            .collect()
    }

    // ── Operation plumbing ──

    /// Deployed definitions whose start trigger accepts `event`.
    pub async fn matching_starts(
        &self,
        event: &EventType,
    ) -> EngineResult<Vec<(Arc<ProcessDefinition>, NodeIdx)>> {
        let mut state = self.state.lock().await;
        let pairs = state.start_triggers.matching(&self.env, event);
        Ok(pairs
            .into_iter()
            .filter_map(|(process_id, node)| {
                self.env
                    .definitions
                    .get(&process_id, None)
                    .map(|def| (def, node))
            })
            .collect())
    }

    async fn broadcast_targets(&self) -> EngineResult<Vec<Uuid>> {
        if self.strategy == StrategyKind::PerProcessInstance {
            return Ok(self.owned_instances().into_iter().collect());
        }
        let mut targets: BTreeSet<Uuid> = live_instance_ids(&self.env).await?.into_iter().collect();
        targets.extend(self.loaded_instances().await);
        Ok(targets.into_iter().collect())
    }

    async fn run<T, F>(&self, targets: &[Uuid], starting: bool, op: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Machine<'_>) -> EngineResult<T> + Send,
        T: Send,
    {
        self.ensure_usable()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut load: Vec<Uuid> = targets.to_vec();
        if self.strategy == StrategyKind::PerProcessInstance {
            load.extend(self.owned_instances());
        }
        for pi in load {
            self.load_family(state, pi).await?;
        }

        let (result, mut report) = {
            let mut machine = Machine::new(&self.env, &mut state.instances);
            let result = op(&mut machine);
            (result, machine.finish())
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.rollback(state, &mut report);
                return Err(e);
            }
        };
        if starting && matches!(report.failure, Some(EngineError::Definition { .. })) {
            // A definition that cannot run never produces an instance.
            self.rollback(state, &mut report);
            return Err(report
                .failure
                .take()
                .unwrap_or_else(|| EngineError::definition("", "definition error")));
        }

        if let Err(e) = self.commit(state, &report).await {
            tracing::error!(session_id = %self.id, error = %e, "Session: commit failed, rolling back");
            let touched: Vec<Uuid> = report.pre_images.keys().copied().collect();
            self.rollback(state, &mut report);
            if matches!(e, EngineError::StateConflict(StateConflict::ConcurrentModification(_))) {
                // Drop stale copies so the next operation reloads them.
                for pi in touched {
                    state.instances.remove(&pi);
                    state.versions.remove(&pi);
                }
            }
            return Err(e);
        }
        self.after_commit(state, &report).await;

        match report.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(value),
        }
    }

    /// Load `root` and every instance linked to it (parent chain and
    /// waiting call-activity children) that is not already in memory.
    async fn load_family(&self, state: &mut SessionState, root: Uuid) -> EngineResult<()> {
        let mut tx: Option<Box<dyn StoreTransaction>> = None;
        let mut queue = vec![root];
        let mut seen = BTreeSet::new();
        while let Some(pi) = queue.pop() {
            if !seen.insert(pi) {
                continue;
            }
            if !state.instances.contains_key(&pi) {
                if tx.is_none() {
                    tx = Some(self.env.store.begin().await?);
                }
                let Some(reader) = tx.as_mut() else {
                    continue;
                };
                let found =
                    find_as::<ProcessInstance>(reader.as_mut(), EntityKind::ProcessInstance, &pi.to_string())
                        .await?;
                match found {
                    Some((inst, version)) => {
                        tracing::debug!(session_id = %self.id, process_instance_id = %pi, version, "Session: instance loaded");
                        state.versions.insert(pi, version);
                        state.instances.insert(pi, inst);
                    }
                    None if pi == root => return Err(EngineError::InstanceNotFound(pi)),
                    None => continue,
                }
            }
            if let Some(inst) = state.instances.get(&pi) {
                if let Some(parent) = inst.parent {
                    queue.push(parent.process_instance_id);
                }
                queue.extend(inst.linked_children().into_iter().map(|(_, child)| child));
            }
        }
        Ok(())
    }

    fn rollback(&self, state: &mut SessionState, report: &mut MachineReport) {
        for (pi, pre) in std::mem::take(&mut report.pre_images) {
            match pre {
                Some(inst) => {
                    self.env.timers.sync_instance(pi, inst.timers.values());
                    state.instances.insert(pi, inst);
                }
                None => {
                    state.instances.remove(&pi);
                    state.versions.remove(&pi);
                }
            }
        }
    }

    async fn commit(&self, state: &mut SessionState, report: &MachineReport) -> EngineResult<()> {
        let now = self.env.now();
        let mut tx = self.env.store.begin().await?;
        let mut written = Vec::new();

        for pi in report.pre_images.keys() {
            let Some(inst) = state.instances.get(pi) else {
                continue;
            };
            let precondition = match state.versions.get(pi) {
                Some(version) => Precondition::Version(*version),
                None => Precondition::Absent,
            };
            save_as(tx.as_mut(), EntityKind::ProcessInstance, &pi.to_string(), inst, precondition)
                .await
                .map_err(conflict_as_modification)?;
            written.push(*pi);
        }

        let mut release = false;
        let mut owned = None;
        if self.strategy == StrategyKind::PerProcessInstance {
            let key = self.key();
            for pi in &report.started {
                self.env
                    .mapper
                    .save_in(tx.as_mut(), &ContextKey::ProcessInstance(*pi), self.id, Some(*pi), now)
                    .await?;
            }
            if let (ContextKey::Correlation(_), Some(root)) = (&key, report.started.first()) {
                self.env
                    .mapper
                    .save_in(tx.as_mut(), &key, self.id, Some(*root), now)
                    .await?;
            }

            let live: BTreeSet<Uuid> = {
                let binding = self.binding.read().unwrap_or_else(|e| e.into_inner());
                binding
                    .owned
                    .iter()
                    .chain(report.started.iter())
                    .copied()
                    .filter(|pi| state.instances.get(pi).is_some_and(|i| !i.is_terminal()))
                    .collect()
            };
            release = live.is_empty() && !report.finished.is_empty();

            if release {
                for mapping in self.env.mapper.mappings_for_session_in(tx.as_mut(), self.id).await? {
                    self.env.mapper.remove_in(tx.as_mut(), &mapping.key).await?;
                }
                tx.delete(
                    EntityKind::Session,
                    &session_record_key(self.env.deployment_id(), self.id),
                )
                .await?;
            } else if !report.started.is_empty() || !report.finished.is_empty() {
                // Finished instances are read through unmapped sessions.
                for pi in &report.finished {
                    self.env
                        .mapper
                        .remove_in(tx.as_mut(), &ContextKey::ProcessInstance(*pi))
                        .await?;
                }
                let mut record = self.record();
                record.process_instances = live.clone();
                self.write_record(tx.as_mut(), &record).await?;
            }
            owned = Some(live);
        }

        tx.commit().await.map_err(conflict_as_modification)?;

        // Ownership changes only once the store has them.
        if let Some(live) = owned {
            self.binding.write().unwrap_or_else(|e| e.into_inner()).owned = live;
        }

        for pi in written {
            let next = state.versions.get(&pi).map_or(1, |v| v + 1);
            state.versions.insert(pi, next);
        }
        if release {
            self.released.store(true, Ordering::SeqCst);
            tracing::info!(session_id = %self.id, "Session: all instances finished, mappings released");
        }
        Ok(())
    }

    async fn after_commit(&self, state: &mut SessionState, report: &MachineReport) {
        for pi in report.pre_images.keys() {
            match state.instances.get(pi) {
                Some(inst) if !inst.is_terminal() => {
                    self.env.timers.sync_instance(*pi, inst.timers.values());
                }
                _ => {
                    self.env.timers.remove_instance(*pi);
                    state.instances.remove(pi);
                    state.versions.remove(pi);
                }
            }
        }
        if report.events.is_empty() {
            return;
        }
        if let Err(e) = self.env.audit.record(&report.events).await {
            tracing::warn!(session_id = %self.id, error = %e, "Session: audit sink failed");
        }
    }
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("key", &self.key())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn key_instance(key: &ContextKey) -> Option<Uuid> {
    match key {
        ContextKey::ProcessInstance(pi) => Some(*pi),
        _ => None,
    }
}

fn conflict_as_modification(e: StoreError) -> EngineError {
    match e {
        StoreError::Conflict {
            kind: EntityKind::ProcessInstance,
            key,
        } => match key.parse::<Uuid>() {
            Ok(pi) => StateConflict::ConcurrentModification(pi).into(),
            Err(_) => StateConflict::ConcurrentModification(Uuid::nil()).into(),
        },
        other => other.into(),
    }
}

pub(crate) async fn load_record(
    env: &RuntimeEnvironment,
    id: SessionId,
) -> EngineResult<Option<SessionRecord>> {
    let mut tx = env.store.begin().await?;
    let found = find_as::<SessionRecord>(
        tx.as_mut(),
        EntityKind::Session,
        &session_record_key(env.deployment_id(), id),
    )
    .await?;
    Ok(found.map(|(record, _)| record))
}

/// Ids of every persisted instance that has not finished.
pub(crate) async fn live_instance_ids(env: &RuntimeEnvironment) -> EngineResult<Vec<Uuid>> {
    Ok(live_instances(env).await?.into_iter().map(|i| i.id).collect())
}

pub(crate) async fn live_instances(env: &RuntimeEnvironment) -> EngineResult<Vec<ProcessInstance>> {
    let mut tx = env.store.begin().await?;
    let mut out = Vec::new();
    for (_, entity) in tx.scan(EntityKind::ProcessInstance).await? {
        let inst: ProcessInstance = serde_json::from_value(entity.body).map_err(StoreError::from)?;
        if !inst.is_terminal() {
            out.push(inst);
        }
    }
    Ok(out)
}
