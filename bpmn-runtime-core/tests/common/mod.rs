#![allow(dead_code)]

use bpmn_runtime_core::{
    EngineConfig, InMemoryDefinitionSource, ManualClock, MemoryAuditSink, MemoryStore, ProcessDefinition,
    ProcessInstance, RuntimeEnvironment, RuntimeManager, StrategyKind, WorkItemHandlers,
};
use bpmn_runtime_core::store::EntityStore;
use bpmn_runtime_core::types::WorkItemId;
use std::sync::Arc;
use uuid::Uuid;

pub const T0: i64 = 1_700_000_000_000;

pub struct Harness {
    pub env: Arc<RuntimeEnvironment>,
    pub manager: RuntimeManager,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub definitions: Arc<InMemoryDefinitionSource>,
    pub handlers: Arc<WorkItemHandlers>,
    pub store: Arc<dyn EntityStore>,
}

impl Harness {
    pub async fn new(strategy: StrategyKind, definitions: Vec<ProcessDefinition>) -> Self {
        Self::with_store(strategy, definitions, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(
        strategy: StrategyKind,
        definitions: Vec<ProcessDefinition>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let audit = Arc::new(MemoryAuditSink::new());
        let source = Arc::new(InMemoryDefinitionSource::new());
        for def in definitions {
            source.deploy(def).unwrap();
        }
        let handlers = Arc::new(WorkItemHandlers::new());
        let env = RuntimeEnvironment::builder()
            .config(EngineConfig::with_strategy(strategy))
            .store(store.clone())
            .definitions(source.clone())
            .handlers(handlers.clone())
            .audit(audit.clone())
            .clock(clock.clone())
            .build();
        let manager = RuntimeManager::new(env.clone()).await.unwrap();
        Self {
            env,
            manager,
            clock,
            audit,
            definitions: source,
            handlers,
            store,
        }
    }

    pub async fn instance(&self, pi: Uuid) -> ProcessInstance {
        self.manager.process_instance(pi).await.unwrap()
    }

    /// Id of the pending work item at `node_id`.
    pub async fn work_item(&self, pi: Uuid, node_id: &str) -> WorkItemId {
        let inst = self.instance(pi).await;
        inst.work_items()
            .into_iter()
            .find(|w| inst.node(w.node_instance_id).is_some_and(|n| n.node_id == node_id))
            .map(|w| w.id)
            .unwrap_or_else(|| panic!("no pending work item at {node_id}"))
    }

    pub async fn active_nodes(&self, pi: Uuid) -> Vec<String> {
        let inst = self.instance(pi).await;
        let mut ids: Vec<String> = inst.node_instances.values().map(|n| n.node_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Advance the clock and deliver whatever became due.
    pub async fn advance(&self, ms: i64) -> usize {
        self.clock.advance(ms);
        self.manager.fire_due_timers().await
    }
}
