//! Collaborators shared by every session of a deployment.

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::context_mapper::ContextMapper;
use crate::functions::FunctionRegistry;
use crate::handler::WorkItemHandlers;
use crate::predicate::{PredicateEvaluator, SimplePredicateEvaluator};
use crate::source::{DefinitionSource, InMemoryDefinitionSource};
use crate::store::{EntityStore, MemoryStore};
use crate::timer::{Clock, SystemClock, TimerService};
use crate::types::Timestamp;
use std::sync::Arc;

pub struct RuntimeEnvironment {
    pub config: EngineConfig,
    pub store: Arc<dyn EntityStore>,
    pub definitions: Arc<dyn DefinitionSource>,
    pub handlers: Arc<WorkItemHandlers>,
    pub functions: Arc<FunctionRegistry>,
    pub predicates: Arc<dyn PredicateEvaluator>,
    pub audit: Arc<dyn AuditSink>,
    pub timers: Arc<TimerService>,
    pub clock: Arc<dyn Clock>,
    pub mapper: ContextMapper,
}

impl RuntimeEnvironment {
    pub fn builder() -> RuntimeEnvironmentBuilder {
        RuntimeEnvironmentBuilder::default()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }

    pub fn deployment_id(&self) -> &str {
        &self.config.deployment_id
    }
}

impl std::fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEnvironment")
            .field("config", &self.config)
            .field("pending_timers", &self.timers.pending())
            .finish()
    }
}

#[derive(Default)]
pub struct RuntimeEnvironmentBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn EntityStore>>,
    definitions: Option<Arc<dyn DefinitionSource>>,
    handlers: Option<Arc<WorkItemHandlers>>,
    functions: Option<Arc<FunctionRegistry>>,
    predicates: Option<Arc<dyn PredicateEvaluator>>,
    audit: Option<Arc<dyn AuditSink>>,
    timers: Option<Arc<TimerService>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RuntimeEnvironmentBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn definitions(mut self, definitions: Arc<dyn DefinitionSource>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn handlers(mut self, handlers: Arc<WorkItemHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn predicates(mut self, predicates: Arc<dyn PredicateEvaluator>) -> Self {
        self.predicates = Some(predicates);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn timers(mut self, timers: Arc<TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Unset collaborators fall back to in-memory and tracing defaults.
    pub fn build(self) -> Arc<RuntimeEnvironment> {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let mapper = ContextMapper::new(store.clone(), config.deployment_id.clone());
        Arc::new(RuntimeEnvironment {
            store,
            definitions: self
                .definitions
                .unwrap_or_else(|| Arc::new(InMemoryDefinitionSource::new())),
            handlers: self.handlers.unwrap_or_default(),
            functions: self
                .functions
                .unwrap_or_else(|| Arc::new(FunctionRegistry::with_builtins())),
            predicates: self
                .predicates
                .unwrap_or_else(|| Arc::new(SimplePredicateEvaluator)),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            timers: self.timers.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            mapper,
            config,
        })
    }
}
