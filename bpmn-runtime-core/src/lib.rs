//! Process-instance execution engine with session binding.
//!
//! Definitions compile into an immutable arena graph and an agenda-driven
//! state machine runs instances over it. [`session`]s own instances in
//! memory and commit them to an [`store::EntityStore`]. The binding
//! strategies in [`manager`] decide which session owns a context key, and
//! the [`context_mapper`] persists that ownership.

pub mod audit;
pub mod config;
pub mod context_mapper;
pub mod definition;
pub mod driver;
pub mod environment;
pub mod error;
pub mod events;
pub mod filter;
pub mod functions;
pub mod handler;
pub mod instance;
mod machine;
pub mod manager;
pub mod predicate;
pub mod registry;
pub mod session;
pub mod source;
pub mod store;
pub mod timer;
pub mod types;

pub use audit::{AuditSink, MemoryAuditSink, NoopAuditSink, TracingAuditSink};
pub use config::{EngineConfig, StrategyKind};
pub use context_mapper::{ContextMapper, ContextMapping};
pub use definition::{DefinitionDoc, ProcessBuilder, ProcessDefinition};
pub use driver::TimerDriver;
pub use environment::{RuntimeEnvironment, RuntimeEnvironmentBuilder};
pub use error::{EngineError, EngineResult, EntityKind, StateConflict, StoreError};
pub use events::AuditEvent;
pub use filter::EventFilter;
pub use functions::{ActionError, FunctionRegistry};
pub use handler::{WorkItemHandler, WorkItemHandlers, WorkItemOutcome};
pub use instance::{NodeInstance, ProcessInstance, WorkItem};
pub use manager::{
    PerProcessInstanceStrategy, PerRequestStrategy, RuntimeManager, SessionBindingStrategy,
    SingletonStrategy,
};
pub use predicate::{PredicateEvaluator, SimplePredicateEvaluator};
pub use registry::EventCorrelationRegistry;
pub use session::{BroadcastOutcome, ExecutionSession, SessionRecord};
pub use source::{DefinitionSource, InMemoryDefinitionSource};
pub use store::{EntityStore, MemoryStore};
pub use timer::{Clock, ManualClock, SystemClock, TimerService, TimerSpec};
pub use types::*;
