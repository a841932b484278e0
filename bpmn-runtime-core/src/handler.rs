//! Activity executors. The engine only sees the outcome contract; what a
//! handler does with a work item is its own business.

use crate::instance::WorkItem;
use crate::types::Variables;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Debug, PartialEq)]
pub enum WorkItemOutcome {
    /// Completion arrives later through `complete_work_item`.
    Pending,
    Completed(Variables),
    Failed { code: String, message: String },
}

pub trait WorkItemHandler: Send + Sync {
    fn execute(&self, item: &WorkItem) -> WorkItemOutcome;

    /// Called when the owning node instance is cancelled.
    fn abort(&self, _item: &WorkItem) {}
}

/// Handler that completes immediately, echoing its parameters.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl WorkItemHandler for EchoHandler {
    fn execute(&self, item: &WorkItem) -> WorkItemOutcome {
        WorkItemOutcome::Completed(item.parameters.clone())
    }
}

/// Handler that always leaves the item pending.
#[derive(Debug, Default)]
pub struct ManualHandler;

impl WorkItemHandler for ManualHandler {
    fn execute(&self, _item: &WorkItem) -> WorkItemOutcome {
        WorkItemOutcome::Pending
    }
}

/// Work item handlers by name.
#[derive(Default)]
pub struct WorkItemHandlers {
    handlers: RwLock<HashMap<String, Arc<dyn WorkItemHandler>>>,
}

impl WorkItemHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn WorkItemHandler>) {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkItemHandler>> {
        let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }
}

impl std::fmt::Debug for WorkItemHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_list().entries(guard.keys()).finish()
    }
}
