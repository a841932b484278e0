use crate::types::{ContextKey, NodeInstanceId, ProcessStatus, SessionId, WorkItemId};
use uuid::Uuid;

/// Entity family a store record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    ProcessInstance,
    Session,
    ContextMapping,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ProcessInstance => "process_instance",
            EntityKind::Session => "session",
            EntityKind::ContextMapping => "context_mapping",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by an `EntityStore` backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write precondition failed at commit (key exists, or version moved).
    #[error("write conflict on {kind} '{key}'")]
    Conflict { kind: EntityKind, key: String },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Binding or session-ownership invariant violations. Never retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum StateConflict {
    #[error("context {key} is already bound to session {existing}")]
    DuplicateBinding { key: ContextKey, existing: SessionId },

    #[error("context {key} maps to session {mapped}, but session {used} was used")]
    StaleSession {
        key: ContextKey,
        mapped: SessionId,
        used: SessionId,
    },

    #[error("session {session} is bound to {bound}, cannot operate on {requested}")]
    SessionKeyMismatch {
        session: SessionId,
        bound: ContextKey,
        requested: ContextKey,
    },

    #[error("session {0} has been disposed")]
    Disposed(SessionId),

    #[error("process instance {0} was modified by another session")]
    ConcurrentModification(Uuid),

    #[error("session {session} still owns {active} active process instance(s)")]
    SessionStillActive { session: SessionId, active: usize },

    #[error("process instance {process_instance_id} is not owned by session {session}")]
    NotOwned {
        session: SessionId,
        process_instance_id: Uuid,
    },
}

/// Engine error taxonomy surfaced to callers of bind/start/signal.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("definition error in '{process_id}'{}: {message}", node_suffix(.node_id))]
    Definition {
        process_id: String,
        node_id: Option<String>,
        message: String,
    },

    #[error(transparent)]
    StateConflict(#[from] StateConflict),

    #[error(
        "execution failure in process instance {process_instance_id}{}: [{code}] {message}",
        node_instance_suffix(.node_instance_id)
    )]
    ExecutionFailure {
        process_instance_id: Uuid,
        node_instance_id: Option<NodeInstanceId>,
        code: String,
        message: String,
    },

    #[error("no session found for context {key}")]
    SessionNotFound {
        key: ContextKey,
        session_id: Option<SessionId>,
    },

    #[error("process instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("process instance {process_instance_id} is {status:?}")]
    InstanceNotActive {
        process_instance_id: Uuid,
        status: ProcessStatus,
    },

    #[error("work item {work_item_id} not found in process instance {process_instance_id}")]
    WorkItemNotFound {
        process_instance_id: Uuid,
        work_item_id: WorkItemId,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn definition(process_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Definition {
            process_id: process_id.into(),
            node_id: None,
            message: message.into(),
        }
    }

    pub fn definition_at(
        process_id: impl Into<String>,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::Definition {
            process_id: process_id.into(),
            node_id: Some(node_id.into()),
            message: message.into(),
        }
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, EngineError::StateConflict(_))
    }
}

fn node_suffix(node_id: &Option<String>) -> String {
    node_id
        .as_ref()
        .map(|n| format!(" at node '{n}'"))
        .unwrap_or_default()
}

fn node_instance_suffix(id: &Option<NodeInstanceId>) -> String {
    id.map(|n| format!(" (node instance {n})"))
        .unwrap_or_default()
}

pub type EngineResult<T> = Result<T, EngineError>;
