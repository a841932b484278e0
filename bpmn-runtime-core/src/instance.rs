//! Runtime state of a process instance. This is the unit the store persists
//! and the unit a session owns.

use crate::definition::ProcessDefinition;
use crate::registry::{EventCorrelationRegistry, SubscriptionScope};
use crate::timer::TimerRecord;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Where a node instance lives: the process itself, or a composite node
/// instance (sub-process, event sub-process).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Container {
    Process,
    Node(NodeInstanceId),
}

/// Link from a call-activity child back to the node waiting for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub process_instance_id: Uuid,
    pub node_instance_id: NodeInstanceId,
}

/// Work handed to a `WorkItemHandler`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub process_instance_id: Uuid,
    pub node_instance_id: NodeInstanceId,
    pub name: String,
    pub parameters: Variables,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeState {
    /// Transient; completes within the same step.
    Running,
    /// Suspended on a subscription (catch events).
    Waiting,
    WorkItem(WorkItem),
    /// Tokens that arrived per incoming connection and are not yet consumed.
    Join { arrivals: BTreeMap<ConnIdx, u32> },
    /// Sub-process or event sub-process; its children point at this instance.
    Composite,
    /// Waiting for a child process instance.
    CallActivity { child: Option<Uuid> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub node: NodeIdx,
    pub node_id: String,
    pub container: Container,
    pub status: NodeInstanceStatus,
    pub state: NodeState,
    pub entered_at: Timestamp,
}

/// Why an instance aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub code: String,
    pub message: String,
    pub node_instance_id: Option<NodeInstanceId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_id: String,
    pub process_version: String,
    /// Hex SHA-256 of the definition the instance was started on.
    #[serde(default)]
    pub definition_hash: String,
    pub status: ProcessStatus,
    pub variables: Variables,
    pub parent: Option<ParentLink>,
    /// Business correlation key the instance was started under.
    pub correlation_key: Option<String>,
    /// Active node instances only. Completed and cancelled instances are
    /// removed in the same step that finishes them.
    pub node_instances: BTreeMap<NodeInstanceId, NodeInstance>,
    pub subscriptions: EventCorrelationRegistry,
    pub timers: BTreeMap<TimerId, TimerRecord>,
    pub outcome: Option<Outcome>,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    next_node_instance: u64,
    next_timer: u64,
}

impl ProcessInstance {
    pub fn new(definition: &ProcessDefinition, variables: Variables, now: Timestamp) -> Self {
        let mut vars = definition.variables.clone();
        vars.extend(variables);
        Self {
            id: Uuid::now_v7(),
            process_id: definition.id.clone(),
            process_version: definition.version.clone(),
            definition_hash: definition.version_hash_hex(),
            status: ProcessStatus::Pending,
            variables: vars,
            parent: None,
            correlation_key: None,
            node_instances: BTreeMap::new(),
            subscriptions: EventCorrelationRegistry::new(SubscriptionScope::ProcessInstance),
            timers: BTreeMap::new(),
            outcome: None,
            created_at: now,
            ended_at: None,
            next_node_instance: 1,
            next_timer: 1,
        }
    }

    pub fn allocate_node_instance_id(&mut self) -> NodeInstanceId {
        let id = NodeInstanceId(self.next_node_instance);
        self.next_node_instance += 1;
        id
    }

    pub fn allocate_timer_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn node(&self, id: NodeInstanceId) -> Option<&NodeInstance> {
        self.node_instances.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeInstanceId) -> Option<&mut NodeInstance> {
        self.node_instances.get_mut(&id)
    }

    /// Node instances directly inside `container`.
    pub fn children_of(&self, container: Container) -> Vec<NodeInstanceId> {
        self.node_instances
            .values()
            .filter(|n| n.container == container)
            .map(|n| n.id)
            .collect()
    }

    /// All live descendants of `id`, deepest first.
    pub fn descendants_of(&self, id: NodeInstanceId) -> Vec<NodeInstanceId> {
        let mut out = Vec::new();
        for child in self.children_of(Container::Node(id)) {
            out.extend(self.descendants_of(child));
            out.push(child);
        }
        out
    }

    /// Active node instances of one definition node within one container.
    pub fn instances_of(&self, node: NodeIdx, container: Container) -> Vec<NodeInstanceId> {
        self.node_instances
            .values()
            .filter(|n| n.node == node && n.container == container)
            .map(|n| n.id)
            .collect()
    }

    pub fn work_item(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.node_instances.values().find_map(|n| match &n.state {
            NodeState::WorkItem(item) if item.id == id => Some(item),
            _ => None,
        })
    }

    pub fn work_items(&self) -> Vec<&WorkItem> {
        self.node_instances
            .values()
            .filter_map(|n| match &n.state {
                NodeState::WorkItem(item) => Some(item),
                _ => None,
            })
            .collect()
    }

    /// Child process instances still linked to this instance.
    pub fn linked_children(&self) -> Vec<(NodeInstanceId, Uuid)> {
        self.node_instances
            .values()
            .filter_map(|n| match n.state {
                NodeState::CallActivity { child: Some(c) } => Some((n.id, c)),
                _ => None,
            })
            .collect()
    }

    pub fn timers_owned_by(&self, owner: NodeInstanceId) -> Vec<TimerId> {
        self.timers
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.id)
            .collect()
    }
}
