use crate::filter::EventFilter;
use crate::timer::TimerSpec;
use crate::types::{
    ConnIdx, EventType, NodeIdx, NodeInstanceId, COMPENSATION_PREFIX, ERROR_PREFIX,
    ESCALATION_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Shared enums ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayDirection {
    Split,
    Join,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    Exclusive,
    Parallel,
    Inclusive,
}

/// Metadata values attached to a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Str(String),
}

/// Outgoing event a throw or end node raises.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrowEvent {
    Signal(String),
    Error(String),
    Escalation(String),
    /// `None` compensates the whole enclosing scope.
    Compensation(Option<String>),
}

impl ThrowEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            ThrowEvent::Signal(name) => EventType::Signal(name.clone()),
            ThrowEvent::Error(code) => EventType::Error(code.clone()),
            ThrowEvent::Escalation(code) => EventType::Escalation(code.clone()),
            ThrowEvent::Compensation(target) => EventType::Compensation(target.clone()),
        }
    }
}

/// Incoming event a start, catch or boundary node waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventTrigger {
    Signal(String),
    Message(String),
    Timer(TimerSpec),
    /// `None` catches every error code.
    Error(Option<String>),
    Escalation(Option<String>),
    Compensation,
}

impl EventTrigger {
    /// Subscription filter for this trigger. Timer filters are namespaced by
    /// the node instance that owns the timer, and `compensated` names the
    /// activity a compensation boundary undoes.
    pub fn filter(&self, owner: NodeInstanceId, compensated: Option<&str>) -> EventFilter {
        match self {
            EventTrigger::Signal(name) => EventFilter::exact(EventType::Signal(name.clone())),
            EventTrigger::Message(name) => EventFilter::exact(EventType::Message(name.clone())),
            EventTrigger::Timer(spec) => EventFilter::exact(EventType::timer(owner, spec.to_string())),
            EventTrigger::Error(Some(code)) => EventFilter::exact(EventType::Error(code.clone())),
            EventTrigger::Error(None) => EventFilter::broadcast(ERROR_PREFIX, None),
            EventTrigger::Escalation(Some(code)) => {
                EventFilter::exact(EventType::Escalation(code.clone()))
            }
            EventTrigger::Escalation(None) => EventFilter::broadcast(ESCALATION_PREFIX, None),
            EventTrigger::Compensation => {
                EventFilter::broadcast(COMPENSATION_PREFIX, compensated.map(str::to_string))
            }
        }
    }

    pub fn is_timer(&self) -> bool {
        matches!(self, EventTrigger::Timer(_))
    }

    pub fn is_compensation(&self) -> bool {
        matches!(self, EventTrigger::Compensation)
    }
}

/// Copies one variable into another scope, optionally through a named
/// transformation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMapping {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl DataMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, name: impl Into<String>) -> Self {
        self.transform = Some(name.into());
        self
    }
}

// ─── Node kinds ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct StartNode {
    pub trigger: Option<EventTrigger>,
    pub interrupting: bool,
    pub output_variable: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EndNode {
    pub terminate: bool,
    pub throw: Option<ThrowEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Delegated to the `WorkItemHandler` registered under `name`.
    WorkItem { name: String },
    /// Runs the named action from the function registry.
    Script { action: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivityNode {
    pub task: TaskKind,
    pub inputs: Vec<DataMapping>,
    pub outputs: Vec<DataMapping>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatchNode {
    pub trigger: EventTrigger,
    pub output_variable: Option<String>,
    /// Variable whose value correlates incoming messages.
    pub correlation_variable: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryNode {
    pub attached_to: NodeIdx,
    pub trigger: EventTrigger,
    pub cancel_activity: bool,
    pub output_variable: Option<String>,
    /// Compensation handler entered when this boundary is a compensation catch.
    pub handler: Option<NodeIdx>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallActivityNode {
    pub process_id: String,
    pub version: Option<String>,
    pub wait_for_completion: bool,
    pub independent: bool,
    pub inputs: Vec<DataMapping>,
    pub outputs: Vec<DataMapping>,
}

/// Closed set of node kinds, dispatched by the machine's behaviour table.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Start(StartNode),
    End(EndNode),
    Gateway {
        direction: GatewayDirection,
        gateway_type: GatewayType,
    },
    Activity(ActivityNode),
    Catch(CatchNode),
    Throw(ThrowEvent),
    Boundary(BoundaryNode),
    SubProcess,
    EventSubProcess,
    CallActivity(CallActivityNode),
}

impl NodeKind {
    /// Kinds that may carry boundary events.
    pub fn accepts_boundaries(&self) -> bool {
        matches!(
            self,
            NodeKind::Activity(_) | NodeKind::SubProcess | NodeKind::CallActivity(_)
        )
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, NodeKind::SubProcess | NodeKind::EventSubProcess)
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Start(_) => "start",
            NodeKind::End(_) => "end",
            NodeKind::Gateway { .. } => "gateway",
            NodeKind::Activity(_) => "activity",
            NodeKind::Catch(_) => "catch",
            NodeKind::Throw(_) => "throw",
            NodeKind::Boundary(_) => "boundary",
            NodeKind::SubProcess => "sub_process",
            NodeKind::EventSubProcess => "event_sub_process",
            NodeKind::CallActivity(_) => "call_activity",
        }
    }
}

// ─── Arena entries ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct NodeDefinition {
    pub idx: NodeIdx,
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Enclosing composite node, `None` at process level.
    pub container: Option<NodeIdx>,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl NodeDefinition {
    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        match self.metadata.get(key) {
            Some(MetaValue::Bool(b)) => Some(*b),
            Some(MetaValue::Str(s)) => s.parse().ok(),
            None => None,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(MetaValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub idx: ConnIdx,
    pub id: String,
    pub from: NodeIdx,
    pub from_port: String,
    pub to: NodeIdx,
    pub to_port: String,
    /// Predicate evaluated by splitting gateways.
    pub condition: Option<String>,
    pub is_default: bool,
}
