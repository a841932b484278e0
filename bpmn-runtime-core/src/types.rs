use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Index of a node inside a compiled definition arena.
pub type NodeIdx = u32;

/// Index of a connection inside a compiled definition arena.
pub type ConnIdx = u32;

/// Process variables. Values are dynamically typed.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Port used when a node does not name one.
pub const DEFAULT_PORT: &str = "default";

// ─── Identifiers ──────────────────────────────────────────────

/// Node instance id. Unique within its process instance, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeInstanceId(pub u64);

impl fmt::Display for NodeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timer id. Unique within its process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item id. Equal to the node instance id of the activity that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub u64);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<NodeInstanceId> for WorkItemId {
    fn from(id: NodeInstanceId) -> Self {
        WorkItemId(id.0)
    }
}

/// Execution session id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Context keys ─────────────────────────────────────────────

/// Logical correlation key a caller binds an execution session with.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContextKey {
    /// No context: "give me a session to start something new".
    Empty,
    ProcessInstance(Uuid),
    /// Business correlation key chosen by the caller.
    Correlation(String),
}

impl ContextKey {
    pub fn is_empty(&self) -> bool {
        matches!(self, ContextKey::Empty)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Empty => write!(f, "empty"),
            ContextKey::ProcessInstance(id) => write!(f, "pi:{id}"),
            ContextKey::Correlation(key) => write!(f, "corr:{key}"),
        }
    }
}

impl From<Uuid> for ContextKey {
    fn from(id: Uuid) -> Self {
        ContextKey::ProcessInstance(id)
    }
}

// ─── Event types ──────────────────────────────────────────────

/// A structured inbound event type.
///
/// The string forms (`"Timer-<owner>-<spec>"`, `"Error-<code>"`, ...) are
/// produced by `Display` and accepted by `FromStr`; matching never looks at
/// them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Signal(String),
    Message(String),
    Timer { owner: NodeInstanceId, spec: String },
    Error(String),
    Escalation(String),
    /// `None` compensates every handler registered in the scope.
    Compensation(Option<String>),
}

pub const SIGNAL_PREFIX: &str = "Signal";
pub const MESSAGE_PREFIX: &str = "Message";
pub const TIMER_PREFIX: &str = "Timer";
pub const ERROR_PREFIX: &str = "Error";
pub const ESCALATION_PREFIX: &str = "Escalation";
pub const COMPENSATION_PREFIX: &str = "Compensation";

impl EventType {
    pub fn signal(name: impl Into<String>) -> Self {
        EventType::Signal(name.into())
    }

    pub fn message(name: impl Into<String>) -> Self {
        EventType::Message(name.into())
    }

    pub fn error(code: impl Into<String>) -> Self {
        EventType::Error(code.into())
    }

    pub fn escalation(code: impl Into<String>) -> Self {
        EventType::Escalation(code.into())
    }

    pub fn timer(owner: NodeInstanceId, spec: impl Into<String>) -> Self {
        EventType::Timer {
            owner,
            spec: spec.into(),
        }
    }

    /// Fixed part of the type used by broadcast filters.
    pub fn prefix(&self) -> &'static str {
        match self {
            EventType::Signal(_) => SIGNAL_PREFIX,
            EventType::Message(_) => MESSAGE_PREFIX,
            EventType::Timer { .. } => TIMER_PREFIX,
            EventType::Error(_) => ERROR_PREFIX,
            EventType::Escalation(_) => ESCALATION_PREFIX,
            EventType::Compensation(_) => COMPENSATION_PREFIX,
        }
    }

    /// Variable part of the type. Timers have a composite suffix.
    pub fn suffix(&self) -> Option<String> {
        match self {
            EventType::Signal(s)
            | EventType::Message(s)
            | EventType::Error(s)
            | EventType::Escalation(s) => Some(s.clone()),
            EventType::Timer { owner, spec } => Some(format!("{owner}-{spec}")),
            EventType::Compensation(s) => s.clone(),
        }
    }

    /// True for a throw that targets every subscriber of its prefix.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, EventType::Compensation(None))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EventType::Error(_))
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, EventType::Escalation(_))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Signal(name) => write!(f, "{name}"),
            EventType::Message(name) => write!(f, "Message-{name}"),
            EventType::Timer { owner, spec } => write!(f, "Timer-{owner}-{spec}"),
            EventType::Error(code) => write!(f, "Error-{code}"),
            EventType::Escalation(code) => write!(f, "Escalation-{code}"),
            EventType::Compensation(Some(target)) => write!(f, "Compensation-{target}"),
            EventType::Compensation(None) => write!(f, "Compensation-"),
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("Timer-") {
            // Owner ids are numeric, so the first '-' ends the owner even when
            // the spec itself contains dashes (dates).
            let (owner, spec) = rest
                .split_once('-')
                .ok_or_else(|| format!("malformed timer event type: {s}"))?;
            let owner: u64 = owner
                .parse()
                .map_err(|_| format!("malformed timer owner in event type: {s}"))?;
            if spec.is_empty() {
                return Err(format!("timer event type without spec: {s}"));
            }
            return Ok(EventType::timer(NodeInstanceId(owner), spec));
        }
        if let Some(code) = s.strip_prefix("Error-") {
            return Ok(EventType::Error(code.to_string()));
        }
        if let Some(code) = s.strip_prefix("Escalation-") {
            return Ok(EventType::Escalation(code.to_string()));
        }
        if let Some(name) = s.strip_prefix("Message-") {
            return Ok(EventType::Message(name.to_string()));
        }
        if let Some(target) = s.strip_prefix("Compensation-") {
            let target = (!target.is_empty()).then(|| target.to_string());
            return Ok(EventType::Compensation(target));
        }
        if s.is_empty() {
            return Err("empty event type".to_string());
        }
        Ok(EventType::Signal(s.to_string()))
    }
}

// ─── Statuses ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Pending,
    Active,
    Completed,
    Aborted,
}

impl ProcessStatus {
    /// Returns true if no further signal can reach the instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Completed | ProcessStatus::Aborted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInstanceStatus {
    Active,
    Completed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_event_type_survives_dashes_in_spec() {
        let ev = EventType::timer(NodeInstanceId(42), "2026-10-14T10:00:00+00:00");
        let text = ev.to_string();
        assert_eq!(text, "Timer-42-2026-10-14T10:00:00+00:00");
        assert_eq!(text.parse::<EventType>().unwrap(), ev);
    }

    #[test]
    fn compensation_without_target_is_broadcast() {
        let ev: EventType = "Compensation-".parse().unwrap();
        assert_eq!(ev, EventType::Compensation(None));
        assert!(ev.is_broadcast());
        assert_eq!(ev.suffix(), None);
    }

    #[test]
    fn plain_names_are_signals() {
        assert_eq!(
            "order-cancelled".parse::<EventType>().unwrap(),
            EventType::signal("order-cancelled")
        );
        assert_eq!(
            "Error-E1".parse::<EventType>().unwrap(),
            EventType::error("E1")
        );
        assert!("Timer-x-PT5S".parse::<EventType>().is_err());
    }

    #[test]
    fn context_key_display() {
        let id = Uuid::now_v7();
        assert_eq!(ContextKey::ProcessInstance(id).to_string(), format!("pi:{id}"));
        assert_eq!(ContextKey::Correlation("a".into()).to_string(), "corr:a");
        assert_eq!(ContextKey::Empty.to_string(), "empty");
    }
}
