use crate::types::EventType;
use serde::{Deserialize, Serialize};

/// What a subscription listens for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    /// Matches one structured event type only.
    Exact(EventType),
    /// Matches a whole prefix family. A `None` suffix accepts every member;
    /// a `Some` suffix accepts its own member plus broadcast throws.
    Broadcast {
        prefix: String,
        suffix: Option<String>,
    },
}

impl EventFilter {
    pub fn exact(event: EventType) -> Self {
        EventFilter::Exact(event)
    }

    pub fn broadcast(prefix: impl Into<String>, suffix: Option<String>) -> Self {
        EventFilter::Broadcast {
            prefix: prefix.into(),
            suffix,
        }
    }

    pub fn matches(&self, candidate: &EventType) -> bool {
        match self {
            EventFilter::Exact(event) => event == candidate,
            EventFilter::Broadcast { prefix, suffix } => {
                if candidate.prefix() != prefix {
                    return false;
                }
                match suffix {
                    None => true,
                    Some(own) => {
                        candidate.is_broadcast() || candidate.suffix().as_deref() == Some(own)
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventFilter::Exact(event) => write!(f, "{event}"),
            EventFilter::Broadcast { prefix, suffix } => {
                write!(f, "{prefix}-{}", suffix.as_deref().unwrap_or("*"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeInstanceId, COMPENSATION_PREFIX, ERROR_PREFIX};

    #[test]
    fn exact_filter_distinguishes_timer_owners() {
        let filter = EventFilter::exact(EventType::timer(NodeInstanceId(3), "PT5S"));
        assert!(filter.matches(&EventType::timer(NodeInstanceId(3), "PT5S")));
        assert!(!filter.matches(&EventType::timer(NodeInstanceId(4), "PT5S")));
    }

    #[test]
    fn compensation_broadcast_matching() {
        let for_ship = EventFilter::broadcast(COMPENSATION_PREFIX, Some("ship".into()));
        let catch_all = EventFilter::broadcast(COMPENSATION_PREFIX, None);

        let ship = EventType::Compensation(Some("ship".into()));
        let bill = EventType::Compensation(Some("bill".into()));
        let scope = EventType::Compensation(None);

        assert!(for_ship.matches(&ship));
        assert!(!for_ship.matches(&bill));
        assert!(for_ship.matches(&scope));
        assert!(catch_all.matches(&ship));
        assert!(catch_all.matches(&bill));
        assert!(!catch_all.matches(&EventType::error("ship")));
    }

    #[test]
    fn catch_all_error_filter() {
        let any_error = EventFilter::broadcast(ERROR_PREFIX, None);
        assert!(any_error.matches(&EventType::error("E1")));
        assert!(!any_error.matches(&EventType::escalation("E1")));
    }
}
