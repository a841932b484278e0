//! Subscription tables mapping event types to interested holders.
//!
//! One registry lives inside every process instance (process-instance scope,
//! persisted with it). Sessions keep another one for definition-level start
//! triggers (external scope), rebuilt from the deployed definitions.

use crate::filter::EventFilter;
use crate::types::{EventType, NodeIdx, NodeInstanceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who a subscription belongs to. Removing the holder removes its subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Holder {
    /// The process instance itself as the outermost container.
    Process,
    Node(NodeInstanceId),
    /// A deployed definition (start triggers).
    Definition(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionScope {
    ProcessInstance,
    External,
}

/// What a matched subscription does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTarget {
    /// Resume a suspended catch node.
    Resume(NodeInstanceId),
    Boundary {
        activity: NodeInstanceId,
        boundary: NodeIdx,
        cancel_activity: bool,
    },
    /// Start an event sub-process inside the holder's container.
    EventSubProcess { node: NodeIdx, interrupting: bool },
    /// Run the compensation handler of a completed activity.
    Compensation { handler: NodeIdx, activity: String },
    /// Start a new instance of a deployed definition.
    Start { process_id: String, node: NodeIdx },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub seq: u64,
    pub holder: Holder,
    pub filter: EventFilter,
    /// When set, only events carrying the same correlation value match.
    pub correlation: Option<String>,
    pub scope: SubscriptionScope,
    pub target: SubscriptionTarget,
}

impl Subscription {
    pub fn accepts(&self, event: &EventType, correlation: Option<&str>) -> bool {
        if !self.filter.matches(event) {
            return false;
        }
        match &self.correlation {
            None => true,
            Some(expected) => correlation == Some(expected.as_str()),
        }
    }
}

/// Ordered subscription table. Sequence numbers only grow, so iteration
/// order is registration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCorrelationRegistry {
    scope: SubscriptionScope,
    next_seq: u64,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl EventCorrelationRegistry {
    pub fn new(scope: SubscriptionScope) -> Self {
        Self {
            scope,
            next_seq: 1,
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn scope(&self) -> SubscriptionScope {
        self.scope
    }

    pub fn subscribe(
        &mut self,
        holder: Holder,
        filter: EventFilter,
        correlation: Option<String>,
        target: SubscriptionTarget,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.subscriptions.insert(
            seq,
            Subscription {
                seq,
                holder,
                filter,
                correlation,
                scope: self.scope,
                target,
            },
        );
        seq
    }

    /// Remove every subscription of `holder`, returning them.
    pub fn unsubscribe(&mut self, holder: &Holder) -> Vec<Subscription> {
        let seqs: Vec<u64> = self
            .subscriptions
            .values()
            .filter(|s| &s.holder == holder)
            .map(|s| s.seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.subscriptions.remove(&seq))
            .collect()
    }

    pub fn remove(&mut self, seq: u64) -> Option<Subscription> {
        self.subscriptions.remove(&seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.subscriptions.contains_key(&seq)
    }

    pub fn get(&self, seq: u64) -> Option<&Subscription> {
        self.subscriptions.get(&seq)
    }

    /// Holders interested in `event`, in registration order.
    pub fn matching(&self, event: &EventType, correlation: Option<&str>) -> Vec<Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.accepts(event, correlation))
            .cloned()
            .collect()
    }

    pub fn held_by<'a>(&'a self, holder: &'a Holder) -> impl Iterator<Item = &'a Subscription> {
        self.subscriptions.values().filter(move |s| &s.holder == holder)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

impl Default for EventCorrelationRegistry {
    fn default() -> Self {
        Self::new(SubscriptionScope::ProcessInstance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resume(n: u64) -> SubscriptionTarget {
        SubscriptionTarget::Resume(NodeInstanceId(n))
    }

    #[test]
    fn match_returns_registration_order() {
        let mut registry = EventCorrelationRegistry::default();
        let go = EventType::signal("go");
        registry.subscribe(
            Holder::Node(NodeInstanceId(9)),
            EventFilter::exact(go.clone()),
            None,
            resume(9),
        );
        registry.subscribe(
            Holder::Node(NodeInstanceId(2)),
            EventFilter::exact(EventType::signal("stop")),
            None,
            resume(2),
        );
        registry.subscribe(
            Holder::Node(NodeInstanceId(5)),
            EventFilter::exact(go.clone()),
            None,
            resume(5),
        );

        let holders: Vec<Holder> = registry
            .matching(&go, None)
            .into_iter()
            .map(|s| s.holder)
            .collect();
        assert_eq!(
            holders,
            vec![
                Holder::Node(NodeInstanceId(9)),
                Holder::Node(NodeInstanceId(5))
            ]
        );
    }

    #[test]
    fn unsubscribe_removes_all_of_a_holder() {
        let mut registry = EventCorrelationRegistry::default();
        let holder = Holder::Node(NodeInstanceId(1));
        registry.subscribe(
            holder.clone(),
            EventFilter::exact(EventType::signal("a")),
            None,
            resume(1),
        );
        registry.subscribe(
            holder.clone(),
            EventFilter::exact(EventType::signal("b")),
            None,
            resume(1),
        );
        registry.subscribe(
            Holder::Process,
            EventFilter::exact(EventType::signal("a")),
            None,
            resume(0),
        );

        assert_eq!(registry.unsubscribe(&holder).len(), 2);
        assert_eq!(registry.held_by(&holder).count(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn correlation_narrows_matches() {
        let mut registry = EventCorrelationRegistry::default();
        let paid = EventType::message("paid");
        registry.subscribe(
            Holder::Node(NodeInstanceId(1)),
            EventFilter::exact(paid.clone()),
            Some("order-1".into()),
            resume(1),
        );
        assert!(registry.matching(&paid, Some("order-2")).is_empty());
        assert!(registry.matching(&paid, None).is_empty());
        assert_eq!(registry.matching(&paid, Some("order-1")).len(), 1);
    }
}
