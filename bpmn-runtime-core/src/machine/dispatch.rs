//! Subscription triggers, event throws, cancellation and instance ends.

use super::{execution_failure, holder_of, Action, Machine, Route};
use crate::definition::{GatewayDirection, GatewayType, NodeKind};
use crate::error::EngineResult;
use crate::events::AuditEvent;
use crate::instance::{Container, NodeState, Outcome, ParentLink};
use crate::registry::{Holder, SubscriptionTarget};
use crate::types::*;
use serde_json::Value;
use uuid::Uuid;

impl Machine<'_> {
    // ── Triggers ──

    pub(super) fn trigger(&mut self, pi: Uuid, seq: u64, payload: Option<Value>) -> EngineResult<()> {
        let Some(sub) = self.instance(pi)?.subscriptions.get(seq).cloned() else {
            tracing::debug!(process_instance_id = %pi, seq, "Machine: subscription gone before trigger");
            return Ok(());
        };

        match sub.target {
            SubscriptionTarget::Resume(ni) => {
                let def = self.definition_of(pi)?;
                let Some(node) = self.instance(pi)?.node(ni).map(|n| n.node) else {
                    return Ok(());
                };
                if let (NodeKind::Catch(catch), Some(value)) = (&def.node(node).kind, payload) {
                    if let Some(var) = &catch.output_variable {
                        self.instance_mut(pi)?.variables.insert(var.clone(), value);
                    }
                }
                self.complete(pi, ni, Route::Default)
            }
            SubscriptionTarget::Boundary {
                activity,
                boundary,
                cancel_activity,
            } => {
                let Some(container) = self.instance(pi)?.node(activity).map(|n| n.container) else {
                    return Ok(());
                };
                if cancel_activity {
                    self.cancel(pi, activity)?;
                }
                self.agenda.push_back(Action::Enter {
                    pi,
                    node: boundary,
                    container,
                    via: None,
                    payload,
                });
                Ok(())
            }
            SubscriptionTarget::EventSubProcess { node, interrupting } => {
                let Some(container) = self.container_of(pi, &sub.holder)? else {
                    return Ok(());
                };
                if interrupting {
                    self.instance_mut(pi)?.subscriptions.remove(seq);
                    let children = self.instance(pi)?.children_of(container);
                    for child in children {
                        self.cancel(pi, child)?;
                    }
                }
                self.agenda.push_back(Action::Enter {
                    pi,
                    node,
                    container,
                    via: None,
                    payload,
                });
                Ok(())
            }
            SubscriptionTarget::Compensation { handler, activity } => {
                let Some(container) = self.container_of(pi, &sub.holder)? else {
                    return Ok(());
                };
                // Each handler runs once per completed activity instance.
                self.instance_mut(pi)?.subscriptions.remove(seq);
                tracing::debug!(process_instance_id = %pi, activity = %activity, "Machine: compensating");
                self.agenda.push_back(Action::Enter {
                    pi,
                    node: handler,
                    container,
                    via: None,
                    payload,
                });
                Ok(())
            }
            SubscriptionTarget::Start { process_id, .. } => {
                tracing::warn!(process_instance_id = %pi, process_id = %process_id, "Machine: start subscription inside an instance ignored");
                Ok(())
            }
        }
    }

    /// Container a holder stands for, `None` if that composite is gone.
    fn container_of(&self, pi: Uuid, holder: &Holder) -> EngineResult<Option<Container>> {
        Ok(match holder {
            Holder::Process => Some(Container::Process),
            Holder::Node(ni) => self
                .instance(pi)?
                .node(*ni)
                .map(|_| Container::Node(*ni)),
            Holder::Definition(_) => None,
        })
    }

    /// Raise `event` from inside `container`.
    pub(super) fn throw_event(&mut self, pi: Uuid, container: Container, event: EventType) -> EngineResult<()> {
        if event.is_error() || event.is_escalation() {
            self.agenda.push_back(Action::RaiseError {
                pi,
                from: container,
                origin: None,
                message: format!("thrown event {event}"),
                event,
            });
            return Ok(());
        }

        let inst = self.instance(pi)?;
        let mut seqs: Vec<u64> = match &event {
            EventType::Compensation(_) => {
                let holder = holder_of(container);
                inst.subscriptions
                    .held_by(&holder)
                    .filter(|s| s.accepts(&event, None))
                    .map(|s| s.seq)
                    .collect()
            }
            _ => inst
                .subscriptions
                .matching(&event, None)
                .into_iter()
                .map(|s| s.seq)
                .collect(),
        };
        if matches!(event, EventType::Compensation(_)) {
            // Undo in reverse completion order.
            seqs.reverse();
        }
        if seqs.is_empty() {
            self.events.push(AuditEvent::SignalIgnored {
                process_instance_id: Some(pi),
                event: event.to_string(),
            });
        }
        for seq in seqs {
            self.agenda.push_back(Action::Trigger {
                pi,
                seq,
                payload: None,
            });
        }
        Ok(())
    }

    /// Terminate end: cancel every sibling and drop tokens still heading
    /// into the container.
    pub(super) fn terminate(&mut self, pi: Uuid, container: Container, end: NodeInstanceId) -> EngineResult<()> {
        let siblings = self.instance(pi)?.children_of(container);
        for sibling in siblings {
            if sibling != end {
                self.cancel(pi, sibling)?;
            }
        }
        self.agenda.retain(|a| {
            !matches!(a, Action::Enter { pi: p, container: c, .. } if *p == pi && *c == container)
        });
        Ok(())
    }

    // ── Containers ──

    pub(super) fn container_check(&mut self, pi: Uuid, container: Container) -> EngineResult<()> {
        let inst = self.instance(pi)?;
        if inst.is_terminal() || inst.status == ProcessStatus::Pending {
            return Ok(());
        }
        if let Container::Node(composite) = container {
            if inst.node(composite).is_none() {
                return Ok(());
            }
        }
        if self.has_pending_enter(pi, container) {
            return Ok(());
        }

        let def = self.definition_of(pi)?;
        let joins: Vec<NodeInstanceId> = self
            .instance(pi)?
            .node_instances
            .values()
            .filter(|n| n.container == container)
            .filter(|n| {
                matches!(
                    def.node(n.node).kind,
                    NodeKind::Gateway {
                        direction: GatewayDirection::Join,
                        gateway_type: GatewayType::Inclusive,
                    }
                )
            })
            .map(|n| n.id)
            .collect();
        for join in joins {
            self.try_fire_join(pi, join)?;
        }

        if !self.instance(pi)?.children_of(container).is_empty() || self.has_pending_enter(pi, container) {
            return Ok(());
        }
        match container {
            Container::Process => self.complete_instance(pi),
            Container::Node(composite) => self.complete(pi, composite, Route::Default),
        }
    }

    // ── Cancellation ──

    /// Cancel a node instance and every live descendant, deepest first.
    /// Cancellation never follows outgoing connections.
    pub(super) fn cancel(&mut self, pi: Uuid, ni: NodeInstanceId) -> EngineResult<()> {
        let mut doomed = self.instance(pi)?.descendants_of(ni);
        doomed.push(ni);
        for id in doomed {
            self.cancel_one(pi, id)?;
        }
        Ok(())
    }

    fn cancel_one(&mut self, pi: Uuid, ni: NodeInstanceId) -> EngineResult<()> {
        let Some(node) = self.instance(pi)?.node(ni).cloned() else {
            return Ok(());
        };
        match &node.state {
            NodeState::WorkItem(item) => {
                if let Some(handler) = self.env.handlers.get(&item.name) {
                    handler.abort(item);
                }
            }
            NodeState::CallActivity { child: Some(child) } => {
                let def = self.definition_of(pi)?;
                let independent = matches!(&def.node(node.node).kind, NodeKind::CallActivity(call) if call.independent);
                let live = self.instances.get(child).map(|c| !c.is_terminal());
                match live {
                    Some(true) if !independent => self.abort_instance(
                        *child,
                        Outcome {
                            code: "ParentCancelled".to_string(),
                            message: format!("calling node {} was cancelled", node.node_id),
                            node_instance_id: None,
                        },
                        false,
                    )?,
                    None => tracing::warn!(process_instance_id = %pi, child = %child, "Machine: child instance not loaded, left running"),
                    _ => {}
                }
            }
            _ => {}
        }
        self.leave(pi, ni, NodeInstanceStatus::Cancelled)
    }

    // ── Instance ends ──

    pub(super) fn abort_instance(&mut self, pi: Uuid, outcome: Outcome, notify_parent: bool) -> EngineResult<()> {
        let top_level = self.instance(pi)?.children_of(Container::Process);
        for top in top_level {
            self.cancel(pi, top)?;
        }
        let now = self.now;
        let inst = self.instance_mut(pi)?;
        inst.subscriptions.clear();
        inst.timers.clear();
        inst.status = ProcessStatus::Aborted;
        inst.ended_at = Some(now);
        let parent = inst.parent;
        let code = outcome.code.clone();
        inst.outcome = Some(outcome);

        self.events.push(AuditEvent::ProcessAborted {
            process_instance_id: pi,
            code: Some(code.clone()),
            at: now,
        });
        tracing::info!(process_instance_id = %pi, code = %code, "Machine: process instance aborted");
        self.finished.push(pi);
        if let (true, Some(parent)) = (notify_parent, parent) {
            self.agenda.push_back(Action::ChildFinished { parent, child: pi });
        }
        Ok(())
    }

    pub(super) fn complete_instance(&mut self, pi: Uuid) -> EngineResult<()> {
        let now = self.now;
        let inst = self.instance_mut(pi)?;
        inst.subscriptions.clear();
        inst.timers.clear();
        inst.status = ProcessStatus::Completed;
        inst.ended_at = Some(now);
        let parent = inst.parent;

        self.events.push(AuditEvent::ProcessCompleted {
            process_instance_id: pi,
            at: now,
        });
        tracing::info!(process_instance_id = %pi, "Machine: process instance completed");
        self.finished.push(pi);
        if let Some(parent) = parent {
            self.agenda.push_back(Action::ChildFinished { parent, child: pi });
        }
        Ok(())
    }

    /// Resume the call activity waiting on `child`.
    pub(super) fn child_finished(&mut self, parent: ParentLink, child: Uuid) -> EngineResult<()> {
        let pi = parent.process_instance_id;
        let ni = parent.node_instance_id;
        let waiting = matches!(
            self.instance(pi)?.node(ni).map(|n| &n.state),
            Some(NodeState::CallActivity { child: Some(c) }) if *c == child
        );
        if !waiting {
            tracing::debug!(process_instance_id = %pi, child = %child, "Machine: no call activity waits for child");
            return Ok(());
        }

        let (status, outcome, child_vars) = {
            let c = self.instance(child)?;
            (c.status, c.outcome.clone(), c.variables.clone())
        };
        if status == ProcessStatus::Aborted {
            let (code, message) = outcome
                .map(|o| (o.code, o.message))
                .unwrap_or_else(|| ("SubProcessAborted".to_string(), format!("child {child} aborted")));
            return Err(execution_failure(pi, Some(ni), code, message));
        }

        let def = self.definition_of(pi)?;
        let Some(node) = self.instance(pi)?.node(ni).map(|n| n.node) else {
            return Ok(());
        };
        let nd = def.node(node);
        if let NodeKind::CallActivity(call) = &nd.kind {
            let mapped = self.map_values(pi, ni, &def, nd, &call.outputs, &child_vars)?;
            self.instance_mut(pi)?.variables.extend(mapped);
        }
        self.complete(pi, ni, Route::Default)
    }
}
