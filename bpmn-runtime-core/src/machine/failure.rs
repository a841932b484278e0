//! Error and escalation routing.
//!
//! A raised error is offered to the boundary events of the node it came
//! from, then to the event sub-processes of the enclosing container, then
//! outward one composite at a time. Nothing claiming it aborts the instance.

use super::{execution_failure, holder_of, Machine};
use crate::error::{EngineError, EngineResult};
use crate::events::AuditEvent;
use crate::instance::{Container, Outcome};
use crate::registry::{Holder, Subscription, SubscriptionTarget};
use crate::types::*;
use serde_json::json;
use uuid::Uuid;

impl Machine<'_> {
    pub(super) fn raise(
        &mut self,
        pi: Uuid,
        from: Container,
        origin: Option<NodeInstanceId>,
        event: EventType,
        message: String,
    ) -> EngineResult<()> {
        let code = event.suffix().unwrap_or_default();
        let failed_node = origin;
        let mut from = from;
        let mut origin = origin;

        loop {
            if let Some(claimer) = self.find_claimer(pi, from, origin, &event)? {
                return self.claim(pi, claimer, &event, &code, &message);
            }
            match from {
                Container::Process => break,
                Container::Node(composite) => {
                    origin = Some(composite);
                    from = self
                        .instance(pi)?
                        .node(composite)
                        .map(|n| n.container)
                        .unwrap_or(Container::Process);
                }
            }
        }

        self.events.push(AuditEvent::ErrorUnclaimed {
            process_instance_id: pi,
            event: event.to_string(),
        });
        if event.is_escalation() {
            tracing::warn!(process_instance_id = %pi, event = %event, "Machine: escalation not caught");
            return Ok(());
        }

        tracing::warn!(process_instance_id = %pi, code = %code, message = %message, "Machine: unhandled error, aborting instance");
        let has_parent = self.instance(pi)?.parent.is_some();
        self.abort_instance(
            pi,
            Outcome {
                code: code.clone(),
                message: message.clone(),
                node_instance_id: failed_node,
            },
            true,
        )?;
        // A child's failure is the parent's to handle.
        if !has_parent {
            self.fail(execution_failure(pi, failed_node, code, message));
        }
        Ok(())
    }

    fn find_claimer(
        &self,
        pi: Uuid,
        from: Container,
        origin: Option<NodeInstanceId>,
        event: &EventType,
    ) -> EngineResult<Option<Subscription>> {
        let inst = self.instance(pi)?;
        if let Some(node) = origin {
            let holder = Holder::Node(node);
            let boundary = inst
                .subscriptions
                .held_by(&holder)
                .find(|s| matches!(s.target, SubscriptionTarget::Boundary { .. }) && s.accepts(event, None));
            if let Some(sub) = boundary {
                return Ok(Some(sub.clone()));
            }
        }
        let holder = holder_of(from);
        let esp = inst
            .subscriptions
            .held_by(&holder)
            .find(|s| {
                matches!(s.target, SubscriptionTarget::EventSubProcess { .. }) && s.accepts(event, None)
            })
            .cloned();
        Ok(esp)
    }

    fn claim(
        &mut self,
        pi: Uuid,
        claimer: Subscription,
        event: &EventType,
        code: &str,
        message: &str,
    ) -> EngineResult<()> {
        let def = self.definition_of(pi)?;
        let node = match claimer.target {
            SubscriptionTarget::Boundary { boundary, .. } => boundary,
            SubscriptionTarget::EventSubProcess { node, .. } => node,
            _ => return Ok(()),
        };
        let node_id = def.node(node).id.clone();
        self.claims += 1;
        self.events.push(AuditEvent::ErrorClaimed {
            process_instance_id: pi,
            event: event.to_string(),
            node_id: node_id.clone(),
        });
        tracing::info!(process_instance_id = %pi, event = %event, claimed_by = %node_id, "Machine: error claimed");
        self.trigger(
            pi,
            claimer.seq,
            Some(json!({ "code": code, "message": message })),
        )
    }

    /// A definition problem found mid-execution aborts the instance.
    pub(super) fn fatal(&mut self, pi: Uuid, error: EngineError) -> EngineResult<()> {
        tracing::error!(process_instance_id = %pi, error = %error, "Machine: definition error during execution");
        if self.instances.get(&pi).is_some_and(|i| !i.is_terminal()) {
            self.abort_instance(
                pi,
                Outcome {
                    code: "DefinitionError".to_string(),
                    message: error.to_string(),
                    node_instance_id: None,
                },
                true,
            )?;
        }
        self.fail(error);
        Ok(())
    }

    /// Runaway guard: stop the operation and abort the instance that was
    /// being driven.
    pub(super) fn step_limit_exceeded(&mut self, pi: Uuid) -> EngineResult<()> {
        let limit = self.env.config.max_steps_per_operation;
        self.agenda.clear();
        tracing::error!(process_instance_id = %pi, limit, "Machine: step limit exceeded");
        let message = format!("more than {limit} steps in one operation");
        if self.instances.get(&pi).is_some_and(|i| !i.is_terminal()) {
            self.abort_instance(
                pi,
                Outcome {
                    code: "StepLimitExceeded".to_string(),
                    message: message.clone(),
                    node_instance_id: None,
                },
                false,
            )?;
        }
        self.fail(execution_failure(pi, None, "StepLimitExceeded", message));
        Ok(())
    }
}
