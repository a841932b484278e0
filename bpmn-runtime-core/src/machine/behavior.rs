//! Per-kind entry behaviour and the normal completion path.

use super::{correlation_string, execution_failure, holder_of, Action, Machine, Route};
use crate::definition::*;
use crate::error::{EngineError, EngineResult};
use crate::events::AuditEvent;
use crate::handler::WorkItemOutcome;
use crate::instance::{Container, NodeInstance, NodeState, ParentLink, WorkItem};
use crate::registry::{Holder, SubscriptionTarget};
use crate::types::*;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

impl Machine<'_> {
    /// Behaviour table: one arm per node kind.
    pub(super) fn enter(
        &mut self,
        pi: Uuid,
        node: NodeIdx,
        container: Container,
        via: Option<ConnIdx>,
        payload: Option<Value>,
    ) -> EngineResult<()> {
        if let Container::Node(composite) = container {
            if self.instance(pi)?.node(composite).is_none() {
                tracing::debug!(process_instance_id = %pi, container = %composite, "Machine: container gone, token dropped");
                return Ok(());
            }
        }

        let def = self.definition_of(pi)?;
        let nd = def.node(node);
        match &nd.kind {
            NodeKind::Gateway {
                direction: GatewayDirection::Join,
                gateway_type: GatewayType::Exclusive,
            } => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                self.complete(pi, ni, Route::Default)
            }
            NodeKind::Gateway {
                direction: GatewayDirection::Join,
                ..
            } => {
                let via = via.ok_or_else(|| {
                    EngineError::definition_at(&def.id, &nd.id, "join entered without an incoming connection")
                })?;
                self.arrive_at_join(pi, nd, container, via)
            }
            NodeKind::Gateway {
                direction: GatewayDirection::Split,
                gateway_type,
            } => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                let chosen = self.select_outgoing(pi, ni, &def, node, *gateway_type)?;
                self.complete(pi, ni, Route::Connections(chosen))
            }
            NodeKind::Start(start) => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                self.write_payload(pi, start.output_variable.as_deref(), payload)?;
                self.complete(pi, ni, Route::Default)
            }
            NodeKind::End(end) => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                if end.terminate {
                    self.terminate(pi, container, ni)?;
                }
                self.leave(pi, ni, NodeInstanceStatus::Completed)?;
                if let Some(throw) = &end.throw {
                    self.throw_event(pi, container, throw.event_type())?;
                }
                self.agenda.push_back(Action::ContainerCheck { pi, container });
                Ok(())
            }
            NodeKind::Throw(throw) => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                let event = throw.event_type();
                if event.is_error() {
                    self.leave(pi, ni, NodeInstanceStatus::Completed)?;
                    self.throw_event(pi, container, event)?;
                    self.agenda.push_back(Action::ContainerCheck { pi, container });
                    return Ok(());
                }
                self.throw_event(pi, container, event)?;
                self.complete(pi, ni, Route::Default)
            }
            NodeKind::Activity(activity) => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                self.attach_boundaries(pi, ni, &def, node)?;
                match &activity.task {
                    TaskKind::WorkItem { name } => self.activate_work_item(pi, ni, &def, nd, activity, name),
                    TaskKind::Script { action } => self.run_script(pi, ni, &def, nd, action),
                }
            }
            NodeKind::Catch(catch) => {
                let ni = self.create_node(pi, nd, container, NodeState::Waiting)?;
                if let EventTrigger::Timer(spec) = &catch.trigger {
                    self.schedule_timer(pi, ni, spec.clone())?;
                }
                let correlation = match &catch.correlation_variable {
                    Some(var) => {
                        let value = self.instance(pi)?.variables.get(var).map(correlation_string);
                        if value.is_none() {
                            return Err(EngineError::definition_at(
                                &def.id,
                                &nd.id,
                                format!("correlation variable '{var}' is not set"),
                            ));
                        }
                        value
                    }
                    None => None,
                };
                self.instance_mut(pi)?.subscriptions.subscribe(
                    Holder::Node(ni),
                    catch.trigger.filter(ni, None),
                    correlation,
                    SubscriptionTarget::Resume(ni),
                );
                Ok(())
            }
            NodeKind::Boundary(boundary) => {
                let ni = self.create_node(pi, nd, container, NodeState::Running)?;
                self.write_payload(pi, boundary.output_variable.as_deref(), payload)?;
                self.complete(pi, ni, Route::Default)
            }
            NodeKind::SubProcess => {
                let ni = self.create_node(pi, nd, container, NodeState::Composite)?;
                self.attach_boundaries(pi, ni, &def, node)?;
                self.subscribe_event_sub_processes(pi, &def, Some(node), Holder::Node(ni))?;
                for start in def.start_nodes(Some(node)) {
                    self.agenda.push_back(Action::Enter {
                        pi,
                        node: start,
                        container: Container::Node(ni),
                        via: None,
                        payload: None,
                    });
                }
                self.agenda.push_back(Action::ContainerCheck {
                    pi,
                    container: Container::Node(ni),
                });
                Ok(())
            }
            NodeKind::EventSubProcess => {
                let ni = self.create_node(pi, nd, container, NodeState::Composite)?;
                let (start, _) = def.event_sub_process_start(node).ok_or_else(|| {
                    EngineError::definition_at(&def.id, &nd.id, "event sub-process has no triggered start")
                })?;
                self.agenda.push_back(Action::Enter {
                    pi,
                    node: start.idx,
                    container: Container::Node(ni),
                    via: None,
                    payload,
                });
                Ok(())
            }
            NodeKind::CallActivity(call) => {
                let ni = self.create_node(
                    pi,
                    nd,
                    container,
                    NodeState::CallActivity { child: None },
                )?;
                self.attach_boundaries(pi, ni, &def, node)?;
                self.launch_child(pi, ni, nd, call)
            }
        }
    }

    // ── Node instance lifecycle ──

    fn create_node(
        &mut self,
        pi: Uuid,
        nd: &NodeDefinition,
        container: Container,
        state: NodeState,
    ) -> EngineResult<NodeInstanceId> {
        let now = self.now;
        let inst = self.instance_mut(pi)?;
        let ni = inst.allocate_node_instance_id();
        inst.node_instances.insert(
            ni,
            NodeInstance {
                id: ni,
                node: nd.idx,
                node_id: nd.id.clone(),
                container,
                status: NodeInstanceStatus::Active,
                state,
                entered_at: now,
            },
        );
        self.events.push(AuditEvent::NodeEntered {
            process_instance_id: pi,
            node_instance_id: ni,
            node_id: nd.id.clone(),
            at: now,
        });
        tracing::debug!(process_instance_id = %pi, node_instance_id = %ni, node = %nd.id, kind = nd.kind.label(), "Machine: node entered");
        Ok(ni)
    }

    /// Normal completion: register compensation handlers, leave, and move the
    /// token along `route`.
    pub(super) fn complete(&mut self, pi: Uuid, ni: NodeInstanceId, route: Route) -> EngineResult<()> {
        let def = self.definition_of(pi)?;
        let Some((node, container)) = self.instance(pi)?.node(ni).map(|n| (n.node, n.container)) else {
            return Ok(());
        };
        let nd = def.node(node);

        if nd.kind.accepts_boundaries() {
            for b in def.boundaries_of(node) {
                if let NodeKind::Boundary(BoundaryNode {
                    trigger: trigger @ EventTrigger::Compensation,
                    handler: Some(handler),
                    ..
                }) = &def.node(*b).kind
                {
                    self.instance_mut(pi)?.subscriptions.subscribe(
                        holder_of(container),
                        trigger.filter(ni, Some(nd.id.as_str())),
                        None,
                        SubscriptionTarget::Compensation {
                            handler: *handler,
                            activity: nd.id.clone(),
                        },
                    );
                }
            }
        }

        self.leave(pi, ni, NodeInstanceStatus::Completed)?;

        let targets: Vec<ConnIdx> = match route {
            Route::Default => def.outgoing_on(node, DEFAULT_PORT).map(|c| c.idx).collect(),
            Route::Connections(chosen) => chosen,
            Route::Stop => Vec::new(),
        };
        for conn in targets {
            self.agenda.push_back(Action::Enter {
                pi,
                node: def.connection(conn).to,
                container,
                via: Some(conn),
                payload: None,
            });
        }
        self.agenda.push_back(Action::ContainerCheck { pi, container });
        Ok(())
    }

    /// Remove a node instance together with its subscriptions and timers.
    pub(super) fn leave(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        status: NodeInstanceStatus,
    ) -> EngineResult<()> {
        let inst = self.instance_mut(pi)?;
        let Some(node) = inst.node_instances.remove(&ni) else {
            return Ok(());
        };
        inst.subscriptions.unsubscribe(&Holder::Node(ni));
        for timer in inst.timers_owned_by(ni) {
            inst.timers.remove(&timer);
        }
        self.events.push(AuditEvent::NodeLeft {
            process_instance_id: pi,
            node_instance_id: ni,
            node_id: node.node_id.clone(),
            status,
            at: self.now,
        });
        tracing::debug!(process_instance_id = %pi, node_instance_id = %ni, node = %node.node_id, status = ?status, "Machine: node left");
        Ok(())
    }

    fn write_payload(&mut self, pi: Uuid, variable: Option<&str>, payload: Option<Value>) -> EngineResult<()> {
        if let (Some(var), Some(value)) = (variable, payload) {
            self.instance_mut(pi)?
                .variables
                .insert(var.to_string(), value);
        }
        Ok(())
    }

    // ── Gateways ──

    fn select_outgoing(
        &self,
        pi: Uuid,
        ni: NodeInstanceId,
        def: &ProcessDefinition,
        node: NodeIdx,
        gateway_type: GatewayType,
    ) -> EngineResult<Vec<ConnIdx>> {
        let outgoing: Vec<&Connection> = def.outgoing_on(node, DEFAULT_PORT).collect();
        if gateway_type == GatewayType::Parallel {
            return Ok(outgoing.iter().map(|c| c.idx).collect());
        }

        let default = outgoing.iter().find(|c| c.is_default).map(|c| c.idx);
        let mut chosen = Vec::new();
        for conn in outgoing.iter().filter(|c| !c.is_default) {
            if self.passes(pi, ni, conn)? {
                chosen.push(conn.idx);
                if gateway_type == GatewayType::Exclusive {
                    break;
                }
            }
        }
        if chosen.is_empty() {
            chosen.extend(default);
        }
        if chosen.is_empty() {
            return Err(execution_failure(
                pi,
                Some(ni),
                "NoOutgoingPath",
                format!("no condition of gateway '{}' holds and it has no default", def.node(node).id),
            ));
        }
        Ok(chosen)
    }

    fn passes(&self, pi: Uuid, ni: NodeInstanceId, conn: &Connection) -> EngineResult<bool> {
        let Some(expression) = &conn.condition else {
            return Ok(true);
        };
        let variables = &self.instance(pi)?.variables;
        self.env
            .predicates
            .evaluate(expression, variables)
            .map_err(|e| execution_failure(pi, Some(ni), "PredicateError", e.to_string()))
    }

    fn arrive_at_join(
        &mut self,
        pi: Uuid,
        nd: &NodeDefinition,
        container: Container,
        via: ConnIdx,
    ) -> EngineResult<()> {
        let existing = self.instance(pi)?.instances_of(nd.idx, container).first().copied();
        let ni = match existing {
            Some(ni) => ni,
            None => self.create_node(
                pi,
                nd,
                container,
                NodeState::Join {
                    arrivals: BTreeMap::new(),
                },
            )?,
        };
        if let Some(NodeState::Join { arrivals }) = self.instance_mut(pi)?.node_mut(ni).map(|n| &mut n.state) {
            *arrivals.entry(via).or_insert(0) += 1;
        }
        self.try_fire_join(pi, ni)
    }

    /// Fire a join if its condition holds. Arrivals beyond one per connection
    /// are carried into a fresh join instance.
    pub(super) fn try_fire_join(&mut self, pi: Uuid, ni: NodeInstanceId) -> EngineResult<()> {
        let def = self.definition_of(pi)?;
        let Some(join) = self.instance(pi)?.node(ni).cloned() else {
            return Ok(());
        };
        let NodeState::Join { arrivals } = &join.state else {
            return Ok(());
        };
        let nd = def.node(join.node);

        let fired: Vec<ConnIdx> = match nd.kind {
            NodeKind::Gateway {
                gateway_type: GatewayType::Parallel,
                ..
            } => {
                let incoming = def.incoming(join.node);
                if !incoming.iter().all(|c| arrivals.get(c).copied().unwrap_or(0) > 0) {
                    return Ok(());
                }
                incoming.to_vec()
            }
            NodeKind::Gateway {
                gateway_type: GatewayType::Inclusive,
                ..
            } => {
                let present: Vec<ConnIdx> = arrivals
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(c, _)| *c)
                    .collect();
                if present.is_empty() || self.inclusive_join_blocked(pi, &def, &join)? {
                    return Ok(());
                }
                present
            }
            _ => return Ok(()),
        };

        let mut leftover = arrivals.clone();
        for conn in &fired {
            if let Some(n) = leftover.get_mut(conn) {
                *n -= 1;
            }
        }
        leftover.retain(|_, n| *n > 0);

        if let Some(node) = self.instance_mut(pi)?.node_mut(ni) {
            node.state = NodeState::Join {
                arrivals: fired.iter().map(|c| (*c, 1)).collect(),
            };
        }
        tracing::debug!(process_instance_id = %pi, node = %nd.id, branches = fired.len(), "Machine: join fired");
        self.complete(pi, ni, Route::Default)?;

        if !leftover.is_empty() {
            let next = self.create_node(pi, nd, join.container, NodeState::Join { arrivals: leftover })?;
            self.try_fire_join(pi, next)?;
        }
        Ok(())
    }

    /// An inclusive join waits while any other token in its container can
    /// still reach it.
    fn inclusive_join_blocked(
        &self,
        pi: Uuid,
        def: &ProcessDefinition,
        join: &NodeInstance,
    ) -> EngineResult<bool> {
        let inst = self.instance(pi)?;
        let active = inst.node_instances.values().any(|n| {
            n.container == join.container
                && n.id != join.id
                && n.node != join.node
                && def.can_reach(n.node, join.node)
        });
        let pending = self.agenda.iter().any(|a| match a {
            Action::Enter {
                pi: p,
                node,
                container,
                ..
            } => {
                *p == pi
                    && *container == join.container
                    && (*node == join.node || def.can_reach(*node, join.node))
            }
            _ => false,
        });
        Ok(active || pending)
    }

    // ── Boundaries and event sub-processes ──

    fn attach_boundaries(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        def: &ProcessDefinition,
        node: NodeIdx,
    ) -> EngineResult<()> {
        for b in def.boundaries_of(node) {
            let NodeKind::Boundary(boundary) = &def.node(*b).kind else {
                continue;
            };
            if boundary.trigger.is_compensation() {
                continue;
            }
            if let EventTrigger::Timer(spec) = &boundary.trigger {
                self.schedule_timer(pi, ni, spec.clone())?;
            }
            self.instance_mut(pi)?.subscriptions.subscribe(
                Holder::Node(ni),
                boundary.trigger.filter(ni, None),
                None,
                SubscriptionTarget::Boundary {
                    activity: ni,
                    boundary: *b,
                    cancel_activity: boundary.cancel_activity,
                },
            );
        }
        Ok(())
    }

    pub(super) fn subscribe_event_sub_processes(
        &mut self,
        pi: Uuid,
        def: &ProcessDefinition,
        composite: Option<NodeIdx>,
        holder: Holder,
    ) -> EngineResult<()> {
        for esp in def.event_sub_processes(composite) {
            let Some((start_node, start)) = def.event_sub_process_start(esp) else {
                return Err(EngineError::definition_at(
                    &def.id,
                    &def.node(esp).id,
                    "event sub-process has no triggered start",
                ));
            };
            let Some(trigger) = &start.trigger else {
                continue;
            };
            let interrupting = start.interrupting || matches!(trigger, EventTrigger::Error(_));
            self.instance_mut(pi)?.subscriptions.subscribe(
                holder.clone(),
                trigger.filter(NodeInstanceId(0), None),
                None,
                SubscriptionTarget::EventSubProcess {
                    node: esp,
                    interrupting,
                },
            );
            tracing::debug!(process_instance_id = %pi, event_sub_process = %def.node(esp).id, start = %start_node.id, "Machine: event sub-process armed");
        }
        Ok(())
    }

    // ── Activities ──

    fn activate_work_item(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        def: &ProcessDefinition,
        nd: &NodeDefinition,
        activity: &ActivityNode,
        name: &str,
    ) -> EngineResult<()> {
        let parameters = if activity.inputs.is_empty() {
            self.instance(pi)?.variables.clone()
        } else {
            let source = self.instance(pi)?.variables.clone();
            self.map_values(pi, ni, def, nd, &activity.inputs, &source)?
        };
        let item = WorkItem {
            id: ni.into(),
            process_instance_id: pi,
            node_instance_id: ni,
            name: name.to_string(),
            parameters,
        };
        if let Some(node) = self.instance_mut(pi)?.node_mut(ni) {
            node.state = NodeState::WorkItem(item.clone());
        }
        self.events.push(AuditEvent::WorkItemActivated {
            process_instance_id: pi,
            work_item_id: item.id,
            name: name.to_string(),
        });

        let Some(handler) = self.env.handlers.get(name) else {
            tracing::debug!(process_instance_id = %pi, work_item = %name, "Machine: no handler registered, work item stays pending");
            return Ok(());
        };
        match handler.execute(&item) {
            WorkItemOutcome::Pending => Ok(()),
            WorkItemOutcome::Completed(results) => self.finish_work_item(pi, ni, results),
            WorkItemOutcome::Failed { code, message } => {
                Err(execution_failure(pi, Some(ni), code, message))
            }
        }
    }

    /// Map work item results into the instance and complete the activity.
    pub(super) fn finish_work_item(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        results: Variables,
    ) -> EngineResult<()> {
        let def = self.definition_of(pi)?;
        let node = match self.instance(pi)?.node(ni) {
            Some(n) if matches!(n.state, NodeState::WorkItem(_)) => n.node,
            _ => {
                return Err(EngineError::WorkItemNotFound {
                    process_instance_id: pi,
                    work_item_id: ni.into(),
                })
            }
        };
        let nd = def.node(node);
        let NodeKind::Activity(activity) = &nd.kind else {
            return Err(EngineError::definition_at(&def.id, &nd.id, "work item on a non-activity node"));
        };
        let mapped = if activity.outputs.is_empty() {
            results
        } else {
            self.map_values(pi, ni, &def, nd, &activity.outputs, &results)?
        };
        self.instance_mut(pi)?.variables.extend(mapped);
        self.complete(pi, ni, Route::Default)
    }

    fn run_script(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        def: &ProcessDefinition,
        nd: &NodeDefinition,
        action: &str,
    ) -> EngineResult<()> {
        let run = self.env.functions.action(action).ok_or_else(|| {
            EngineError::definition_at(&def.id, &nd.id, format!("unknown action '{action}'"))
        })?;
        let mut variables = self.instance(pi)?.variables.clone();
        run(&mut variables).map_err(|e| execution_failure(pi, Some(ni), e.code, e.message))?;
        self.instance_mut(pi)?.variables = variables;
        self.complete(pi, ni, Route::Default)
    }

    fn launch_child(
        &mut self,
        pi: Uuid,
        ni: NodeInstanceId,
        nd: &NodeDefinition,
        call: &CallActivityNode,
    ) -> EngineResult<()> {
        let parent_def = self.definition_of(pi)?;
        let child_def = self
            .definition(&call.process_id, call.version.as_deref())
            .map_err(|_| {
                EngineError::definition_at(
                    &parent_def.id,
                    &nd.id,
                    format!("called process '{}' is not deployed", call.process_id),
                )
            })?;
        let source = self.instance(pi)?.variables.clone();
        let variables = self.map_values(pi, ni, &parent_def, nd, &call.inputs, &source)?;
        let correlation_key = self.instance(pi)?.correlation_key.clone();

        let parent = call.wait_for_completion.then_some(ParentLink {
            process_instance_id: pi,
            node_instance_id: ni,
        });
        let child = self.create_instance(&child_def, variables, parent, correlation_key);
        self.agenda.push_back(Action::StartInstance { pi: child, start: None });
        tracing::debug!(process_instance_id = %pi, child = %child, called = %call.process_id, wait = call.wait_for_completion, "Machine: child process launched");

        if call.wait_for_completion {
            if let Some(node) = self.instance_mut(pi)?.node_mut(ni) {
                node.state = NodeState::CallActivity { child: Some(child) };
            }
            Ok(())
        } else {
            self.complete(pi, ni, Route::Default)
        }
    }

    /// Evaluate data mappings against `source`. Unknown transformations are
    /// definition errors; failing ones are execution failures of `ni`.
    pub(super) fn map_values(
        &self,
        pi: Uuid,
        ni: NodeInstanceId,
        def: &ProcessDefinition,
        nd: &NodeDefinition,
        mappings: &[DataMapping],
        source: &Variables,
    ) -> EngineResult<Variables> {
        let mut out = Variables::new();
        for mapping in mappings {
            let value = source.get(&mapping.source).cloned().unwrap_or(Value::Null);
            let value = match &mapping.transform {
                None => value,
                Some(name) => {
                    let transform = self.env.functions.transform(name).ok_or_else(|| {
                        EngineError::definition_at(&def.id, &nd.id, format!("unknown transformation '{name}'"))
                    })?;
                    transform(&value).map_err(|e| {
                        execution_failure(pi, Some(ni), "TransformError", format!("{name}: {e}"))
                    })?
                }
            };
            out.insert(mapping.target.clone(), value);
        }
        Ok(out)
    }
}
