//! Agenda-driven interpreter for process instances.
//!
//! Every public operation pushes actions onto a FIFO agenda and drains it.
//! An action runs to completion (including every state change it makes)
//! before the next one is popped, so the reaction of one subscription holder
//! never interleaves with another's. Nothing here performs I/O: the owning
//! session commits the touched instances once the operation returns.

mod behavior;
mod dispatch;
mod failure;

use crate::definition::ProcessDefinition;
use crate::environment::RuntimeEnvironment;
use crate::error::{EngineError, EngineResult};
use crate::events::AuditEvent;
use crate::instance::{Container, Outcome, ParentLink, ProcessInstance};
use crate::registry::Holder;
use crate::timer::{TimerRecord, TimerSpec};
use crate::types::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

// ─── Agenda ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) enum Action {
    /// A token arrives at `node` inside `container`.
    Enter {
        pi: Uuid,
        node: NodeIdx,
        container: Container,
        via: Option<ConnIdx>,
        payload: Option<Value>,
    },
    /// A matched subscription fires. Re-checked by sequence number, so a
    /// subscription removed in the meantime is a no-op.
    Trigger {
        pi: Uuid,
        seq: u64,
        payload: Option<Value>,
    },
    /// An error or escalation looks for a claimer, starting at `origin`.
    RaiseError {
        pi: Uuid,
        from: Container,
        origin: Option<NodeInstanceId>,
        event: EventType,
        message: String,
    },
    ChildFinished {
        parent: ParentLink,
        child: Uuid,
    },
    /// Complete the container if nothing is left running inside it.
    ContainerCheck { pi: Uuid, container: Container },
    StartInstance {
        pi: Uuid,
        start: Option<(NodeIdx, Option<Value>)>,
    },
    WorkItemDone {
        pi: Uuid,
        ni: NodeInstanceId,
        results: Variables,
    },
    WorkItemFailed {
        pi: Uuid,
        ni: NodeInstanceId,
        code: String,
        message: String,
    },
}

impl Action {
    fn process_instance_id(&self) -> Uuid {
        match self {
            Action::Enter { pi, .. }
            | Action::Trigger { pi, .. }
            | Action::RaiseError { pi, .. }
            | Action::ContainerCheck { pi, .. }
            | Action::StartInstance { pi, .. }
            | Action::WorkItemDone { pi, .. }
            | Action::WorkItemFailed { pi, .. } => *pi,
            Action::ChildFinished { parent, .. } => parent.process_instance_id,
        }
    }
}

/// Which outgoing connections a completing node follows.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    /// Every connection leaving through the default port.
    Default,
    Connections(Vec<ConnIdx>),
    /// The token stops here.
    Stop,
}

/// What an operation changed, for the session to commit.
#[derive(Debug, Default)]
pub(crate) struct MachineReport {
    /// State of every touched instance before the operation; `None` for
    /// instances created by it.
    pub pre_images: BTreeMap<Uuid, Option<ProcessInstance>>,
    pub started: Vec<Uuid>,
    pub finished: Vec<Uuid>,
    pub events: Vec<AuditEvent>,
    /// Failure to report after the state is committed.
    pub failure: Option<EngineError>,
}

// ─── Machine ──────────────────────────────────────────────────

pub(crate) struct Machine<'a> {
    env: &'a RuntimeEnvironment,
    instances: &'a mut BTreeMap<Uuid, ProcessInstance>,
    definitions: HashMap<(String, String), Arc<ProcessDefinition>>,
    pre_images: BTreeMap<Uuid, Option<ProcessInstance>>,
    agenda: VecDeque<Action>,
    events: Vec<AuditEvent>,
    started: Vec<Uuid>,
    finished: Vec<Uuid>,
    failure: Option<EngineError>,
    claims: usize,
    steps: usize,
    now: Timestamp,
}

impl<'a> Machine<'a> {
    pub fn new(env: &'a RuntimeEnvironment, instances: &'a mut BTreeMap<Uuid, ProcessInstance>) -> Self {
        Self {
            now: env.now(),
            env,
            instances,
            definitions: HashMap::new(),
            pre_images: BTreeMap::new(),
            agenda: VecDeque::new(),
            events: Vec::new(),
            started: Vec::new(),
            finished: Vec::new(),
            failure: None,
            claims: 0,
            steps: 0,
        }
    }

    pub fn finish(self) -> MachineReport {
        MachineReport {
            pre_images: self.pre_images,
            started: self.started,
            finished: self.finished,
            events: self.events,
            failure: self.failure,
        }
    }

    // ── Operations ──

    /// Create and run a new instance. `trigger` names a triggered start node
    /// and its payload; `None` enters every untriggered top-level start.
    pub fn start(
        &mut self,
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        correlation_key: Option<String>,
        trigger: Option<(NodeIdx, Option<Value>)>,
    ) -> EngineResult<Uuid> {
        let pi = self.create_instance(&definition, variables, None, correlation_key);
        self.agenda.push_back(Action::StartInstance { pi, start: trigger });
        self.drain()?;
        Ok(pi)
    }

    /// Deliver an event to one instance. Returns how many subscriptions
    /// reacted to it.
    pub fn deliver(
        &mut self,
        pi: Uuid,
        event: EventType,
        payload: Option<Value>,
        correlation: Option<&str>,
    ) -> EngineResult<usize> {
        self.ensure_active(pi)?;

        if event.is_error() || event.is_escalation() {
            let before = self.claims;
            self.agenda.push_back(Action::RaiseError {
                pi,
                from: Container::Process,
                origin: None,
                event,
                message: "delivered to the process instance".to_string(),
            });
            self.drain()?;
            return Ok(self.claims - before);
        }

        let matching = self.instance(pi)?.subscriptions.matching(&event, correlation);
        if matching.is_empty() {
            tracing::warn!(process_instance_id = %pi, event = %event, "Machine: signal matched no subscription");
            self.events.push(AuditEvent::SignalIgnored {
                process_instance_id: Some(pi),
                event: event.to_string(),
            });
            return Ok(0);
        }
        let count = matching.len();
        for sub in matching {
            self.agenda.push_back(Action::Trigger {
                pi,
                seq: sub.seq,
                payload: payload.clone(),
            });
            self.drain()?;
        }
        Ok(count)
    }

    /// Fire one timer of `pi`. A timer that no longer exists (its owner
    /// completed or was cancelled) is ignored and `false` is returned.
    pub fn fire_timer(&mut self, pi: Uuid, timer_id: TimerId) -> EngineResult<bool> {
        let inst = self.instance(pi)?;
        if inst.is_terminal() {
            return Ok(false);
        }
        let Some(record) = inst.timers.get(&timer_id).cloned() else {
            tracing::debug!(process_instance_id = %pi, timer_id = %timer_id, "Machine: timer already gone");
            return Ok(false);
        };

        let event = record.event_type();
        let inst = self.instance_mut(pi)?;
        let keep = inst
            .timers
            .get_mut(&timer_id)
            .map(TimerRecord::record_fire)
            .unwrap_or(false);
        if !keep {
            inst.timers.remove(&timer_id);
        }
        let matching = inst.subscriptions.matching(&event, None);

        self.events.push(AuditEvent::TimerFired {
            process_instance_id: pi,
            timer_id,
            owner: record.owner,
            at: self.now,
        });
        tracing::debug!(process_instance_id = %pi, timer_id = %timer_id, remaining = ?record.remaining, "Machine: timer fired");

        for sub in matching {
            self.agenda.push_back(Action::Trigger {
                pi,
                seq: sub.seq,
                payload: None,
            });
            self.drain()?;
        }
        Ok(true)
    }

    pub fn complete_work_item(
        &mut self,
        pi: Uuid,
        work_item_id: WorkItemId,
        results: Variables,
    ) -> EngineResult<()> {
        let ni = self.pending_work_item(pi, work_item_id)?;
        self.agenda.push_back(Action::WorkItemDone { pi, ni, results });
        self.drain()
    }

    pub fn fail_work_item(
        &mut self,
        pi: Uuid,
        work_item_id: WorkItemId,
        code: String,
        message: String,
    ) -> EngineResult<()> {
        let ni = self.pending_work_item(pi, work_item_id)?;
        self.agenda.push_back(Action::WorkItemFailed {
            pi,
            ni,
            code,
            message,
        });
        self.drain()
    }

    pub fn abort(&mut self, pi: Uuid) -> EngineResult<()> {
        self.ensure_active(pi)?;
        self.abort_instance(
            pi,
            Outcome {
                code: "Aborted".to_string(),
                message: "aborted on request".to_string(),
                node_instance_id: None,
            },
            true,
        )?;
        self.drain()
    }

    pub fn is_active(&self, pi: Uuid) -> bool {
        self.instances
            .get(&pi)
            .is_some_and(|i| i.status == ProcessStatus::Active)
    }

    // ── Agenda loop ──

    fn drain(&mut self) -> EngineResult<()> {
        while let Some(action) = self.agenda.pop_front() {
            let pi = action.process_instance_id();
            self.steps += 1;
            if self.steps > self.env.config.max_steps_per_operation {
                return self.step_limit_exceeded(pi);
            }
            match self.instances.get(&pi) {
                Some(inst) if !inst.is_terminal() => {}
                _ => continue,
            }
            match self.step(action) {
                Ok(()) => {}
                Err(EngineError::ExecutionFailure {
                    process_instance_id,
                    node_instance_id,
                    code,
                    message,
                }) => {
                    let from = node_instance_id
                        .and_then(|ni| {
                            self.instances
                                .get(&process_instance_id)
                                .and_then(|inst| inst.node(ni))
                        })
                        .map(|n| n.container)
                        .unwrap_or(Container::Process);
                    tracing::debug!(
                        process_instance_id = %process_instance_id,
                        code = %code,
                        "Machine: execution failure raised"
                    );
                    self.agenda.push_front(Action::RaiseError {
                        pi: process_instance_id,
                        from,
                        origin: node_instance_id,
                        event: EventType::Error(code),
                        message,
                    });
                }
                Err(e @ EngineError::Definition { .. }) => self.fatal(pi, e)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn step(&mut self, action: Action) -> EngineResult<()> {
        match action {
            Action::Enter {
                pi,
                node,
                container,
                via,
                payload,
            } => self.enter(pi, node, container, via, payload),
            Action::Trigger { pi, seq, payload } => self.trigger(pi, seq, payload),
            Action::RaiseError {
                pi,
                from,
                origin,
                event,
                message,
            } => self.raise(pi, from, origin, event, message),
            Action::ChildFinished { parent, child } => self.child_finished(parent, child),
            Action::ContainerCheck { pi, container } => self.container_check(pi, container),
            Action::StartInstance { pi, start } => self.start_instance(pi, start),
            Action::WorkItemDone { pi, ni, results } => self.finish_work_item(pi, ni, results),
            Action::WorkItemFailed {
                pi,
                ni,
                code,
                message,
            } => Err(execution_failure(pi, Some(ni), code, message)),
        }
    }

    // ── Instance access ──

    fn instance(&self, pi: Uuid) -> EngineResult<&ProcessInstance> {
        self.instances
            .get(&pi)
            .ok_or(EngineError::InstanceNotFound(pi))
    }

    /// Mutable access. The first mutation of an operation records the
    /// instance's pre-image for rollback.
    fn instance_mut(&mut self, pi: Uuid) -> EngineResult<&mut ProcessInstance> {
        let inst = self
            .instances
            .get_mut(&pi)
            .ok_or(EngineError::InstanceNotFound(pi))?;
        self.pre_images
            .entry(pi)
            .or_insert_with(|| Some(inst.clone()));
        Ok(inst)
    }

    fn ensure_active(&self, pi: Uuid) -> EngineResult<()> {
        let inst = self.instance(pi)?;
        if inst.status != ProcessStatus::Active {
            return Err(EngineError::InstanceNotActive {
                process_instance_id: pi,
                status: inst.status,
            });
        }
        Ok(())
    }

    fn pending_work_item(&self, pi: Uuid, work_item_id: WorkItemId) -> EngineResult<NodeInstanceId> {
        self.ensure_active(pi)?;
        self.instance(pi)?
            .work_item(work_item_id)
            .map(|item| item.node_instance_id)
            .ok_or(EngineError::WorkItemNotFound {
                process_instance_id: pi,
                work_item_id,
            })
    }

    fn definition(&mut self, process_id: &str, version: Option<&str>) -> EngineResult<Arc<ProcessDefinition>> {
        if let Some(version) = version {
            let key = (process_id.to_string(), version.to_string());
            if let Some(def) = self.definitions.get(&key) {
                return Ok(def.clone());
            }
        }
        let def = self
            .env
            .definitions
            .get(process_id, version)
            .ok_or_else(|| match version {
                Some(v) => EngineError::definition(process_id, format!("version '{v}' is not deployed")),
                None => EngineError::definition(process_id, "process is not deployed"),
            })?;
        self.definitions
            .insert((def.id.clone(), def.version.clone()), def.clone());
        Ok(def)
    }

    /// The definition `pi` runs on. A deployment whose content no longer
    /// matches the one the instance started on is a definition error, since
    /// the instance's node indices would point into a different arena.
    fn definition_of(&mut self, pi: Uuid) -> EngineResult<Arc<ProcessDefinition>> {
        let (process_id, version, hash) = {
            let inst = self.instance(pi)?;
            (
                inst.process_id.clone(),
                inst.process_version.clone(),
                inst.definition_hash.clone(),
            )
        };
        let def = self.definition(&process_id, Some(&version))?;
        if !hash.is_empty() && hash != def.version_hash_hex() {
            return Err(EngineError::definition(
                process_id,
                format!("deployed version '{version}' differs from the one the instance started on"),
            ));
        }
        Ok(def)
    }

    fn create_instance(
        &mut self,
        definition: &Arc<ProcessDefinition>,
        variables: Variables,
        parent: Option<ParentLink>,
        correlation_key: Option<String>,
    ) -> Uuid {
        let mut inst = ProcessInstance::new(definition, variables, self.now);
        inst.parent = parent;
        inst.correlation_key = correlation_key;
        let pi = inst.id;
        self.definitions.insert(
            (definition.id.clone(), definition.version.clone()),
            definition.clone(),
        );
        self.instances.insert(pi, inst);
        self.pre_images.insert(pi, None);
        self.started.push(pi);
        pi
    }

    fn start_instance(&mut self, pi: Uuid, start: Option<(NodeIdx, Option<Value>)>) -> EngineResult<()> {
        let def = self.definition_of(pi)?;
        let inst = self.instance_mut(pi)?;
        inst.status = ProcessStatus::Active;
        let parent = inst.parent.map(|p| p.process_instance_id);
        self.events.push(AuditEvent::ProcessStarted {
            process_instance_id: pi,
            process_id: def.id.clone(),
            parent,
            at: self.now,
        });
        tracing::info!(process_instance_id = %pi, process_id = %def.id, parent = ?parent, "Machine: process instance started");

        self.subscribe_event_sub_processes(pi, &def, None, Holder::Process)?;
        match start {
            Some((node, payload)) => self.agenda.push_back(Action::Enter {
                pi,
                node,
                container: Container::Process,
                via: None,
                payload,
            }),
            None => {
                for node in def.start_nodes(None) {
                    self.agenda.push_back(Action::Enter {
                        pi,
                        node,
                        container: Container::Process,
                        via: None,
                        payload: None,
                    });
                }
            }
        }
        self.agenda.push_back(Action::ContainerCheck {
            pi,
            container: Container::Process,
        });
        Ok(())
    }

    fn schedule_timer(&mut self, pi: Uuid, owner: NodeInstanceId, spec: TimerSpec) -> EngineResult<()> {
        let now = self.now;
        let inst = self.instance_mut(pi)?;
        let timer_id = inst.allocate_timer_id();
        let record = TimerRecord::new(timer_id, owner, spec, now);
        let due = record.next_fire;
        inst.timers.insert(timer_id, record);
        self.events.push(AuditEvent::TimerScheduled {
            process_instance_id: pi,
            timer_id,
            owner,
            due,
        });
        Ok(())
    }

    fn fail(&mut self, error: EngineError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn has_pending_enter(&self, pi: Uuid, container: Container) -> bool {
        self.agenda.iter().any(|a| {
            matches!(a, Action::Enter { pi: p, container: c, .. } if *p == pi && *c == container)
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────

pub(crate) fn execution_failure(
    pi: Uuid,
    ni: Option<NodeInstanceId>,
    code: impl Into<String>,
    message: impl Into<String>,
) -> EngineError {
    EngineError::ExecutionFailure {
        process_instance_id: pi,
        node_instance_id: ni,
        code: code.into(),
        message: message.into(),
    }
}

/// Subscription holder standing for a container.
pub(crate) fn holder_of(container: Container) -> Holder {
    match container {
        Container::Process => Holder::Process,
        Container::Node(ni) => Holder::Node(ni),
    }
}

/// Correlation values compare as strings.
pub(crate) fn correlation_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
