use super::doc::{DefinitionDoc, NodeDoc, NodeSpec, TriggerDoc};
use super::model::*;
use super::ProcessDefinition;
use crate::error::{EngineError, EngineResult};
use crate::timer::TimerSpec;
use crate::types::{ConnIdx, NodeIdx};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub node_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn err(rule: &str, node: Option<&str>, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        node_id: node.map(str::to_string),
        message,
    }
}

fn parse_timer(text: &str) -> Result<TimerSpec, String> {
    text.parse::<TimerSpec>()
}

/// Validate a definition document. Returns all errors found.
pub fn validate(doc: &DefinitionDoc) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut nodes: HashMap<&str, &NodeDoc> = HashMap::new();

    // D1: node ids unique and non-empty
    for node in &doc.nodes {
        if node.id.is_empty() {
            errors.push(err("D1", None, "Node with empty id".into()));
        } else if nodes.insert(node.id.as_str(), node).is_some() {
            errors.push(err(
                "D1",
                Some(&node.id),
                format!("Duplicate node id: {}", node.id),
            ));
        }
    }

    // D2: containers are composite nodes, containment is acyclic
    for node in &doc.nodes {
        let Some(container) = node.container.as_deref() else {
            continue;
        };
        match nodes.get(container) {
            None => errors.push(err(
                "D2",
                Some(&node.id),
                format!("Node {} is inside unknown container {}", node.id, container),
            )),
            Some(parent)
                if !matches!(parent.spec, NodeSpec::SubProcess | NodeSpec::EventSubProcess) =>
            {
                errors.push(err(
                    "D2",
                    Some(&node.id),
                    format!("Container {} of node {} is not a sub-process", container, node.id),
                ))
            }
            Some(_) => {
                let mut seen = HashSet::from([node.id.as_str()]);
                let mut cursor = Some(container);
                while let Some(current) = cursor {
                    if !seen.insert(current) {
                        errors.push(err(
                            "D2",
                            Some(&node.id),
                            format!("Containment cycle through node {}", node.id),
                        ));
                        break;
                    }
                    cursor = nodes.get(current).and_then(|n| n.container.as_deref());
                }
            }
        }
    }

    // D3 + D4: connection endpoints resolve and share one container
    for conn in &doc.connections {
        let from = nodes.get(conn.from.as_str());
        let to = nodes.get(conn.to.as_str());
        if from.is_none() {
            errors.push(err(
                "D3",
                None,
                format!("Connection from unknown node {}", conn.from),
            ));
        }
        if to.is_none() {
            errors.push(err("D3", None, format!("Connection to unknown node {}", conn.to)));
        }
        if let (Some(from), Some(to)) = (from, to) {
            if from.container != to.container {
                errors.push(err(
                    "D4",
                    Some(&from.id),
                    format!("Connection {} -> {} crosses a container boundary", from.id, to.id),
                ));
            }
            if matches!(from.spec, NodeSpec::End { .. }) {
                errors.push(err(
                    "D4",
                    Some(&from.id),
                    format!("End node {} has an outgoing connection", from.id),
                ));
            }
            if matches!(to.spec, NodeSpec::Start { .. } | NodeSpec::Boundary { .. }) {
                errors.push(err(
                    "D4",
                    Some(&to.id),
                    format!("Node {} cannot have incoming connections", to.id),
                ));
            }
        }
    }

    // D5: the process has a top-level start
    if !doc
        .nodes
        .iter()
        .any(|n| n.container.is_none() && matches!(n.spec, NodeSpec::Start { .. }))
    {
        errors.push(err("D5", None, "No top-level start node".into()));
    }

    // D6: composite start rules
    for node in &doc.nodes {
        let starts: Vec<&NodeDoc> = doc
            .nodes
            .iter()
            .filter(|n| n.container.as_deref() == Some(node.id.as_str()))
            .filter(|n| matches!(n.spec, NodeSpec::Start { .. }))
            .collect();
        match node.spec {
            NodeSpec::EventSubProcess => {
                let triggered = starts
                    .iter()
                    .filter(|n| matches!(n.spec, NodeSpec::Start { trigger: Some(_), .. }))
                    .count();
                if starts.len() != 1 || triggered != 1 {
                    errors.push(err(
                        "D6",
                        Some(&node.id),
                        format!(
                            "Event sub-process {} must contain exactly one triggered start",
                            node.id
                        ),
                    ));
                }
                if node
                    .container
                    .as_deref()
                    .and_then(|c| nodes.get(c))
                    .is_some_and(|p| matches!(p.spec, NodeSpec::EventSubProcess))
                {
                    errors.push(err(
                        "D6",
                        Some(&node.id),
                        format!("Event sub-process {} is nested in an event sub-process", node.id),
                    ));
                }
            }
            NodeSpec::SubProcess => {
                let plain = starts
                    .iter()
                    .filter(|n| matches!(n.spec, NodeSpec::Start { trigger: None, .. }))
                    .count();
                if plain == 0 {
                    errors.push(err(
                        "D6",
                        Some(&node.id),
                        format!("Sub-process {} has no untriggered start", node.id),
                    ));
                }
            }
            _ => {}
        }
    }

    // D7: per-kind rules
    for node in &doc.nodes {
        let id = node.id.as_str();
        match &node.spec {
            NodeSpec::Start {
                trigger: Some(trigger),
                ..
            } => match trigger {
                TriggerDoc::Timer(_) => errors.push(err(
                    "D7",
                    Some(id),
                    format!("Start node {id}: timer start triggers are not supported"),
                )),
                TriggerDoc::Compensation if node.container.is_none() => errors.push(err(
                    "D7",
                    Some(id),
                    format!("Start node {id}: compensation starts only inside event sub-processes"),
                )),
                TriggerDoc::Error(_) | TriggerDoc::Escalation(_)
                    if !node
                        .container
                        .as_deref()
                        .and_then(|c| nodes.get(c))
                        .is_some_and(|c| matches!(c.spec, NodeSpec::EventSubProcess)) =>
                {
                    errors.push(err(
                        "D7",
                        Some(id),
                        format!("Start node {id}: error/escalation starts only inside event sub-processes"),
                    ))
                }
                _ => {}
            },
            NodeSpec::Catch { trigger, .. } => match trigger {
                TriggerDoc::Signal(_) | TriggerDoc::Message(_) => {}
                TriggerDoc::Timer(text) => {
                    if let Err(e) = parse_timer(text) {
                        errors.push(err("D7", Some(id), format!("Catch node {id}: {e}")));
                    }
                }
                _ => errors.push(err(
                    "D7",
                    Some(id),
                    format!("Catch node {id}: only signal, message and timer triggers are allowed"),
                )),
            },
            NodeSpec::Boundary {
                attached_to,
                trigger,
                handler,
                ..
            } => {
                match nodes.get(attached_to.as_str()) {
                    None => errors.push(err(
                        "D8",
                        Some(id),
                        format!("Boundary {id} attached to unknown node {attached_to}"),
                    )),
                    Some(activity) => {
                        if !matches!(
                            activity.spec,
                            NodeSpec::Task { .. }
                                | NodeSpec::Script { .. }
                                | NodeSpec::SubProcess
                                | NodeSpec::CallActivity { .. }
                        ) {
                            errors.push(err(
                                "D8",
                                Some(id),
                                format!("Boundary {id}: {attached_to} cannot carry boundary events"),
                            ));
                        }
                        if activity.container != node.container {
                            errors.push(err(
                                "D8",
                                Some(id),
                                format!("Boundary {id} is not in the container of {attached_to}"),
                            ));
                        }
                    }
                }
                if let TriggerDoc::Timer(text) = trigger {
                    if let Err(e) = parse_timer(text) {
                        errors.push(err("D7", Some(id), format!("Boundary {id}: {e}")));
                    }
                }
                // D9: compensation boundaries name a handler in the same container
                match (trigger, handler) {
                    (TriggerDoc::Compensation, None) => errors.push(err(
                        "D9",
                        Some(id),
                        format!("Compensation boundary {id} has no handler"),
                    )),
                    (TriggerDoc::Compensation, Some(h)) => match nodes.get(h.as_str()) {
                        None => errors.push(err(
                            "D9",
                            Some(id),
                            format!("Compensation boundary {id}: unknown handler {h}"),
                        )),
                        Some(handler) if handler.container != node.container => {
                            errors.push(err(
                                "D9",
                                Some(id),
                                format!("Compensation handler {h} is not beside boundary {id}"),
                            ))
                        }
                        Some(_) => {}
                    },
                    (_, Some(h)) => errors.push(err(
                        "D9",
                        Some(id),
                        format!("Boundary {id}: handler {h} is only allowed on compensation"),
                    )),
                    _ => {}
                }
                if matches!(trigger, TriggerDoc::Error(_)) && !trigger_cancels(&node.spec) {
                    errors.push(err(
                        "D8",
                        Some(id),
                        format!("Error boundary {id} must cancel its activity"),
                    ));
                }
            }
            NodeSpec::CallActivity { process_id, .. } if process_id.is_empty() => {
                errors.push(err(
                    "D10",
                    Some(id),
                    format!("Call activity {id} names no process"),
                ));
            }
            NodeSpec::Task { work_item, .. } if work_item.is_empty() => {
                errors.push(err("D10", Some(id), format!("Task {id} names no work item")));
            }
            NodeSpec::Script { action } if action.is_empty() => {
                errors.push(err("D10", Some(id), format!("Script {id} names no action")));
            }
            _ => {}
        }
    }

    errors
}

fn trigger_cancels(spec: &NodeSpec) -> bool {
    matches!(
        spec,
        NodeSpec::Boundary {
            cancel_activity: true,
            ..
        }
    )
}

fn compile_trigger(trigger: &TriggerDoc) -> Result<EventTrigger, String> {
    Ok(match trigger {
        TriggerDoc::Signal(name) => EventTrigger::Signal(name.clone()),
        TriggerDoc::Message(name) => EventTrigger::Message(name.clone()),
        TriggerDoc::Timer(text) => EventTrigger::Timer(parse_timer(text)?),
        TriggerDoc::Error(code) => EventTrigger::Error(code.clone()),
        TriggerDoc::Escalation(code) => EventTrigger::Escalation(code.clone()),
        TriggerDoc::Compensation => EventTrigger::Compensation,
    })
}

/// Validate and compile a document into an immutable `ProcessDefinition`.
pub fn compile(doc: &DefinitionDoc) -> EngineResult<ProcessDefinition> {
    let errors = validate(doc);
    if let Some(first) = errors.first() {
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::Definition {
            process_id: doc.id.clone(),
            node_id: first.node_id.clone(),
            message,
        });
    }

    let by_id: HashMap<String, NodeIdx> = doc
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i as NodeIdx))
        .collect();
    let resolve = |id: &str| -> EngineResult<NodeIdx> {
        by_id
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::definition(&doc.id, format!("Unknown node {id}")))
    };
    let fail = |node: &str, e: String| EngineError::definition_at(&doc.id, node, e);

    let mut nodes = Vec::with_capacity(doc.nodes.len());
    for (i, node) in doc.nodes.iter().enumerate() {
        let kind = match &node.spec {
            NodeSpec::Start {
                trigger,
                interrupting,
                output_variable,
            } => NodeKind::Start(StartNode {
                trigger: trigger
                    .as_ref()
                    .map(compile_trigger)
                    .transpose()
                    .map_err(|e| fail(&node.id, e))?,
                interrupting: *interrupting,
                output_variable: output_variable.clone(),
            }),
            NodeSpec::End { terminate, throw } => NodeKind::End(EndNode {
                terminate: *terminate,
                throw: throw.clone(),
            }),
            NodeSpec::Gateway {
                gateway_type,
                direction,
            } => NodeKind::Gateway {
                direction: *direction,
                gateway_type: *gateway_type,
            },
            NodeSpec::Task {
                work_item,
                inputs,
                outputs,
            } => NodeKind::Activity(ActivityNode {
                task: TaskKind::WorkItem {
                    name: work_item.clone(),
                },
                inputs: inputs.clone(),
                outputs: outputs.clone(),
            }),
            NodeSpec::Script { action } => NodeKind::Activity(ActivityNode {
                task: TaskKind::Script {
                    action: action.clone(),
                },
                inputs: Vec::new(),
                outputs: Vec::new(),
            }),
            NodeSpec::Catch {
                trigger,
                output_variable,
                correlation_variable,
            } => NodeKind::Catch(CatchNode {
                trigger: compile_trigger(trigger).map_err(|e| fail(&node.id, e))?,
                output_variable: output_variable.clone(),
                correlation_variable: correlation_variable.clone(),
            }),
            NodeSpec::Throw { event } => NodeKind::Throw(event.clone()),
            NodeSpec::Boundary {
                attached_to,
                trigger,
                cancel_activity,
                output_variable,
                handler,
            } => NodeKind::Boundary(BoundaryNode {
                attached_to: resolve(attached_to)?,
                trigger: compile_trigger(trigger).map_err(|e| fail(&node.id, e))?,
                cancel_activity: *cancel_activity,
                output_variable: output_variable.clone(),
                handler: handler.as_deref().map(resolve).transpose()?,
            }),
            NodeSpec::SubProcess => NodeKind::SubProcess,
            NodeSpec::EventSubProcess => NodeKind::EventSubProcess,
            NodeSpec::CallActivity {
                process_id,
                version,
                wait_for_completion,
                independent,
                inputs,
                outputs,
            } => NodeKind::CallActivity(CallActivityNode {
                process_id: process_id.clone(),
                version: version.clone(),
                wait_for_completion: *wait_for_completion,
                independent: *independent,
                inputs: inputs.clone(),
                outputs: outputs.clone(),
            }),
        };
        nodes.push(NodeDefinition {
            idx: i as NodeIdx,
            id: node.id.clone(),
            name: node.name.clone().unwrap_or_else(|| node.id.clone()),
            kind,
            container: node.container.as_deref().map(resolve).transpose()?,
            metadata: node.metadata.clone(),
        });
    }

    let mut connections = Vec::with_capacity(doc.connections.len());
    let mut outgoing: Vec<Vec<ConnIdx>> = vec![Vec::new(); nodes.len()];
    let mut incoming: Vec<Vec<ConnIdx>> = vec![Vec::new(); nodes.len()];
    for (i, conn) in doc.connections.iter().enumerate() {
        let idx = i as ConnIdx;
        let from = resolve(&conn.from)?;
        let to = resolve(&conn.to)?;
        outgoing[from as usize].push(idx);
        incoming[to as usize].push(idx);
        connections.push(Connection {
            idx,
            id: conn
                .id
                .clone()
                .unwrap_or_else(|| format!("{}->{}", conn.from, conn.to)),
            from,
            from_port: conn.from_port.clone(),
            to,
            to_port: conn.to_port.clone(),
            condition: conn.condition.clone(),
            is_default: conn.is_default,
        });
    }

    let mut boundaries: Vec<Vec<NodeIdx>> = vec![Vec::new(); nodes.len()];
    let mut children: HashMap<Option<NodeIdx>, Vec<NodeIdx>> = HashMap::new();
    for node in &nodes {
        if let NodeKind::Boundary(b) = &node.kind {
            boundaries[b.attached_to as usize].push(node.idx);
        }
        children.entry(node.container).or_default().push(node.idx);
    }

    // Node index i in the graph is arena node i.
    let mut graph: DiGraph<NodeIdx, ()> = DiGraph::with_capacity(nodes.len(), connections.len());
    for node in &nodes {
        graph.add_node(node.idx);
    }
    for conn in &connections {
        graph.add_edge(
            NodeIndex::new(conn.from as usize),
            NodeIndex::new(conn.to as usize),
            (),
        );
    }
    for (activity, attached) in boundaries.iter().enumerate() {
        for boundary in attached {
            graph.add_edge(NodeIndex::new(activity), NodeIndex::new(*boundary as usize), ());
        }
    }

    warn_unreachable(doc, &nodes, &graph);

    let canonical = serde_json::to_vec(doc).map_err(|e| EngineError::definition(&doc.id, e.to_string()))?;
    let version_hash: [u8; 32] = Sha256::digest(&canonical).into();

    tracing::debug!(
        process_id = %doc.id,
        version = %doc.version,
        nodes = nodes.len(),
        connections = connections.len(),
        "Compiled process definition"
    );

    Ok(ProcessDefinition {
        id: doc.id.clone(),
        version: doc.version.clone(),
        name: doc.name.clone().unwrap_or_else(|| doc.id.clone()),
        variables: doc.variables.clone(),
        version_hash,
        nodes,
        connections,
        by_id,
        outgoing,
        incoming,
        boundaries,
        children,
        graph,
    })
}

/// Warn about nodes no start, boundary, handler or event sub-process leads to.
fn warn_unreachable(doc: &DefinitionDoc, nodes: &[NodeDefinition], graph: &DiGraph<NodeIdx, ()>) {
    let mut roots: Vec<NodeIdx> = Vec::new();
    for node in nodes {
        match &node.kind {
            NodeKind::Start(_) | NodeKind::EventSubProcess => roots.push(node.idx),
            NodeKind::Boundary(b) => {
                roots.push(node.idx);
                roots.extend(b.handler);
            }
            _ => {}
        }
    }
    let Some(first) = roots.first() else {
        return;
    };
    let mut reached = vec![false; nodes.len()];
    let mut dfs = Dfs::new(graph, NodeIndex::new(*first as usize));
    for root in &roots {
        dfs.move_to(NodeIndex::new(*root as usize));
        while let Some(nx) = dfs.next(graph) {
            reached[nx.index()] = true;
        }
    }
    for node in nodes {
        if !reached[node.idx as usize] {
            tracing::warn!(
                process_id = %doc.id,
                node_id = %node.id,
                "Definition: node is unreachable from any start"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::doc::ConnectionDoc;

    fn node(id: &str, spec: NodeSpec) -> NodeDoc {
        NodeDoc::new(id, spec)
    }

    fn start() -> NodeSpec {
        NodeSpec::Start {
            trigger: None,
            interrupting: true,
            output_variable: None,
        }
    }

    fn end() -> NodeSpec {
        NodeSpec::End {
            terminate: false,
            throw: None,
        }
    }

    fn task(name: &str) -> NodeSpec {
        NodeSpec::Task {
            work_item: name.into(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    fn doc(nodes: Vec<NodeDoc>, connections: Vec<ConnectionDoc>) -> DefinitionDoc {
        DefinitionDoc {
            id: "p".into(),
            version: "1".into(),
            name: None,
            variables: Default::default(),
            nodes,
            connections,
        }
    }

    fn rules(d: &DefinitionDoc) -> Vec<String> {
        validate(d).into_iter().map(|e| e.rule).collect()
    }

    #[test]
    fn linear_process_compiles() {
        let d = doc(
            vec![node("s", start()), node("a", task("A")), node("e", end())],
            vec![ConnectionDoc::new("s", "a"), ConnectionDoc::new("a", "e")],
        );
        let def = compile(&d).unwrap();
        let a = def.by_id("a").unwrap().idx;
        assert_eq!(def.start_nodes(None), vec![0]);
        assert_eq!(def.outgoing(a).count(), 1);
        assert_eq!(def.incoming(a).len(), 1);
        assert!(def.can_reach(0, 2));
        assert!(!def.can_reach(2, 0));
        assert_eq!(def.version_hash_hex().len(), 64);
    }

    #[test]
    fn duplicate_ids_and_dangling_connections_are_rejected() {
        let d = doc(
            vec![node("s", start()), node("s", end())],
            vec![ConnectionDoc::new("s", "missing")],
        );
        let found = rules(&d);
        assert!(found.contains(&"D1".to_string()));
        assert!(found.contains(&"D3".to_string()));
        assert!(matches!(compile(&d), Err(EngineError::Definition { .. })));
    }

    #[test]
    fn cross_container_connection_is_rejected() {
        let mut inner_start = node("inner_s", start());
        inner_start.container = Some("sub".into());
        let d = doc(
            vec![
                node("s", start()),
                node("sub", NodeSpec::SubProcess),
                inner_start,
                node("e", end()),
            ],
            vec![ConnectionDoc::new("s", "sub"), ConnectionDoc::new("inner_s", "e")],
        );
        assert!(rules(&d).contains(&"D4".to_string()));
    }

    #[test]
    fn event_sub_process_needs_one_triggered_start() {
        let mut esp_start = node("esp_s", start());
        esp_start.container = Some("esp".into());
        let d = doc(
            vec![
                node("s", start()),
                node("e", end()),
                node("esp", NodeSpec::EventSubProcess),
                esp_start,
            ],
            vec![ConnectionDoc::new("s", "e")],
        );
        assert!(rules(&d).contains(&"D6".to_string()));
    }

    #[test]
    fn bad_timer_and_missing_handler_are_rejected() {
        let d = doc(
            vec![
                node("s", start()),
                node("a", task("A")),
                node(
                    "t",
                    NodeSpec::Boundary {
                        attached_to: "a".into(),
                        trigger: TriggerDoc::Timer("soon".into()),
                        cancel_activity: true,
                        output_variable: None,
                        handler: None,
                    },
                ),
                node(
                    "c",
                    NodeSpec::Boundary {
                        attached_to: "a".into(),
                        trigger: TriggerDoc::Compensation,
                        cancel_activity: false,
                        output_variable: None,
                        handler: None,
                    },
                ),
                node("e", end()),
            ],
            vec![ConnectionDoc::new("s", "a"), ConnectionDoc::new("a", "e")],
        );
        let found = rules(&d);
        assert!(found.contains(&"D7".to_string()));
        assert!(found.contains(&"D9".to_string()));
    }

    #[test]
    fn boundary_edges_take_part_in_reachability() {
        let d = doc(
            vec![
                node("s", start()),
                node("a", task("A")),
                node(
                    "t",
                    NodeSpec::Boundary {
                        attached_to: "a".into(),
                        trigger: TriggerDoc::Timer("PT1M".into()),
                        cancel_activity: true,
                        output_variable: None,
                        handler: None,
                    },
                ),
                node("late", end()),
                node("e", end()),
            ],
            vec![
                ConnectionDoc::new("s", "a"),
                ConnectionDoc::new("a", "e"),
                ConnectionDoc::new("t", "late"),
            ],
        );
        let def = compile(&d).unwrap();
        let a = def.by_id("a").unwrap().idx;
        let late = def.by_id("late").unwrap().idx;
        assert_eq!(def.boundaries_of(a).len(), 1);
        assert!(def.can_reach(a, late));
    }
}
