use super::doc::{ConnectionDoc, DefinitionDoc, NodeDoc, NodeSpec, TriggerDoc};
use super::model::{DataMapping, GatewayDirection, GatewayType, MetaValue, ThrowEvent};
use super::{compile, ProcessDefinition};
use crate::error::EngineResult;
use crate::types::Variables;

/// Fluent construction of definition documents in code.
///
/// Nodes added between `enter(container)` and `leave()` are placed inside
/// that composite node.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    doc: DefinitionDoc,
    scope: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            doc: DefinitionDoc {
                id: id.into(),
                version: "1".to_string(),
                name: None,
                variables: Variables::new(),
                nodes: Vec::new(),
                connections: Vec::new(),
            },
            scope: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.doc.version = version.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.doc.name = Some(name.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.doc.variables.insert(name.into(), value);
        self
    }

    /// Add a node of any kind in the current scope.
    pub fn node(mut self, id: impl Into<String>, spec: NodeSpec) -> Self {
        let mut node = NodeDoc::new(id, spec);
        node.container = self.scope.last().cloned();
        self.doc.nodes.push(node);
        self
    }

    /// Attach metadata to the most recently added node.
    pub fn meta(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        if let Some(node) = self.doc.nodes.last_mut() {
            node.metadata.insert(key.into(), value);
        }
        self
    }

    pub fn enter(mut self, container: impl Into<String>) -> Self {
        self.scope.push(container.into());
        self
    }

    pub fn leave(mut self) -> Self {
        self.scope.pop();
        self
    }

    // ── Node shorthands ──

    pub fn start(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeSpec::Start {
                trigger: None,
                interrupting: true,
                output_variable: None,
            },
        )
    }

    pub fn triggered_start(self, id: impl Into<String>, trigger: TriggerDoc, interrupting: bool) -> Self {
        self.node(
            id,
            NodeSpec::Start {
                trigger: Some(trigger),
                interrupting,
                output_variable: None,
            },
        )
    }

    pub fn end(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeSpec::End {
                terminate: false,
                throw: None,
            },
        )
    }

    pub fn terminate_end(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeSpec::End {
                terminate: true,
                throw: None,
            },
        )
    }

    pub fn throwing_end(self, id: impl Into<String>, event: ThrowEvent) -> Self {
        self.node(
            id,
            NodeSpec::End {
                terminate: false,
                throw: Some(event),
            },
        )
    }

    pub fn task(self, id: impl Into<String>, work_item: impl Into<String>) -> Self {
        self.task_mapped(id, work_item, Vec::new(), Vec::new())
    }

    pub fn task_mapped(
        self,
        id: impl Into<String>,
        work_item: impl Into<String>,
        inputs: Vec<DataMapping>,
        outputs: Vec<DataMapping>,
    ) -> Self {
        self.node(
            id,
            NodeSpec::Task {
                work_item: work_item.into(),
                inputs,
                outputs,
            },
        )
    }

    pub fn script(self, id: impl Into<String>, action: impl Into<String>) -> Self {
        self.node(
            id,
            NodeSpec::Script {
                action: action.into(),
            },
        )
    }

    pub fn gateway(self, id: impl Into<String>, gateway_type: GatewayType, direction: GatewayDirection) -> Self {
        self.node(
            id,
            NodeSpec::Gateway {
                gateway_type,
                direction,
            },
        )
    }

    pub fn catch(self, id: impl Into<String>, trigger: TriggerDoc) -> Self {
        self.node(
            id,
            NodeSpec::Catch {
                trigger,
                output_variable: None,
                correlation_variable: None,
            },
        )
    }

    pub fn throw(self, id: impl Into<String>, event: ThrowEvent) -> Self {
        self.node(id, NodeSpec::Throw { event })
    }

    pub fn boundary(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        trigger: TriggerDoc,
        cancel_activity: bool,
    ) -> Self {
        self.node(
            id,
            NodeSpec::Boundary {
                attached_to: attached_to.into(),
                trigger,
                cancel_activity,
                output_variable: None,
                handler: None,
            },
        )
    }

    pub fn compensation(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        self.node(
            id,
            NodeSpec::Boundary {
                attached_to: attached_to.into(),
                trigger: TriggerDoc::Compensation,
                cancel_activity: false,
                output_variable: None,
                handler: Some(handler.into()),
            },
        )
    }

    pub fn sub_process(self, id: impl Into<String>) -> Self {
        self.node(id, NodeSpec::SubProcess)
    }

    pub fn event_sub_process(self, id: impl Into<String>) -> Self {
        self.node(id, NodeSpec::EventSubProcess)
    }

    pub fn call_activity(self, id: impl Into<String>, process_id: impl Into<String>) -> Self {
        self.call_activity_with(id, process_id, true, false, Vec::new(), Vec::new())
    }

    pub fn call_activity_with(
        self,
        id: impl Into<String>,
        process_id: impl Into<String>,
        wait_for_completion: bool,
        independent: bool,
        inputs: Vec<DataMapping>,
        outputs: Vec<DataMapping>,
    ) -> Self {
        self.node(
            id,
            NodeSpec::CallActivity {
                process_id: process_id.into(),
                version: None,
                wait_for_completion,
                independent,
                inputs,
                outputs,
            },
        )
    }

    // ── Connections ──

    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.doc.connections.push(ConnectionDoc::new(from, to));
        self
    }

    pub fn connect_when(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        let mut conn = ConnectionDoc::new(from, to);
        conn.condition = Some(condition.into());
        self.doc.connections.push(conn);
        self
    }

    pub fn connect_default(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let mut conn = ConnectionDoc::new(from, to);
        conn.is_default = true;
        self.doc.connections.push(conn);
        self
    }

    /// Connect the ids in order: `a -> b -> c`.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.doc.connections.push(ConnectionDoc::new(pair[0], pair[1]));
        }
        self
    }

    pub fn into_doc(self) -> DefinitionDoc {
        self.doc
    }

    pub fn build(self) -> EngineResult<ProcessDefinition> {
        compile(&self.doc)
    }
}
