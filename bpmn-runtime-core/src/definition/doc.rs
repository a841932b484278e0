//! Serde document form of a process definition (YAML or JSON).
//!
//! Documents reference nodes by string id; `compile` resolves them into the
//! arena-indexed `ProcessDefinition`.

use super::model::{DataMapping, GatewayDirection, GatewayType, MetaValue, ThrowEvent};
use crate::types::{Variables, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1".to_string()
}

fn default_port() -> String {
    DEFAULT_PORT.to_string()
}

fn is_false(v: &bool) -> bool {
    !v
}

fn is_default_port(p: &str) -> bool {
    p == DEFAULT_PORT
}

// ── Top-level document ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionDoc {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared variables with their initial values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: Variables,
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub connections: Vec<ConnectionDoc>,
}

impl DefinitionDoc {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Parsing definition YAML")
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Parsing definition JSON")
    }

    /// Load a `.yaml`/`.yml`/`.json` document.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let doc = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Parsing {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Parsing {}", path.display()))?,
        };
        Ok(doc)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing definition YAML")
    }
}

// ── Connection ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default = "default_port", skip_serializing_if = "is_default_port")]
    pub from_port: String,
    #[serde(default = "default_port", skip_serializing_if = "is_default_port")]
    pub to_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl ConnectionDoc {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: None,
            from: from.into(),
            to: to.into(),
            from_port: default_port(),
            to_port: default_port(),
            condition: None,
            is_default: false,
        }
    }
}

// ── Triggers ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDoc {
    Signal(String),
    Message(String),
    /// Timer expression (`PT5S`, `R3/PT1M`, RFC 3339 date).
    Timer(String),
    Error(Option<String>),
    Escalation(Option<String>),
    Compensation,
}

// ── Node ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the enclosing sub-process or event sub-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetaValue>,
    #[serde(flatten)]
    pub spec: NodeSpec,
}

impl NodeDoc {
    pub fn new(id: impl Into<String>, spec: NodeSpec) -> Self {
        Self {
            id: id.into(),
            name: None,
            container: None,
            metadata: BTreeMap::new(),
            spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSpec {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<TriggerDoc>,
        #[serde(default = "default_true")]
        interrupting: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    End {
        #[serde(default, skip_serializing_if = "is_false")]
        terminate: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        throw: Option<ThrowEvent>,
    },
    Gateway {
        gateway_type: GatewayType,
        direction: GatewayDirection,
    },
    Task {
        work_item: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<DataMapping>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<DataMapping>,
    },
    Script {
        action: String,
    },
    Catch {
        trigger: TriggerDoc,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_variable: Option<String>,
    },
    Throw {
        event: ThrowEvent,
    },
    Boundary {
        attached_to: String,
        trigger: TriggerDoc,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
        /// Compensation handler node (compensation boundaries only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
    },
    SubProcess,
    EventSubProcess,
    CallActivity {
        process_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default = "default_true")]
        wait_for_completion: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        independent: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<DataMapping>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<DataMapping>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_document_parses() {
        let yaml = r#"
id: order
version: "2"
variables:
  approved: false
nodes:
  - id: start
    kind: start
  - id: review
    kind: task
    work_item: Review
  - id: review_timeout
    kind: boundary
    attached_to: review
    trigger:
      timer: PT1H
  - id: split
    kind: gateway
    gateway_type: exclusive
    direction: split
  - id: done
    kind: end
connections:
  - { from: start, to: review }
  - { from: review, to: split }
  - { from: split, to: done, condition: "approved == true" }
  - { from: review_timeout, to: done }
"#;
        let doc = DefinitionDoc::from_yaml_str(yaml).unwrap();
        assert_eq!(doc.version, "2");
        assert_eq!(doc.nodes.len(), 5);
        match &doc.nodes[2].spec {
            NodeSpec::Boundary {
                trigger,
                cancel_activity,
                ..
            } => {
                assert_eq!(trigger, &TriggerDoc::Timer("PT1H".into()));
                assert!(*cancel_activity);
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert_eq!(doc.connections[0].from_port, DEFAULT_PORT);
    }

    #[test]
    fn json_document_parses() {
        let json = r#"{
            "id": "p",
            "nodes": [
                {"id": "s", "kind": "start", "trigger": {"signal": "go"}},
                {"id": "e", "kind": "end", "throw": {"error": "E1"}}
            ],
            "connections": [{"from": "s", "to": "e"}]
        }"#;
        let doc = DefinitionDoc::from_json_str(json).unwrap();
        assert_eq!(doc.version, "1");
        assert!(matches!(
            &doc.nodes[1].spec,
            NodeSpec::End { throw: Some(ThrowEvent::Error(code)), .. } if code == "E1"
        ));
    }
}
