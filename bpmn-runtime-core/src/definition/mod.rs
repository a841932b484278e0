//! Immutable process definitions.
//!
//! A definition is an arena of `NodeDefinition`s and `Connection`s addressed
//! by small integer indices, so cyclic graphs carry no ownership cycles and a
//! compiled definition can be shared across sessions behind an `Arc`.

pub mod builder;
pub mod compile;
pub mod doc;
pub mod model;

pub use builder::ProcessBuilder;
pub use compile::{compile, validate, ValidationError};
pub use doc::{ConnectionDoc, DefinitionDoc, NodeDoc, NodeSpec, TriggerDoc};
pub use model::*;

use crate::types::{ConnIdx, NodeIdx, Variables};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub id: String,
    pub version: String,
    pub name: String,
    /// Initial values of declared variables.
    pub variables: Variables,
    /// SHA-256 of the canonical JSON form of the source document.
    pub version_hash: [u8; 32],
    pub(crate) nodes: Vec<NodeDefinition>,
    pub(crate) connections: Vec<Connection>,
    pub(crate) by_id: HashMap<String, NodeIdx>,
    pub(crate) outgoing: Vec<Vec<ConnIdx>>,
    pub(crate) incoming: Vec<Vec<ConnIdx>>,
    pub(crate) boundaries: Vec<Vec<NodeIdx>>,
    pub(crate) children: HashMap<Option<NodeIdx>, Vec<NodeIdx>>,
    /// Connection graph plus activity -> boundary edges. Graph index `i`
    /// is arena node `i`.
    pub(crate) graph: DiGraph<NodeIdx, ()>,
}

impl ProcessDefinition {
    pub fn node(&self, idx: NodeIdx) -> &NodeDefinition {
        &self.nodes[idx as usize]
    }

    pub fn connection(&self, idx: ConnIdx) -> &Connection {
        &self.connections[idx as usize]
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn by_id(&self, id: &str) -> Option<&NodeDefinition> {
        self.by_id.get(id).map(|idx| self.node(*idx))
    }

    pub fn outgoing(&self, idx: NodeIdx) -> impl Iterator<Item = &Connection> + '_ {
        self.outgoing[idx as usize]
            .iter()
            .map(move |c| self.connection(*c))
    }

    /// Outgoing connections leaving through `port`.
    pub fn outgoing_on<'a>(
        &'a self,
        idx: NodeIdx,
        port: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.outgoing(idx).filter(move |c| c.from_port == port)
    }

    pub fn incoming(&self, idx: NodeIdx) -> &[ConnIdx] {
        &self.incoming[idx as usize]
    }

    pub fn boundaries_of(&self, idx: NodeIdx) -> &[NodeIdx] {
        &self.boundaries[idx as usize]
    }

    /// Direct children of a composite node, or the top level for `None`.
    pub fn children_of(&self, container: Option<NodeIdx>) -> &[NodeIdx] {
        self.children
            .get(&container)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Untriggered start nodes entered when `container` starts.
    pub fn start_nodes(&self, container: Option<NodeIdx>) -> Vec<NodeIdx> {
        self.children_of(container)
            .iter()
            .copied()
            .filter(|idx| matches!(&self.node(*idx).kind, NodeKind::Start(s) if s.trigger.is_none()))
            .collect()
    }

    /// Top-level start nodes that carry a trigger. These become
    /// definition-level subscriptions in every session.
    pub fn triggered_starts(&self) -> impl Iterator<Item = (&NodeDefinition, &StartNode)> + '_ {
        self.children_of(None).iter().filter_map(|idx| {
            let node = self.node(*idx);
            match &node.kind {
                NodeKind::Start(start) if start.trigger.is_some() => Some((node, start)),
                _ => None,
            }
        })
    }

    pub fn event_sub_processes(&self, container: Option<NodeIdx>) -> Vec<NodeIdx> {
        self.children_of(container)
            .iter()
            .copied()
            .filter(|idx| matches!(self.node(*idx).kind, NodeKind::EventSubProcess))
            .collect()
    }

    /// The single triggered start of an event sub-process.
    pub fn event_sub_process_start(&self, esp: NodeIdx) -> Option<(&NodeDefinition, &StartNode)> {
        self.children_of(Some(esp)).iter().find_map(|idx| {
            let node = self.node(*idx);
            match &node.kind {
                NodeKind::Start(start) if start.trigger.is_some() => Some((node, start)),
                _ => None,
            }
        })
    }

    /// True if a token at `from` can still arrive at `to`.
    pub fn can_reach(&self, from: NodeIdx, to: NodeIdx) -> bool {
        has_path_connecting(
            &self.graph,
            NodeIndex::new(from as usize),
            NodeIndex::new(to as usize),
            None,
        )
    }

    pub fn version_hash_hex(&self) -> String {
        self.version_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}
