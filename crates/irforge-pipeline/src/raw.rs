//! Framework-level node list as handed over by a loader, before any
//! normalization.

use crate::{
    AttrValue, Diagnostic, Graph, Node, PipelineError, Severity, TensorValue, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub name: String,
    pub op: String,
    /// Input declarations in framework syntax: `peer`, `peer:port`, `^peer`.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl RawNode {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawGraph {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedModel {
    pub graph: RawGraph,
    pub variables: BTreeMap<String, TensorValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSpec {
    pub peer: String,
    pub peer_port: usize,
    pub control: bool,
}

pub fn parse_input_spec(spec: &str) -> Result<InputSpec, String> {
    let spec = spec.trim();
    if let Some(peer) = spec.strip_prefix('^') {
        if peer.is_empty() {
            return Err("control input is missing a node name".to_string());
        }
        return Ok(InputSpec {
            peer: peer.to_string(),
            peer_port: 0,
            control: true,
        });
    }

    match spec.rsplit_once(':') {
        Some((peer, port)) => {
            let peer_port = port
                .parse::<usize>()
                .map_err(|_| format!("output port '{port}' is not a non-negative integer"))?;
            if peer.is_empty() {
                return Err("input is missing a node name".to_string());
            }
            Ok(InputSpec {
                peer: peer.to_string(),
                peer_port,
                control: false,
            })
        }
        None if spec.is_empty() => Err("input declaration is empty".to_string()),
        None => Ok(InputSpec {
            peer: spec.to_string(),
            peer_port: 0,
            control: false,
        }),
    }
}

impl RawGraph {
    /// Keeps only the nodes the requested outputs transitively depend on.
    pub fn prune_to_outputs(&self, outputs: &[String]) -> Result<RawGraph, String> {
        let by_name: BTreeMap<&str, &RawNode> = self
            .nodes
            .iter()
            .map(|node| (node.name.as_str(), node))
            .collect();

        let mut keep = BTreeSet::new();
        let mut queue = VecDeque::new();
        for output in outputs {
            let name = output.split(':').next().unwrap_or(output);
            if !by_name.contains_key(name) {
                return Err(format!("requested output node '{name}' is not in the model"));
            }
            queue.push_back(name.to_string());
        }

        while let Some(name) = queue.pop_front() {
            if !keep.insert(name.clone()) {
                continue;
            }
            let Some(node) = by_name.get(name.as_str()) else {
                continue;
            };
            for input in &node.inputs {
                if let Ok(spec) = parse_input_spec(input) {
                    queue.push_back(spec.peer);
                }
            }
        }

        Ok(RawGraph {
            name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .filter(|node| keep.contains(&node.name))
                .cloned()
                .collect(),
        })
    }
}

/// Builds the node set of the internal graph. Edges are restored separately.
pub fn build_graph(raw: &RawGraph, name: &str) -> Result<Graph, PipelineError> {
    let mut graph = Graph::new(name);
    for node in &raw.nodes {
        graph.add_node(Node::from_raw(node.clone()))?;
    }
    Ok(graph)
}

/// Consistency re-check of the loaded node list, independent of graph
/// construction. Callers treat a failure as advisory.
pub fn validate_raw_graph(raw: &RawGraph) -> Result<(), ValidationError> {
    let mut diagnostics = Vec::new();
    let mut names = BTreeSet::new();

    for node in &raw.nodes {
        if !names.insert(node.name.as_str()) {
            diagnostics.push(
                Diagnostic::new(
                    "raw_unique_names",
                    Severity::Error,
                    format!("node name '{}' is declared more than once", node.name),
                )
                .with_node_id(node.name.clone()),
            );
        }
        if node.op.trim().is_empty() {
            diagnostics.push(
                Diagnostic::new("raw_op_present", Severity::Error, "node has no operation")
                    .with_node_id(node.name.clone()),
            );
        }
    }

    for node in &raw.nodes {
        for input in &node.inputs {
            match parse_input_spec(input) {
                Ok(spec) if !names.contains(spec.peer.as_str()) => diagnostics.push(
                    Diagnostic::new(
                        "raw_input_exists",
                        Severity::Error,
                        format!("input '{input}' refers to a node that is not in the model"),
                    )
                    .with_node_id(node.name.clone()),
                ),
                Ok(_) => {}
                Err(message) => diagnostics.push(
                    Diagnostic::new("raw_input_syntax", Severity::Error, message)
                        .with_node_id(node.name.clone()),
                ),
            }
        }
    }

    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(())
}
