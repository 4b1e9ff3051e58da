use crate::{Edge, EdgeKind, Graph, PipelineError, RawNode, parse_input_spec};
use std::collections::BTreeSet;

/// One incoming connection as declared by a framework node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredInput {
    pub peer: String,
    pub peer_port: usize,
    pub port: usize,
    pub control: bool,
}

/// Default edge source: reads `peer`, `peer:N` and `^peer` declarations; the
/// position in the list is the destination port.
pub fn declared_inputs(node: &RawNode) -> Result<Vec<DeclaredInput>, PipelineError> {
    node.inputs
        .iter()
        .enumerate()
        .map(|(port, input)| {
            let spec = parse_input_spec(input).map_err(|reason| PipelineError::MalformedEdge {
                node_id: node.name.clone(),
                peer_id: input.clone(),
                reason,
            })?;
            Ok(DeclaredInput {
                peer: spec.peer,
                peer_port: spec.peer_port,
                port,
                control: spec.control,
            })
        })
        .collect()
}

/// Inserts the edges every node declares for itself. Nodes without a raw
/// framework node contribute nothing.
pub fn restore_edges<F>(graph: &mut Graph, edge_source: F) -> Result<usize, PipelineError>
where
    F: Fn(&RawNode) -> Result<Vec<DeclaredInput>, PipelineError>,
{
    let raw_nodes: Vec<RawNode> = graph.nodes().filter_map(|node| node.raw.clone()).collect();
    let mut restored = 0;

    for raw in &raw_nodes {
        for input in edge_source(raw)? {
            if !graph.contains_node(&input.peer) {
                return Err(PipelineError::MalformedEdge {
                    node_id: raw.name.clone(),
                    peer_id: input.peer,
                    reason: "no node with that name exists".to_string(),
                });
            }
            let kind = if input.control {
                EdgeKind::Control
            } else {
                EdgeKind::Data
            };
            graph.add_edge(Edge {
                from: input.peer,
                from_port: input.peer_port,
                to: raw.name.clone(),
                to_port: input.port,
                kind,
            })?;
            restored += 1;
        }
    }

    Ok(restored)
}

/// Drops control edges whose endpoints are already linked by a data edge.
pub fn remove_control_dependency_inputs(graph: &mut Graph) -> usize {
    let data_pairs: BTreeSet<(String, String)> = graph
        .edges()
        .iter()
        .filter(|edge| edge.is_data())
        .map(|edge| (edge.from.clone(), edge.to.clone()))
        .collect();

    let removed = graph.remove_edges_where(|edge| {
        edge.is_control() && data_pairs.contains(&(edge.from.clone(), edge.to.clone()))
    });
    if removed > 0 {
        tracing::debug!(removed, "redundant control dependencies removed");
    }
    removed
}
