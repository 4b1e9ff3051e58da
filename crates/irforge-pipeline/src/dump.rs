use crate::{Graph, PipelineError};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, Id, Node as DotNode, NodeId, Stmt,
    Vertex,
};
use graphviz_rust::printer::PrinterContext;
use std::path::{Path, PathBuf};

/// Renders the graph as Graphviz DOT. Nodes show their operation and IR
/// type, edges their `out:in` ports; control edges are dashed.
pub fn render_dot(graph: &Graph) -> String {
    let mut stmts = Vec::with_capacity(graph.node_count() + graph.edge_count());

    for node in graph.nodes() {
        let label = match node.attrs.get_str("type") {
            Some(ir_type) if ir_type != node.op => format!("{}\\n{} ({ir_type})", node.id(), node.op),
            _ => format!("{}\\n{}", node.id(), node.op),
        };
        stmts.push(Stmt::Node(DotNode {
            id: node_id(node.id()),
            attributes: vec![
                attribute("label", &label),
                attribute("op", &node.op),
            ],
        }));
    }

    for edge in graph.edges() {
        let mut attributes = vec![attribute(
            "label",
            &format!("{}:{}", edge.from_port, edge.to_port),
        )];
        if edge.is_control() {
            attributes.push(attribute("style", "dashed"));
        }
        stmts.push(Stmt::Edge(DotEdge {
            ty: EdgeTy::Pair(Vertex::N(node_id(&edge.from)), Vertex::N(node_id(&edge.to))),
            attributes,
        }));
    }

    let dot = DotGraph::DiGraph {
        id: quoted(graph.name().unwrap_or("graph")),
        strict: false,
        stmts,
    };
    graphviz_rust::print(dot, &mut PrinterContext::default())
}

/// Writes `<dir>/<label>.dot`.
pub fn dump_graph(graph: &Graph, dir: &Path, label: &str) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(dir).map_err(|error| PipelineError::io(dir, error))?;
    let path = dir.join(format!("{label}.dot"));
    std::fs::write(&path, render_dot(graph)).map_err(|error| PipelineError::io(&path, error))?;
    tracing::debug!(path = %path.display(), "graph dumped");
    Ok(path)
}

fn node_id(name: &str) -> NodeId {
    NodeId(quoted(name), None)
}

fn attribute(key: &str, value: &str) -> Attribute {
    Attribute(Id::Plain(key.to_string()), quoted(value))
}

fn quoted(value: &str) -> Id {
    Id::Escaped(format!("\"{}\"", value.replace('"', "\\\"")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Edge, Node};

    fn sample_graph() -> Graph {
        let mut graph = Graph::new("sample");
        graph.add_node(Node::new("scope/a", "Const")).expect("a");
        graph.add_node(Node::new("b", "Relu")).expect("b");
        graph.add_node(Node::new("init", "NoOp")).expect("init");
        graph.connect("scope/a", 0, "b", 0).expect("a->b");
        graph.add_edge(Edge::control("init", "b", 1)).expect("init->b");
        graph
    }

    #[test]
    fn render_dot_expected_ports_and_dashed_control_edges() {
        let dot = render_dot(&sample_graph());

        assert!(dot.contains("\"scope/a\""));
        assert!(dot.contains("\"0:0\""));
        assert!(dot.contains("dashed"));
    }

    #[test]
    fn dump_graph_expected_file_reparses_as_dot() {
        let dir = tempfile::tempdir().expect("temp dir should be created");

        let path = dump_graph(&sample_graph(), dir.path(), "00_loaded").expect("dump should succeed");

        assert_eq!(path, dir.path().join("00_loaded.dot"));
        let text = std::fs::read_to_string(&path).expect("dump should exist");
        graphviz_rust::parse(&text).expect("dump should be valid DOT");
    }
}
