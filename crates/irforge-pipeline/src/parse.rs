//! Graphviz DOT as a model interchange format.
//!
//! Nodes carry the framework operation in an `op` attribute; every other
//! attribute is copied onto the raw node. Edges describe data flow and may be
//! addressed with `out` (producer output port), `in` (consumer input port)
//! and `control=true`:
//!
//! ```dot
//! digraph mnist {
//!     x    [op=Placeholder, shape="[1,28,28,1]"]
//!     w    [op=Const, value="[0.5, 0.25]"]
//!     conv [op=Conv2D, padding=SAME, strides="[1,1,1,1]"]
//!     x -> conv [in=0]
//!     w -> conv [in=1]
//! }
//! ```

use crate::{AttrValue, PipelineError, RawGraph, RawNode};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Vertex,
};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct PendingNode {
    op: Option<String>,
    attrs: BTreeMap<String, AttrValue>,
}

#[derive(Debug)]
struct PendingEdge {
    from: String,
    to: String,
    out_port: usize,
    in_port: Option<usize>,
    control: bool,
}

#[derive(Debug, Default)]
struct ParseState {
    order: Vec<String>,
    nodes: BTreeMap<String, PendingNode>,
    edges: Vec<PendingEdge>,
}

impl ParseState {
    fn touch(&mut self, name: &str) -> &mut PendingNode {
        if !self.nodes.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.nodes.entry(name.to_string()).or_default()
    }
}

pub fn parse_raw_dot(source: &str) -> Result<RawGraph, PipelineError> {
    let dot_graph = graphviz_rust::parse(source)
        .map_err(|error| invalid(format!("DOT parse error: {error}")))?;

    let (id, stmts) = match dot_graph {
        DotGraph::DiGraph { strict: true, .. } => {
            return Err(invalid("'strict' graphs are not supported"));
        }
        DotGraph::DiGraph { id, stmts, .. } => (id, stmts),
        DotGraph::Graph { .. } => return Err(invalid("only 'digraph' models are supported")),
    };

    let mut state = ParseState::default();
    process_statements(&mut state, &stmts, &BTreeMap::new())?;
    finish(state, graph_name(&id)?)
}

fn graph_name(id: &Id) -> Result<Option<String>, PipelineError> {
    match id {
        Id::Anonymous(_) => Ok(None),
        other => id_to_string(other).map(|name| Some(name).filter(|name| !name.is_empty())),
    }
}

fn process_statements(
    state: &mut ParseState,
    stmts: &[Stmt],
    inherited_defaults: &BTreeMap<String, AttrValue>,
) -> Result<(), PipelineError> {
    let mut node_defaults = inherited_defaults.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(GraphAttributes::Node(attrs)) => {
                node_defaults.extend(parse_attributes(attrs)?);
            }
            Stmt::GAttribute(_) | Stmt::Attribute(_) => {}
            Stmt::Node(node) => process_node_stmt(state, node, &node_defaults)?,
            Stmt::Edge(edge) => process_edge_stmt(state, edge)?,
            Stmt::Subgraph(subgraph) => {
                process_statements(state, &subgraph.stmts, &node_defaults)?;
            }
        }
    }
    Ok(())
}

fn process_node_stmt(
    state: &mut ParseState,
    node: &DotNode,
    defaults: &BTreeMap<String, AttrValue>,
) -> Result<(), PipelineError> {
    let name = parse_node_id(&node.id)?;
    let mut attrs = defaults.clone();
    attrs.extend(parse_attributes(&node.attributes)?);

    let pending = state.touch(&name);
    for (key, value) in attrs {
        if key == "op" {
            let op = value.as_str().map(str::to_string).ok_or_else(|| {
                invalid(format!("node '{name}' has a non-string 'op' attribute"))
            })?;
            pending.op = Some(op);
        } else {
            pending.attrs.insert(key, value);
        }
    }
    Ok(())
}

fn process_edge_stmt(state: &mut ParseState, edge: &DotEdge) -> Result<(), PipelineError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => chain
            .iter()
            .map(parse_vertex)
            .collect::<Result<Vec<_>, _>>()?,
    };

    let attrs = parse_attributes(&edge.attributes)?;
    let out_port = port_attr(&attrs, "out")?.unwrap_or(0);
    let in_port = port_attr(&attrs, "in")?;
    let control = match attrs.get("control") {
        None => false,
        Some(value) => value
            .as_bool()
            .ok_or_else(|| invalid("edge attribute 'control' must be true or false"))?,
    };
    if vertices.len() > 2 && in_port.is_some() {
        return Err(invalid("edge chains cannot carry an 'in' port"));
    }

    for pair in vertices.windows(2) {
        state.touch(&pair[0]);
        state.touch(&pair[1]);
        state.edges.push(PendingEdge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            out_port,
            in_port,
            control,
        });
    }
    Ok(())
}

/// Turns the collected edges into per-node input declarations. Explicit `in`
/// ports claim their slot; unaddressed edges fill the free slots in the order
/// they were written. Control inputs follow all data inputs.
fn finish(state: ParseState, name: Option<String>) -> Result<RawGraph, PipelineError> {
    let mut data_inputs: BTreeMap<&str, (BTreeMap<usize, String>, Vec<String>)> = BTreeMap::new();
    let mut control_inputs: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for edge in &state.edges {
        if edge.control {
            control_inputs
                .entry(edge.to.as_str())
                .or_default()
                .push(format!("^{}", edge.from));
            continue;
        }
        let declaration = if edge.out_port == 0 {
            edge.from.clone()
        } else {
            format!("{}:{}", edge.from, edge.out_port)
        };
        let (addressed, unaddressed) = data_inputs.entry(edge.to.as_str()).or_default();
        match edge.in_port {
            Some(port) => {
                if addressed.insert(port, declaration).is_some() {
                    return Err(invalid(format!(
                        "input port {port} of node '{}' has more than one producer",
                        edge.to
                    )));
                }
            }
            None => unaddressed.push(declaration),
        }
    }

    let mut nodes = Vec::with_capacity(state.order.len());
    for node_name in &state.order {
        let Some(pending) = state.nodes.get(node_name) else {
            continue;
        };
        let op = pending
            .op
            .clone()
            .ok_or_else(|| invalid(format!("node '{node_name}' has no 'op' attribute")))?;

        let mut inputs = match data_inputs.remove(node_name.as_str()) {
            Some((addressed, unaddressed)) => order_inputs(node_name, addressed, unaddressed)?,
            None => Vec::new(),
        };
        inputs.extend(control_inputs.remove(node_name.as_str()).unwrap_or_default());

        nodes.push(RawNode {
            name: node_name.clone(),
            op,
            inputs,
            attrs: pending.attrs.clone(),
        });
    }

    Ok(RawGraph { name, nodes })
}

fn order_inputs(
    node_name: &str,
    mut addressed: BTreeMap<usize, String>,
    unaddressed: Vec<String>,
) -> Result<Vec<String>, PipelineError> {
    let total = addressed.len() + unaddressed.len();
    let mut unaddressed = unaddressed.into_iter();
    let mut inputs = Vec::with_capacity(total);
    for port in 0..total {
        match addressed.remove(&port).or_else(|| unaddressed.next()) {
            Some(declaration) => inputs.push(declaration),
            None => break,
        }
    }
    if let Some(port) = addressed.keys().next() {
        return Err(invalid(format!(
            "input port {port} of node '{node_name}' leaves a gap; it has {total} input(s)"
        )));
    }
    Ok(inputs)
}

fn port_attr(attrs: &BTreeMap<String, AttrValue>, key: &str) -> Result<Option<usize>, PipelineError> {
    match attrs.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|port| usize::try_from(port).ok())
            .map(Some)
            .ok_or_else(|| invalid(format!("edge attribute '{key}' must be a port number"))),
    }
}

fn parse_vertex(vertex: &Vertex) -> Result<String, PipelineError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(invalid("subgraph vertices in edge statements are not supported")),
    }
}

fn parse_node_id(node_id: &NodeId) -> Result<String, PipelineError> {
    if node_id.1.is_some() {
        return Err(invalid(
            "DOT ports are not supported; use the 'out' and 'in' edge attributes",
        ));
    }
    let name = id_to_string(&node_id.0)?;
    if name.is_empty() || name.starts_with('^') || name.contains(':') {
        return Err(invalid(format!(
            "node name '{name}' is invalid; names must be non-empty and contain no ':' or leading '^'"
        )));
    }
    Ok(name)
}

fn parse_attributes(attrs: &[Attribute]) -> Result<BTreeMap<String, AttrValue>, PipelineError> {
    let mut parsed = BTreeMap::new();
    for Attribute(key, value) in attrs {
        parsed.insert(id_to_string(key)?, parse_attr_value(value)?);
    }
    Ok(parsed)
}

fn parse_attr_value(id: &Id) -> Result<AttrValue, PipelineError> {
    match id {
        Id::Html(_) => Err(invalid("HTML attribute values are not supported")),
        Id::Escaped(_) => {
            let value = id_to_string(id)?;
            let trimmed = value.trim();
            match trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                Some(inner) if inner.trim().is_empty() => Ok(AttrValue::List(Vec::new())),
                Some(inner) => Ok(AttrValue::List(
                    inner.split(',').map(|item| parse_scalar(item.trim())).collect(),
                )),
                None => Ok(AttrValue::String(value)),
            }
        }
        Id::Plain(raw) => Ok(parse_scalar(raw)),
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

fn parse_scalar(raw: &str) -> AttrValue {
    match raw {
        "true" => AttrValue::Boolean(true),
        "false" => AttrValue::Boolean(false),
        _ => {
            if let Ok(value) = raw.parse::<i64>() {
                AttrValue::Integer(value)
            } else if let Ok(value) = raw.parse::<f64>() {
                AttrValue::Float(value)
            } else {
                AttrValue::String(raw.to_string())
            }
        }
    }
}

fn id_to_string(id: &Id) -> Result<String, PipelineError> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .map(|inner| inner.replace("\\\"", "\"").replace("\\\\", "\\"))
            .ok_or_else(|| invalid(format!("escaped string id '{value}' is missing quotes"))),
        Id::Html(_) => Err(invalid("HTML identifiers are not supported")),
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidInput(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node<'a>(graph: &'a RawGraph, name: &str) -> &'a RawNode {
        graph
            .nodes
            .iter()
            .find(|node| node.name == name)
            .expect("node should exist")
    }

    #[test]
    fn parse_raw_dot_ports_expected_framework_input_declarations() {
        let graph = parse_raw_dot(
            r#"
            digraph m {
                split [op=Split, num_split=2]
                init  [op=NoOp]
                c     [op=Add]
                split -> c [out=1, in=1]
                split -> c [in=0]
                init -> c [control=true]
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.name.as_deref(), Some("m"));
        assert_eq!(node(&graph, "c").inputs, vec!["split", "split:1", "^init"]);
        assert_eq!(
            node(&graph, "split").attrs.get("num_split"),
            Some(&AttrValue::Integer(2))
        );
    }

    #[test]
    fn parse_raw_dot_quoted_scoped_names_and_lists_expected_preserved() {
        let graph = parse_raw_dot(
            r#"
            digraph {
                "conv1/weights" [op=Const, value="[0.5, 1, -2.25]"]
                "conv1/Conv2D" [op=Conv2D, padding=SAME, strides="[1,2,2,1]"]
                "conv1/weights" -> "conv1/Conv2D" [in=1]
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.name, None);
        let weights = node(&graph, "conv1/weights");
        assert_eq!(
            weights.attrs.get("value"),
            Some(&AttrValue::List(vec![
                AttrValue::Float(0.5),
                AttrValue::Integer(1),
                AttrValue::Float(-2.25),
            ]))
        );
        let conv = node(&graph, "conv1/Conv2D");
        assert_eq!(conv.attrs.get("strides"), Some(&AttrValue::int_list([1, 2, 2, 1])));
    }

    #[test]
    fn parse_raw_dot_node_without_op_expected_invalid_input() {
        let error = parse_raw_dot("digraph { a [op=Const, value=1] a -> b }")
            .expect_err("b has no op");
        assert!(error.to_string().contains("'b'"));
    }

    #[test]
    fn parse_raw_dot_port_gap_expected_invalid_input() {
        let error = parse_raw_dot(
            "digraph { a [op=Const, value=1] b [op=Relu] a -> b [in=2] }",
        )
        .expect_err("port 2 without 0 and 1 must fail");
        assert!(error.to_string().contains("gap"));
    }

    #[test]
    fn parse_raw_dot_undirected_graph_expected_error() {
        let error = parse_raw_dot("graph { a -- b }").expect_err("must fail");
        assert!(error.to_string().contains("digraph"));
    }

    #[test]
    fn parse_raw_dot_node_defaults_expected_applied() {
        let graph = parse_raw_dot(
            "digraph { node [op=Relu] a b [data_format=NCHW] a -> b }",
        )
        .expect("graph should parse");

        assert_eq!(node(&graph, "a").op, "Relu");
        assert_eq!(node(&graph, "b").inputs, vec!["a"]);
    }
}
