use crate::{
    Diagnostic, EdgeFilter, Graph, META_IR_VERSION, META_LAYOUT, META_NAME, Severity,
    ValidationError,
};
use std::collections::BTreeMap;

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

/// Structural checks run on the final graph before it is handed to an
/// emitter.
pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_single_producer_per_input_port(graph));
    diagnostics.extend(rule_node_type_resolved(graph));
    diagnostics.extend(rule_required_metadata(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in graph.edges() {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.contains_node(endpoint) {
                diagnostics.push(
                    Diagnostic::new(
                        "edge_endpoints_exist",
                        Severity::Error,
                        format!("edge endpoint '{endpoint}' does not exist"),
                    )
                    .with_edge(edge),
                );
            }
        }
    }
    diagnostics
}

fn rule_single_producer_per_input_port(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes() {
        let mut producers: BTreeMap<usize, usize> = BTreeMap::new();
        for edge in graph.in_edges(node.id(), EdgeFilter::DataOnly) {
            *producers.entry(edge.to_port).or_default() += 1;
        }
        for (port, count) in producers {
            if count > 1 {
                diagnostics.push(
                    Diagnostic::new(
                        "single_producer_per_input_port",
                        Severity::Error,
                        format!("input port {port} has {count} producers"),
                    )
                    .with_node_id(node.id()),
                );
            }
        }
    }
    diagnostics
}

fn rule_node_type_resolved(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes()
        .filter(|node| node.attrs.get_str("type").is_none())
        .map(|node| {
            Diagnostic::new(
                "node_type_resolved",
                Severity::Error,
                format!("node with operation '{}' has no IR type", node.op),
            )
            .with_node_id(node.id())
        })
        .collect()
}

fn rule_required_metadata(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for key in [META_NAME, META_LAYOUT] {
        if !graph.meta.contains_key(key) {
            diagnostics.push(Diagnostic::new(
                "required_metadata",
                Severity::Error,
                format!("graph metadata '{key}' is missing"),
            ));
        }
    }
    if !graph.meta.contains_key(META_IR_VERSION) {
        diagnostics.push(Diagnostic::new(
            "required_metadata",
            Severity::Warning,
            format!("graph metadata '{META_IR_VERSION}' is missing; emitter defaults apply"),
        ));
    }
    diagnostics
}
