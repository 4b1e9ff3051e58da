use crate::{
    AttrValue, BoxError, Edge, EdgeFilter, Graph, PassDescriptor, PassRegistry, PipelineError,
    RewritePass, Stage, remove_control_dependency_inputs,
};

pub const NOOP_ELIMINATION: &str = "noop_elimination";
pub const IDENTITY_ELIMINATION: &str = "identity_elimination";
pub const REMOVE_DANGLING_CONTROL: &str = "remove_dangling_control";
pub const ASSIGN_IR_IDS: &str = "assign_ir_ids";

/// Drops `NoOp` nodes that take part in no data flow. Control edges through
/// them go away with the node.
#[derive(Clone, Debug, Default)]
pub struct NoopEliminationPass;

impl RewritePass for NoopEliminationPass {
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError> {
        let removable: Vec<String> = graph
            .nodes()
            .filter(|node| node.op == "NoOp")
            .filter(|node| {
                graph
                    .incident_edges(node.id(), EdgeFilter::DataOnly)
                    .next()
                    .is_none()
            })
            .map(|node| node.id().to_string())
            .collect();

        for node_id in &removable {
            graph.remove_node(node_id)?;
        }
        if !removable.is_empty() {
            tracing::debug!(removed = removable.len(), "NoOp nodes eliminated");
        }
        Ok(())
    }
}

/// Reconnects consumers of an `Identity` node straight to its producer.
/// Identities without consumers are kept since they may name a model output.
#[derive(Clone, Debug, Default)]
pub struct IdentityEliminationPass;

impl RewritePass for IdentityEliminationPass {
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError> {
        let identities: Vec<String> = graph
            .nodes()
            .filter(|node| node.op == "Identity")
            .map(|node| node.id().to_string())
            .collect();

        for node_id in identities {
            bypass_identity(graph, &node_id)?;
        }
        Ok(())
    }
}

fn bypass_identity(graph: &mut Graph, node_id: &str) -> Result<(), PipelineError> {
    let Some(producer) = graph
        .in_edges(node_id, EdgeFilter::DataOnly)
        .find(|edge| edge.to_port == 0)
        .cloned()
    else {
        return Ok(());
    };
    let consumers: Vec<Edge> = graph
        .out_edges(node_id, EdgeFilter::DataOnly)
        .cloned()
        .collect();
    if consumers.is_empty() {
        return Ok(());
    }

    let control_in: Vec<Edge> = graph
        .in_edges(node_id, EdgeFilter::All)
        .filter(|edge| edge.is_control())
        .cloned()
        .collect();
    let control_out: Vec<Edge> = graph
        .out_edges(node_id, EdgeFilter::All)
        .filter(|edge| edge.is_control())
        .cloned()
        .collect();

    let mut rewired = Vec::new();
    for consumer in &consumers {
        rewired.push(Edge::data(
            producer.from.clone(),
            producer.from_port,
            consumer.to.clone(),
            consumer.to_port,
        ));
        for control in &control_in {
            rewired.push(Edge::control(
                control.from.clone(),
                consumer.to.clone(),
                control.to_port,
            ));
        }
    }
    for control in &control_out {
        rewired.push(Edge::control(
            producer.from.clone(),
            control.to.clone(),
            control.to_port,
        ));
    }

    graph.remove_node(node_id)?;
    for edge in rewired {
        graph.add_edge(edge)?;
    }
    tracing::debug!(node = node_id, producer = %producer.from, "Identity bypassed");
    Ok(())
}

/// Repeats the redundant control dependency cleanup after earlier stages
/// rewired the graph.
#[derive(Clone, Debug, Default)]
pub struct RemoveDanglingControlPass;

impl RewritePass for RemoveDanglingControlPass {
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError> {
        graph.remove_edges_where(|edge| edge.is_control() && edge.from == edge.to);
        remove_control_dependency_inputs(graph);
        Ok(())
    }
}

/// Numbers nodes consecutively in topological order as `ir_id`.
#[derive(Clone, Debug, Default)]
pub struct AssignIrIdsPass;

impl RewritePass for AssignIrIdsPass {
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError> {
        for (ir_id, node_id) in graph.topological_order().into_iter().enumerate() {
            let node = graph
                .node_mut(&node_id)
                .ok_or_else(|| PipelineError::UnknownNode {
                    node_id: node_id.clone(),
                })?;
            node.attrs.set("ir_id", AttrValue::Integer(ir_id as i64));
        }
        Ok(())
    }
}

/// The rewrite passes every conversion runs. `assign_ir_ids` is registered
/// ahead of `remove_dangling_control` and ordered after it by constraint.
pub fn builtin_passes() -> Result<PassRegistry, PipelineError> {
    let mut registry = PassRegistry::new();
    registry
        .register_pass::<NoopEliminationPass>(PassDescriptor::new(NOOP_ELIMINATION, Stage::Front))?;
    registry.register_pass::<IdentityEliminationPass>(PassDescriptor::new(
        IDENTITY_ELIMINATION,
        Stage::Middle,
    ))?;
    registry.register_pass::<AssignIrIdsPass>(
        PassDescriptor::new(ASSIGN_IR_IDS, Stage::Back).after(REMOVE_DANGLING_CONTROL),
    )?;
    registry.register_pass::<RemoveDanglingControlPass>(PassDescriptor::new(
        REMOVE_DANGLING_CONTROL,
        Stage::Back,
    ))?;
    Ok(registry)
}
