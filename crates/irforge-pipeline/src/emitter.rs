use crate::{
    AttrValue, DataType, EdgeFilter, ElementType, Graph, META_FRAMEWORK, META_IR_VERSION,
    META_LAYOUT, META_VARIABLES, PipelineError, TensorValue,
};
use half::f16;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq)]
pub struct EmitRequest {
    pub output_dir: PathBuf,
    pub model_name: String,
    pub data_type: DataType,
    pub meta_info: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmittedArtifacts {
    pub topology: PathBuf,
    pub weights: PathBuf,
    pub weights_digest: String,
}

pub trait Emitter: Send + Sync {
    fn emit(&self, graph: &Graph, request: &EmitRequest) -> Result<EmittedArtifacts, PipelineError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrDocument {
    pub name: String,
    pub ir_version: Option<i64>,
    pub layout: Option<String>,
    pub framework: Option<String>,
    pub precision: DataType,
    pub layers: Vec<IrLayer>,
    pub edges: Vec<IrEdge>,
    pub weights: IrWeights,
    pub meta_info: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrLayer {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: String,
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<IrBlob>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrBlob {
    pub offset: usize,
    pub size: usize,
    pub element_type: ElementType,
    pub shape: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrEdge {
    pub from_layer: i64,
    pub from_port: usize,
    pub to_layer: i64,
    pub to_port: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrWeights {
    pub file: String,
    pub size: usize,
    pub blake3: String,
}

/// Writes `<name>.json` (topology) and `<name>.bin` (constants) next to each
/// other.
#[derive(Clone, Debug, Default)]
pub struct JsonIrEmitter;

impl Emitter for JsonIrEmitter {
    fn emit(&self, graph: &Graph, request: &EmitRequest) -> Result<EmittedArtifacts, PipelineError> {
        let (document, weights) = build_document(graph, request)?;

        std::fs::create_dir_all(&request.output_dir)
            .map_err(|error| PipelineError::io(&request.output_dir, error))?;
        let weights_path = request.output_dir.join(format!("{}.bin", request.model_name));
        let topology_path = request.output_dir.join(format!("{}.json", request.model_name));

        write_file(&weights_path, &weights)?;
        let topology = serde_json::to_vec_pretty(&document)
            .map_err(|error| PipelineError::Emit(format!("cannot serialize IR topology: {error}")))?;
        write_file(&topology_path, &topology)?;

        tracing::info!(
            topology = %topology_path.display(),
            layers = document.layers.len(),
            weights_bytes = weights.len(),
            "IR emitted"
        );
        Ok(EmittedArtifacts {
            topology: topology_path,
            weights: weights_path,
            weights_digest: document.weights.blake3,
        })
    }
}

/// Lays out the topology and the weights blob without touching the disk.
pub fn build_document(graph: &Graph, request: &EmitRequest) -> Result<(IrDocument, Vec<u8>), PipelineError> {
    let order = graph.topological_order();
    let mut layer_ids = BTreeMap::new();
    for (position, node_id) in order.iter().enumerate() {
        let node = graph.node(node_id).ok_or_else(|| PipelineError::UnknownNode {
            node_id: node_id.clone(),
        })?;
        let id = node.attrs.get_i64("ir_id").unwrap_or(position as i64);
        if layer_ids.values().any(|existing| *existing == id) {
            return Err(PipelineError::Emit(format!(
                "layer id {id} of node '{node_id}' is not unique"
            )));
        }
        layer_ids.insert(node_id.as_str(), id);
    }

    let variables = graph.meta.get(META_VARIABLES).and_then(AttrValue::as_map);
    let mut weights = Vec::new();
    let mut layers = Vec::with_capacity(order.len());
    for node_id in &order {
        let Some(node) = graph.node(node_id) else {
            continue;
        };
        let layer_type = node
            .attrs
            .get_str("type")
            .ok_or_else(|| PipelineError::Emit(format!("node '{node_id}' has no IR type")))?
            .to_string();

        let tensor = node
            .attrs
            .get("value")
            .and_then(AttrValue::as_tensor)
            .or_else(|| {
                variables
                    .and_then(|variables| variables.get(node_id.as_str()))
                    .and_then(AttrValue::as_tensor)
            });
        let blob = match tensor {
            Some(tensor) => Some(append_tensor(&mut weights, tensor, request.data_type, node_id)?),
            None => None,
        };

        let attrs = node
            .attrs
            .values()
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "type" | "value" | "ir_id"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        layers.push(IrLayer {
            id: layer_ids[node_id.as_str()],
            name: node_id.clone(),
            layer_type,
            attrs,
            blob,
        });
    }
    layers.sort_by_key(|layer| layer.id);

    let mut edges = Vec::new();
    for node_id in &order {
        for edge in graph.out_edges(node_id, EdgeFilter::DataOnly) {
            edges.push(IrEdge {
                from_layer: layer_ids[edge.from.as_str()],
                from_port: edge.from_port,
                to_layer: layer_ids[edge.to.as_str()],
                to_port: edge.to_port,
            });
        }
    }
    edges.sort_by_key(|edge| (edge.to_layer, edge.to_port, edge.from_layer, edge.from_port));

    let document = IrDocument {
        name: request.model_name.clone(),
        ir_version: graph.meta.get_i64(META_IR_VERSION),
        layout: graph.meta.get_str(META_LAYOUT).map(str::to_string),
        framework: graph.meta.get_str(META_FRAMEWORK).map(str::to_string),
        precision: request.data_type,
        layers,
        edges,
        weights: IrWeights {
            file: format!("{}.bin", request.model_name),
            size: weights.len(),
            blake3: blake3::hash(&weights).to_hex().to_string(),
        },
        meta_info: request.meta_info.clone(),
    };
    Ok((document, weights))
}

/// Appends one constant in IR precision. Floating point tensors follow the
/// requested data type; integer and boolean tensors keep their own width.
fn append_tensor(
    weights: &mut Vec<u8>,
    tensor: &TensorValue,
    data_type: DataType,
    node_id: &str,
) -> Result<IrBlob, PipelineError> {
    let expected = tensor
        .shape_element_count()
        .map_err(|message| PipelineError::Emit(format!("constant of node '{node_id}': {message}")))?;
    if expected != tensor.element_count() {
        return Err(PipelineError::Emit(format!(
            "constant of node '{node_id}' has shape {:?} but {} element(s)",
            tensor.shape,
            tensor.element_count()
        )));
    }

    let offset = weights.len();
    let element_type = match tensor.element_type {
        element_type if element_type.is_float() => {
            weights.reserve(tensor.data.len() * data_type.byte_width());
            match data_type {
                DataType::FP32 => {
                    for value in &tensor.data {
                        weights.extend_from_slice(&(*value as f32).to_le_bytes());
                    }
                    ElementType::F32
                }
                DataType::FP16 => {
                    for value in &tensor.data {
                        weights.extend_from_slice(&f16::from_f64(*value).to_le_bytes());
                    }
                    ElementType::F16
                }
            }
        }
        ElementType::I32 => {
            for value in &tensor.data {
                weights.extend_from_slice(&(*value as i32).to_le_bytes());
            }
            ElementType::I32
        }
        ElementType::I64 => {
            for value in &tensor.data {
                weights.extend_from_slice(&(*value as i64).to_le_bytes());
            }
            ElementType::I64
        }
        ElementType::Bool => {
            weights.extend(tensor.data.iter().map(|value| u8::from(*value != 0.0)));
            ElementType::Bool
        }
        other => {
            return Err(PipelineError::Emit(format!(
                "element type {} of node '{node_id}' cannot be stored",
                other.as_str()
            )));
        }
    };

    Ok(IrBlob {
        offset,
        size: weights.len() - offset,
        element_type,
        shape: tensor.shape.clone(),
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    std::fs::write(path, bytes).map_err(|error| PipelineError::io(path, error))
}
