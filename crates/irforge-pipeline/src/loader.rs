use crate::{InputFormat, LoadedModel, LoaderError, RawGraph, RawNode, TensorValue, parse_raw_dot};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SAVED_MODEL_FILE: &str = "saved_model.json";

/// Everything a loader needs to locate and trim a model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadRequest {
    pub model: PathBuf,
    pub checkpoint: Option<PathBuf>,
    pub saved_model_dir: Option<PathBuf>,
    pub saved_model_tags: Vec<String>,
    pub output_nodes: Vec<String>,
}

impl LoadRequest {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// File the graph is actually read from.
    pub fn source_path(&self) -> PathBuf {
        match &self.saved_model_dir {
            Some(dir) => dir.join(SAVED_MODEL_FILE),
            None => self.model.clone(),
        }
    }
}

pub trait Loader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, LoaderError>;
}

#[derive(Debug, Default, Deserialize)]
struct JsonModelFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    variables: BTreeMap<String, TensorValue>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    variables: BTreeMap<String, TensorValue>,
}

/// Reads `{ "name", "nodes", "variables", "tags" }` documents.
#[derive(Clone, Debug, Default)]
pub struct JsonModelLoader;

impl Loader for JsonModelLoader {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, LoaderError> {
        let path = request.source_path();
        let text = read_text(&path)?;
        let file: JsonModelFile = serde_json::from_str(&text)
            .map_err(|error| LoaderError::new(&path, "model is not valid JSON").with_source(error))?;

        if request.saved_model_dir.is_some() {
            check_tags(&path, &file.tags, &request.saved_model_tags)?;
        }

        let graph = RawGraph {
            name: file.name,
            nodes: file.nodes,
        };
        finish_load(request, &path, graph, file.variables)
    }
}

/// Reads models written as Graphviz DOT; see [`parse_raw_dot`].
#[derive(Clone, Debug, Default)]
pub struct DotModelLoader;

impl Loader for DotModelLoader {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, LoaderError> {
        if request.saved_model_dir.is_some() {
            return Err(LoaderError::new(
                &request.model,
                "saved model directories are only supported for JSON models",
            ));
        }
        let path = request.source_path();
        let text = read_text(&path)?;
        let graph = parse_raw_dot(&text)
            .map_err(|error| LoaderError::new(&path, "model is not valid DOT").with_source(error))?;
        finish_load(request, &path, graph, BTreeMap::new())
    }
}

pub fn loader_for_format(format: InputFormat) -> Box<dyn Loader> {
    match format {
        InputFormat::Json => Box::new(JsonModelLoader),
        InputFormat::Dot => Box::new(DotModelLoader),
    }
}

fn finish_load(
    request: &LoadRequest,
    path: &Path,
    graph: RawGraph,
    mut variables: BTreeMap<String, TensorValue>,
) -> Result<LoadedModel, LoaderError> {
    if let Some(checkpoint) = request.checkpoint.as_ref() {
        let text = read_text(checkpoint)?;
        let file: CheckpointFile = serde_json::from_str(&text).map_err(|error| {
            LoaderError::new(checkpoint, "checkpoint is not valid JSON").with_source(error)
        })?;
        tracing::debug!(
            checkpoint = %checkpoint.display(),
            variables = file.variables.len(),
            "checkpoint variables loaded"
        );
        variables.extend(file.variables);
    }

    let graph = if request.output_nodes.is_empty() {
        graph
    } else {
        graph
            .prune_to_outputs(&request.output_nodes)
            .map_err(|message| LoaderError::new(path, message))?
    };
    variables.retain(|name, _| graph.nodes.iter().any(|node| &node.name == name));

    tracing::debug!(path = %path.display(), nodes = graph.nodes.len(), "model loaded");
    Ok(LoadedModel { graph, variables })
}

fn check_tags(path: &Path, available: &[String], requested: &[String]) -> Result<(), LoaderError> {
    let missing: Vec<&str> = requested
        .iter()
        .filter(|tag| !available.contains(tag))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(LoaderError::new(
        path,
        format!(
            "saved model has no meta graph tagged {}; available tags: {}",
            missing.join(","),
            available.join(",")
        ),
    ))
}

fn read_text(path: &Path) -> Result<String, LoaderError> {
    std::fs::read_to_string(path)
        .map_err(|error| LoaderError::new(path, "cannot read file").with_source(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ElementType;
    use std::fs;

    const MODEL: &str = r#"{
        "name": "tiny",
        "tags": ["serve"],
        "nodes": [
            { "name": "x", "op": "Placeholder" },
            { "name": "w", "op": "VariableV2" },
            { "name": "y", "op": "MatMul", "inputs": ["x", "w"] },
            { "name": "unused", "op": "Const", "attrs": { "value": 1 } }
        ],
        "variables": {
            "w": { "element_type": "f32", "shape": [1], "data": [0.0] }
        }
    }"#;

    #[test]
    fn json_loader_checkpoint_expected_variables_overridden() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let model = dir.path().join("tiny.json");
        let checkpoint = dir.path().join("tiny.ckpt.json");
        fs::write(&model, MODEL).expect("model should be written");
        fs::write(
            &checkpoint,
            r#"{ "variables": { "w": { "element_type": "f32", "shape": [1], "data": [3.5] } } }"#,
        )
        .expect("checkpoint should be written");

        let request = LoadRequest {
            checkpoint: Some(checkpoint),
            ..LoadRequest::new(&model)
        };
        let loaded = JsonModelLoader.load(&request).expect("model should load");

        assert_eq!(loaded.graph.name.as_deref(), Some("tiny"));
        assert_eq!(loaded.graph.nodes.len(), 4);
        let w = loaded.variables.get("w").expect("variable w");
        assert_eq!(w.element_type, ElementType::F32);
        assert_eq!(w.data, vec![3.5]);
    }

    #[test]
    fn json_loader_output_nodes_expected_pruned() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let model = dir.path().join("tiny.json");
        fs::write(&model, MODEL).expect("model should be written");

        let request = LoadRequest {
            output_nodes: vec!["y".to_string()],
            ..LoadRequest::new(&model)
        };
        let loaded = JsonModelLoader.load(&request).expect("model should load");

        let names: Vec<&str> = loaded.graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["x", "w", "y"]);
    }

    #[test]
    fn json_loader_saved_model_missing_tag_expected_error() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        fs::write(dir.path().join(SAVED_MODEL_FILE), MODEL).expect("model should be written");

        let request = LoadRequest {
            saved_model_dir: Some(dir.path().to_path_buf()),
            saved_model_tags: vec!["train".to_string()],
            ..LoadRequest::new("ignored")
        };
        let error = JsonModelLoader.load(&request).expect_err("missing tag must fail");
        assert!(error.message.contains("train"));
        assert!(error.message.contains("serve"));
    }

    #[test]
    fn json_loader_truncated_file_expected_loader_error_with_source() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let model = dir.path().join("broken.json");
        fs::write(&model, r#"{ "nodes": [ { "name": "#).expect("model should be written");

        let error = JsonModelLoader
            .load(&LoadRequest::new(&model))
            .expect_err("truncated file must fail");
        assert_eq!(error.path, model);
        assert!(error.source.is_some());
    }

    #[test]
    fn dot_loader_expected_raw_graph() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let model = dir.path().join("relu.dot");
        fs::write(
            &model,
            "digraph relu { x [op=Placeholder] r [op=Relu] x -> r }",
        )
        .expect("model should be written");

        let loaded = DotModelLoader
            .load(&LoadRequest::new(&model))
            .expect("model should load");
        assert_eq!(loaded.graph.nodes.len(), 2);
        assert!(loaded.variables.is_empty());
    }
}
