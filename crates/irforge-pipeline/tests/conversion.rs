use irforge_pipeline::{
    AttrValue, BoxError, ConversionConfig, ConversionDriver, ConversionErrorKind,
    ConversionEventKind, ConversionEventSink, ConversionRequest, DataType, ExtensionLoader, Graph,
    IrDocument, JsonIrEmitter, LoadRequest, LoadedExtensions, LoadedModel, Loader, LoaderError,
    PassDescriptor, PipelineError, RawGraph, RawNode, Registry, Stage, announced_extractors,
    conversion_event_channel,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CLASSIFIER: &str = r#"
digraph classifier {
    input  [op=Placeholder, dtype=float32, shape="[1,8,8,3]"]
    bias   [op=Const, dtype=float32, value="[0.5, -1, 2, 0.25]"]
    init   [op=NoOp]
    act    [op=Relu]
    copy   [op=Identity]
    add    [op=BiasAdd]
    probs  [op=Softmax]

    input -> act
    act -> copy
    copy -> add [in=0]
    bias -> add [in=1]
    add -> probs
    init -> probs [control=true]
}
"#;

struct StubExtensions;

impl ExtensionLoader for StubExtensions {
    fn load(&self, libraries: &[PathBuf]) -> Result<LoadedExtensions, PipelineError> {
        Ok(LoadedExtensions {
            libraries: libraries.to_vec(),
            extractors: announced_extractors("FusedGelu", "libstub.so"),
        })
    }
}

fn write_model(dir: &Path, file: &str, text: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, text).expect("model should be written");
    path
}

fn config_for(dir: &Path) -> ConversionConfig {
    ConversionConfig {
        output_dir: dir.join("out"),
        ..ConversionConfig::default()
    }
}

fn read_document(path: &Path) -> IrDocument {
    let text = std::fs::read_to_string(path).expect("topology should exist");
    serde_json::from_str(&text).expect("topology should parse")
}

#[test]
fn convert_dot_model_expected_artifacts_and_ordered_events() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let registry = Registry::builtin().expect("builtin registry");
    let (tx, rx) = conversion_event_channel();

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .with_events(ConversionEventSink::with_sender(tx))
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect("conversion should succeed");

    assert_eq!(outcome.artifacts.topology, dir.path().join("out/classifier.json"));
    assert!(outcome.artifacts.weights.exists());
    assert!(outcome.graph.node("init").is_none());
    assert!(outcome.graph.node("copy").is_none());
    assert_eq!(outcome.report.stages.len(), 3);

    let document = read_document(&outcome.artifacts.topology);
    assert_eq!(document.name, "classifier");
    assert_eq!(document.layout.as_deref(), Some("NHWC"));
    assert_eq!(document.ir_version, Some(6));
    assert_eq!(document.framework.as_deref(), Some("tf"));
    assert_eq!(document.weights.size, 16);
    assert_eq!(document.weights.blake3, outcome.artifacts.weights_digest);
    assert_eq!(
        document.meta_info.get("data_type").and_then(|value| value.as_str()),
        Some("FP32")
    );
    let types: Vec<&str> = document
        .layers
        .iter()
        .map(|layer| layer.layer_type.as_str())
        .collect();
    assert_eq!(types, vec!["Const", "Parameter", "ReLU", "Eltwise", "SoftMax"]);
    assert_eq!(document.edges.len(), 4);

    let events: Vec<_> = rx.try_iter().collect();
    assert!(events
        .windows(2)
        .all(|pair| pair[0].sequence_no < pair[1].sequence_no));
    assert!(matches!(
        events.first().map(|event| &event.kind),
        Some(ConversionEventKind::LoadStarted { .. })
    ));
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(ConversionEventKind::Emitted { .. })
    ));
    let planned: Vec<Stage> = events
        .iter()
        .filter_map(|event| match &event.kind {
            ConversionEventKind::StagePlanned { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(planned, Stage::ALL.to_vec());
}

#[test]
fn convert_records_options_expected_cmd_params_in_metadata() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let registry = Registry::builtin().expect("builtin registry");
    let config = ConversionConfig {
        output_model_name: Some("renamed".to_string()),
        disable_nhwc_to_nchw: true,
        generate_experimental_ir_v10: true,
        ..config_for(dir.path())
    };

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config))
        .expect("conversion should succeed");

    assert_eq!(outcome.artifacts.topology, dir.path().join("out/renamed.json"));
    let params = outcome
        .graph
        .meta
        .get("cmd_params")
        .and_then(|value| value.as_map())
        .expect("cmd_params should be recorded");
    assert_eq!(
        params.get("output_model_name").and_then(|value| value.as_str()),
        Some("renamed")
    );
    let document = read_document(&outcome.artifacts.topology);
    assert_eq!(document.layout.as_deref(), Some("NCHW"));
    assert_eq!(document.ir_version, Some(10));
}

#[test]
fn convert_empty_graph_expected_malformed_input_and_no_stage_started() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "empty.dot", "digraph empty { }");
    let registry = Registry::builtin().expect("builtin registry");
    let (tx, rx) = conversion_event_channel();

    let error = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .with_events(ConversionEventSink::with_sender(tx))
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect_err("empty graph must fail");

    assert_eq!(error.kind, ConversionErrorKind::MalformedInput);
    assert!(matches!(error.source, PipelineError::EmptyGraph { .. }));
    assert!(error.to_string().contains("#44"));
    let events: Vec<_> = rx.try_iter().map(|event| event.kind).collect();
    assert!(!events
        .iter()
        .any(|kind| matches!(kind, ConversionEventKind::StagePlanned { .. })));
    assert!(matches!(events.last(), Some(ConversionEventKind::Failed { .. })));
}

#[test]
fn convert_unknown_operation_expected_no_pass_runs() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(
        dir.path(),
        "unknown.dot",
        "digraph unknown { x [op=Placeholder] g [op=FusedGelu] x -> g }",
    );
    let registry = Registry::builtin().expect("builtin registry");
    let (tx, rx) = conversion_event_channel();

    let error = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .with_events(ConversionEventSink::with_sender(tx))
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect_err("unresolved operation must fail");

    assert_eq!(error.kind, ConversionErrorKind::MalformedInput);
    assert!(matches!(
        &error.source,
        PipelineError::UnresolvedOperator { node_id, op } if node_id == "g" && op == "FusedGelu"
    ));
    assert!(!rx
        .try_iter()
        .any(|event| matches!(event.kind, ConversionEventKind::PassStarted { .. })));
}

#[test]
fn convert_custom_operation_library_expected_pass_through_layer() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(
        dir.path(),
        "gelu.dot",
        "digraph gelu { x [op=Placeholder] g [op=FusedGelu, approximate=true] x -> g }",
    );
    let registry = Registry::builtin().expect("builtin registry");
    let config = ConversionConfig {
        custom_op_libraries: Some("libstub.so".to_string()),
        ..config_for(dir.path())
    };

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config))
        .expect("conversion should succeed");

    let gelu = outcome.graph.node("g").expect("custom node kept");
    assert_eq!(gelu.attrs.get_str("type"), Some("FusedGelu"));
    assert_eq!(gelu.attrs.get_bool("approximate"), Some(true));
    assert!(!registry.extractors.contains("FusedGelu"));
}

fn failing_pass(_graph: &mut Graph) -> Result<(), BoxError> {
    Err("shape inference diverged".into())
}

#[test]
fn convert_failing_pass_expected_internal_error_and_no_output() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let mut registry = Registry::builtin().expect("builtin registry");
    registry
        .passes
        .register_fn(PassDescriptor::new("infer_shapes", Stage::Middle), failing_pass)
        .expect("registration should succeed");

    let error = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect_err("failing pass must fail the run");

    assert_eq!(error.kind, ConversionErrorKind::Internal);
    assert!(matches!(
        &error.source,
        PipelineError::PassFailed { pass, stage: Stage::Middle, .. } if pass == "infer_shapes"
    ));
    assert!(error.to_string().contains("#38"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn convert_pass_cycle_expected_internal_error() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let mut registry = Registry::builtin().expect("builtin registry");
    let noop = |_graph: &mut Graph| -> Result<(), BoxError> { Ok(()) };
    registry
        .passes
        .register_fn(PassDescriptor::new("left", Stage::Front).after("right"), noop)
        .expect("left");
    registry
        .passes
        .register_fn(PassDescriptor::new("right", Stage::Front).after("left"), noop)
        .expect("right");

    let error = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect_err("cycle must fail the run");

    assert_eq!(error.kind, ConversionErrorKind::Internal);
    assert!(matches!(error.source, PipelineError::PassCycle { stage: Stage::Front, .. }));
}

#[test]
fn convert_with_dump_dir_expected_one_dump_per_stage() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let registry = Registry::builtin().expect("builtin registry");
    let dumps = dir.path().join("dumps");
    let config = ConversionConfig {
        graph_dump_dir: Some(dumps.clone()),
        ..config_for(dir.path())
    };

    ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config))
        .expect("conversion should succeed");

    for label in ["00_loaded", "01_front", "02_middle", "03_back"] {
        assert!(dumps.join(format!("{label}.dot")).exists(), "{label} missing");
    }
}

#[test]
fn convert_json_model_fp16_expected_half_width_weights() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(
        dir.path(),
        "scale.json",
        r#"{
            "name": "scale",
            "nodes": [
                { "name": "x", "op": "Placeholder", "attrs": { "shape": [1, 2] } },
                { "name": "k", "op": "Const", "attrs": { "value": [1.5, 2.0] } },
                { "name": "y", "op": "Mul", "inputs": ["x", "k"] }
            ]
        }"#,
    );
    let registry = Registry::builtin().expect("builtin registry");
    let config = ConversionConfig {
        data_type: DataType::FP16,
        ..config_for(dir.path())
    };

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .convert(&ConversionRequest::new(&model, config))
        .expect("conversion should succeed");

    let weights = std::fs::read(&outcome.artifacts.weights).expect("weights should exist");
    assert_eq!(weights.len(), 4);
    assert_eq!(&weights[..2], &half::f16::from_f64(1.5).to_le_bytes());
    assert_eq!(read_document(&outcome.artifacts.topology).precision, DataType::FP16);
}

struct InMemoryLoader {
    requests: Mutex<Vec<LoadRequest>>,
}

impl Loader for InMemoryLoader {
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, LoaderError> {
        self.requests
            .lock()
            .map_err(|_| LoaderError::new(&request.model, "request log poisoned"))?
            .push(request.clone());
        let graph = RawGraph {
            name: Some("memory".to_string()),
            nodes: vec![
                RawNode::new("x", "Placeholder"),
                RawNode::new("k", "Const").with_attr("value", AttrValue::Float(3.0)),
                RawNode::new("y", "Mul").with_input("x").with_input("k"),
            ],
        };
        Ok(LoadedModel {
            graph,
            variables: Default::default(),
        })
    }
}

#[test]
fn convert_with_injected_loader_expected_loader_used_for_any_input() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let registry = Registry::builtin().expect("builtin registry");
    let loader = InMemoryLoader {
        requests: Mutex::new(Vec::new()),
    };
    let config = ConversionConfig {
        output_nodes: vec!["y".to_string()],
        ..config_for(dir.path())
    };

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .with_loader(&loader)
        .convert(&ConversionRequest::new(dir.path().join("model.unknown"), config))
        .expect("conversion should succeed");

    let requests = loader.requests.lock().expect("request log should lock");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].output_nodes, vec!["y".to_string()]);
    assert_eq!(outcome.artifacts.topology, dir.path().join("out/model.json"));
    assert_eq!(read_document(&outcome.artifacts.topology).layers.len(), 3);
}

#[test]
fn convert_front_stage_only_expected_later_passes_skipped() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);
    let registry = Registry::builtin().expect("builtin registry");

    let outcome = ConversionDriver::new(&registry, &StubExtensions, &JsonIrEmitter)
        .with_stages(vec![Stage::Front])
        .convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect("conversion should succeed");

    assert_eq!(outcome.report.stages.len(), 1);
    assert!(outcome.graph.node("init").is_none());
    assert!(outcome.graph.node("copy").is_some());
    assert!(outcome.graph.nodes().all(|node| node.attrs.get("ir_id").is_none()));
}

#[test]
fn convert_default_collaborators_expected_artifacts_written() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let model = write_model(dir.path(), "classifier.dot", CLASSIFIER);

    let outcome = irforge_pipeline::convert(&ConversionRequest::new(&model, config_for(dir.path())))
        .expect("conversion should succeed");

    assert!(outcome.artifacts.topology.exists());
    assert!(outcome.artifacts.weights.exists());
    assert_eq!(outcome.report.stages.len(), 3);
}
