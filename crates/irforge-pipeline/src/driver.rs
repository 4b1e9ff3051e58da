use crate::{
    AttrValue, ConversionConfig, ConversionError, ConversionEventKind, ConversionEventSink,
    Diagnostic, DylibExtensionLoader, EmitRequest, EmittedArtifacts, Emitter, ExtensionExtractor,
    ExtensionLoader, ExtractorRegistry, Graph, JsonIrEmitter, LoadRequest, LoadedExtensions,
    Loader, META_CMD_PARAMS, META_FRAMEWORK, META_IR_VERSION, META_LAYOUT, META_NAME,
    META_VARIABLES, PassRegistry, PassScheduler, PipelineError, RunReport, Stage, TensorValue,
    builtin_extractors, builtin_passes, build_graph, declared_inputs, dump_graph,
    loader_for_format, remove_control_dependency_inputs, restore_edges, validate_or_raise,
    validate_raw_graph,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const FRAMEWORK: &str = "tf";

/// Extractors and passes shared by every run. Built once, then only read.
#[derive(Clone, Default)]
pub struct Registry {
    pub extractors: ExtractorRegistry,
    pub passes: PassRegistry,
}

impl Registry {
    pub fn builtin() -> Result<Self, PipelineError> {
        Ok(Self {
            extractors: builtin_extractors()?,
            passes: builtin_passes()?,
        })
    }

    /// The run's extractor set: a copy of the shared one plus the extension
    /// extractors. The shared registry is left untouched.
    pub fn merged_extractors(
        &self,
        extensions: &[ExtensionExtractor],
    ) -> Result<ExtractorRegistry, PipelineError> {
        let mut merged = self.extractors.clone();
        let count = merged.merge_extensions(extensions.iter().cloned())?;
        if count > 0 {
            tracing::debug!(extensions = count, total = merged.len(), "extension extractors merged");
        }
        Ok(merged)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input_model: PathBuf,
    pub config: ConversionConfig,
}

impl ConversionRequest {
    pub fn new(input_model: impl Into<PathBuf>, config: ConversionConfig) -> Self {
        Self {
            input_model: input_model.into(),
            config,
        }
    }
}

#[derive(Debug)]
pub struct ConversionOutcome {
    pub artifacts: EmittedArtifacts,
    pub report: RunReport,
    pub diagnostics: Vec<Diagnostic>,
    pub graph: Graph,
}

pub struct ConversionDriver<'a> {
    registry: &'a Registry,
    loader: Option<&'a dyn Loader>,
    extension_loader: &'a dyn ExtensionLoader,
    emitter: &'a dyn Emitter,
    events: ConversionEventSink,
    stages: Vec<Stage>,
}

impl<'a> ConversionDriver<'a> {
    pub fn new(
        registry: &'a Registry,
        extension_loader: &'a dyn ExtensionLoader,
        emitter: &'a dyn Emitter,
    ) -> Self {
        Self {
            registry,
            loader: None,
            extension_loader,
            emitter,
            events: ConversionEventSink::default(),
            stages: Stage::ALL.to_vec(),
        }
    }

    /// Uses `loader` for every input instead of picking one from the input
    /// format.
    pub fn with_loader(mut self, loader: &'a dyn Loader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_events(mut self, events: ConversionEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutcome, ConversionError> {
        self.events.emit(ConversionEventKind::LoadStarted {
            input: request.input_model.clone(),
        });
        self.run(request).map_err(|source| {
            tracing::debug!(input = %request.input_model.display(), error = %source, "conversion failed");
            self.events.emit(ConversionEventKind::Failed {
                reason: source.to_string(),
            });
            ConversionError::new(&request.input_model, source)
        })
    }

    fn run(&self, request: &ConversionRequest) -> Result<ConversionOutcome, PipelineError> {
        let config = &request.config;
        let extensions = self.load_extensions(config)?;

        let load_request = LoadRequest {
            model: request.input_model.clone(),
            checkpoint: config.input_checkpoint.clone(),
            saved_model_dir: config.saved_model_dir.clone(),
            saved_model_tags: config.saved_model_tags.clone(),
            output_nodes: config.output_nodes.clone(),
        };
        let loaded = match self.loader {
            Some(loader) => loader.load(&load_request)?,
            None => loader_for_format(config.input_format_for(&request.input_model)?)
                .load(&load_request)?,
        };
        if let Err(error) = validate_raw_graph(&loaded.graph) {
            tracing::warn!(
                errors = error.errors_count,
                "secondary model validation failed; continuing"
            );
            for diagnostic in &error.diagnostics {
                tracing::debug!(%diagnostic, "secondary validation");
            }
        }

        let model_name = config.model_name_for(&request.input_model);
        let mut graph = build_graph(&loaded.graph, &model_name)?;
        attach_metadata(&mut graph, config, &loaded.variables)?;
        restore_edges(&mut graph, declared_inputs)?;
        remove_control_dependency_inputs(&mut graph);
        graph.check_empty_graph("loading the model")?;
        tracing::debug!(nodes = graph.node_count(), edges = graph.edge_count(), "graph built");
        self.events.emit(ConversionEventKind::GraphBuilt {
            node_count: graph.node_count(),
            edge_count: graph.edge_count(),
        });
        dump_if_requested(&graph, config, "00_loaded")?;

        let extractors = self.registry.merged_extractors(&extensions.extractors)?;
        let resolved = extractors.resolve_all(&mut graph)?;
        self.events
            .emit(ConversionEventKind::ExtractorsResolved { node_count: resolved });

        let mut scheduler =
            PassScheduler::new(&self.registry.passes).with_events(self.events.clone());
        for (index, stage) in self.stages.iter().enumerate() {
            scheduler.run_stage(&mut graph, *stage)?;
            let label = format!("{:02}_{}", index + 1, stage.as_str().to_ascii_lowercase());
            dump_if_requested(&graph, config, &label)?;
        }
        let report = scheduler.report().clone();

        graph.require_metadata(&[META_NAME, META_LAYOUT])?;
        let diagnostics = validate_or_raise(&graph, &[])?;
        for diagnostic in diagnostics.iter().filter(|diagnostic| !diagnostic.is_error()) {
            tracing::warn!(%diagnostic, "pre-emission lint");
        }

        let emit_request = EmitRequest {
            output_dir: config.output_dir.clone(),
            model_name,
            data_type: config.data_type,
            meta_info: config_as_json(config)?,
        };
        let artifacts = self.emitter.emit(&graph, &emit_request)?;
        self.events.emit(ConversionEventKind::Emitted {
            topology: artifacts.topology.clone(),
            weights: artifacts.weights.clone(),
        });

        Ok(ConversionOutcome {
            artifacts,
            report,
            diagnostics,
            graph,
        })
    }

    fn load_extensions(&self, config: &ConversionConfig) -> Result<LoadedExtensions, PipelineError> {
        let libraries = config.custom_op_library_paths();
        if libraries.is_empty() {
            return Ok(LoadedExtensions::default());
        }
        self.extension_loader.load(&libraries)
    }
}

/// Converts one model with the built-in registry, shared-library extensions
/// and the JSON IR emitter.
pub fn convert(request: &ConversionRequest) -> Result<ConversionOutcome, ConversionError> {
    let registry = Registry::builtin()
        .map_err(|source| ConversionError::new(&request.input_model, source))?;
    let extension_loader = DylibExtensionLoader::new();
    ConversionDriver::new(&registry, &extension_loader, &JsonIrEmitter).convert(request)
}

fn attach_metadata(
    graph: &mut Graph,
    config: &ConversionConfig,
    variables: &BTreeMap<String, TensorValue>,
) -> Result<(), PipelineError> {
    graph
        .meta
        .set(META_LAYOUT, AttrValue::String(config.layout().as_str().to_string()));
    graph
        .meta
        .set(META_IR_VERSION, AttrValue::Integer(config.ir_version()));
    graph
        .meta
        .set(META_FRAMEWORK, AttrValue::String(FRAMEWORK.to_string()));
    if let Some(params) = attr_from_json(&config_as_json(config)?) {
        graph.meta.set(META_CMD_PARAMS, params);
    }
    graph.meta.set(
        META_VARIABLES,
        AttrValue::Map(
            variables
                .iter()
                .map(|(name, tensor)| (name.clone(), AttrValue::Tensor(tensor.clone())))
                .collect(),
        ),
    );
    Ok(())
}

fn config_as_json(config: &ConversionConfig) -> Result<Value, PipelineError> {
    serde_json::to_value(config)
        .map_err(|error| PipelineError::InvalidInput(format!("configuration cannot be recorded: {error}")))
}

/// Unset options are dropped rather than stored as nulls.
fn attr_from_json(value: &Value) -> Option<AttrValue> {
    match value {
        Value::Null => None,
        Value::Bool(value) => Some(AttrValue::Boolean(*value)),
        Value::Number(number) => number
            .as_i64()
            .map(AttrValue::Integer)
            .or_else(|| number.as_f64().map(AttrValue::Float)),
        Value::String(value) => Some(AttrValue::String(value.clone())),
        Value::Array(values) => Some(AttrValue::List(
            values.iter().filter_map(attr_from_json).collect(),
        )),
        Value::Object(entries) => Some(AttrValue::Map(
            entries
                .iter()
                .filter_map(|(key, value)| attr_from_json(value).map(|value| (key.clone(), value)))
                .collect(),
        )),
    }
}

fn dump_if_requested(graph: &Graph, config: &ConversionConfig, label: &str) -> Result<(), PipelineError> {
    match config.graph_dump_dir.as_deref() {
        Some(dir) => dump_graph(graph, dir, label).map(|_| ()),
        None => Ok(()),
    }
}
