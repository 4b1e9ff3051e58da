use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use irforge_pipeline::{
    ConversionConfig, ConversionDriver, ConversionEvent, ConversionEventKind, ConversionEventSink,
    ConversionOutcome, ConversionRequest, DataType, DylibExtensionLoader, ExtensionLoader,
    ExtractorSource, InputFormat, JsonIrEmitter, PassScheduler, Registry, Stage,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "irforge")]
#[command(about = "Converts framework model graphs into a normalized IR")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Convert(ConvertArgs),
    ListExtractors(ListExtractorsArgs),
    ListPasses(ListPassesArgs),
    Explain(ExplainArgs),
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    #[arg(long)]
    input_model: PathBuf,
    /// JSON file with conversion options; flags given here take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    model_name: Option<String>,
    #[arg(long)]
    data_type: Option<DataType>,
    #[arg(long)]
    input_format: Option<InputFormat>,
    #[arg(long, action = ArgAction::SetTrue)]
    disable_nhwc_to_nchw: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    generate_experimental_ir_v10: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    generate_deprecated_ir_v2: bool,
    /// Comma-separated shared libraries with custom operations.
    #[arg(long)]
    custom_op_libraries: Option<String>,
    #[arg(long)]
    graph_dump_dir: Option<PathBuf>,
    #[arg(long)]
    input_checkpoint: Option<PathBuf>,
    #[arg(long)]
    saved_model_dir: Option<PathBuf>,
    #[arg(long = "saved-model-tag")]
    saved_model_tags: Vec<String>,
    #[arg(long = "output-node")]
    output_nodes: Vec<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct ListExtractorsArgs {
    #[arg(long)]
    custom_op_libraries: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ListPassesArgs {
    #[arg(long)]
    stage: Option<Stage>,
}

#[derive(clap::Args, Debug)]
struct ExplainArgs {
    #[arg(value_enum)]
    topic: ExplainTopic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExplainTopic {
    ConversionErrors,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Convert(args) => convert_command(args),
        Commands::ListExtractors(args) => list_extractors_command(args),
        Commands::ListPasses(args) => list_passes_command(args),
        Commands::Explain(args) => explain_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn convert_command(args: ConvertArgs) -> Result<ExitCode, String> {
    let config = build_config(&args)?;
    tracing::debug!(input = %args.input_model.display(), ?config, "conversion options resolved");
    let registry = Registry::builtin().map_err(|error| error.to_string())?;
    let extension_loader = DylibExtensionLoader::new();
    let events = event_sink(!args.no_stream_events, args.event_json);

    let outcome = ConversionDriver::new(&registry, &extension_loader, &JsonIrEmitter)
        .with_events(events)
        .convert(&ConversionRequest::new(&args.input_model, config))
        .map_err(|error| error.to_string())?;

    print_conversion_summary(&outcome);
    Ok(ExitCode::SUCCESS)
}

fn build_config(args: &ConvertArgs) -> Result<ConversionConfig, String> {
    let mut config = match args.config.as_deref() {
        Some(path) => ConversionConfig::load_from_path(path).map_err(|error| error.to_string())?,
        None => ConversionConfig::default(),
    };

    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if args.model_name.is_some() {
        config.output_model_name = args.model_name.clone();
    }
    if let Some(data_type) = args.data_type {
        config.data_type = data_type;
    }
    if args.input_format.is_some() {
        config.input_format = args.input_format;
    }
    config.disable_nhwc_to_nchw |= args.disable_nhwc_to_nchw;
    config.generate_experimental_ir_v10 |= args.generate_experimental_ir_v10;
    config.generate_deprecated_ir_v2 |= args.generate_deprecated_ir_v2;
    if args.custom_op_libraries.is_some() {
        config.custom_op_libraries = args.custom_op_libraries.clone();
    }
    if args.graph_dump_dir.is_some() {
        config.graph_dump_dir = args.graph_dump_dir.clone();
    }
    if args.input_checkpoint.is_some() {
        config.input_checkpoint = args.input_checkpoint.clone();
    }
    if args.saved_model_dir.is_some() {
        config.saved_model_dir = args.saved_model_dir.clone();
    }
    if !args.saved_model_tags.is_empty() {
        config.saved_model_tags = args.saved_model_tags.clone();
    }
    if !args.output_nodes.is_empty() {
        config.output_nodes = args.output_nodes.clone();
    }
    Ok(config)
}

fn event_sink(stream_events: bool, event_json: bool) -> ConversionEventSink {
    if !stream_events {
        return ConversionEventSink::default();
    }
    ConversionEventSink::with_observer(Arc::new(move |event: &ConversionEvent| {
        if event_json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(_) => print_event_text(event),
            }
        } else {
            print_event_text(event);
        }
    }))
}

fn print_event_text(event: &ConversionEvent) {
    println!(
        "[event seq={}] {}",
        event.sequence_no,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &ConversionEventKind) -> String {
    match kind {
        ConversionEventKind::LoadStarted { input } => format!("load {}", input.display()),
        ConversionEventKind::GraphBuilt {
            node_count,
            edge_count,
        } => format!("graph nodes={node_count} edges={edge_count}"),
        ConversionEventKind::ExtractorsResolved { node_count } => {
            format!("extract nodes={node_count}")
        }
        ConversionEventKind::StagePlanned { stage, order } => {
            format!("plan {stage} [{}]", order.join(", "))
        }
        ConversionEventKind::PassStarted { stage, pass } => format!("pass {stage} {pass}"),
        ConversionEventKind::PassCompleted { stage, pass } => format!("done {stage} {pass}"),
        ConversionEventKind::StageCompleted { stage, executed } => {
            format!("stage {stage} executed={executed}")
        }
        ConversionEventKind::Emitted { topology, .. } => format!("emit {}", topology.display()),
        ConversionEventKind::Failed { reason } => format!("failed {reason}"),
    }
}

fn print_conversion_summary(outcome: &ConversionOutcome) {
    println!("topology: {}", outcome.artifacts.topology.display());
    println!("weights: {}", outcome.artifacts.weights.display());
    println!("weights_blake3: {}", outcome.artifacts.weights_digest);
    println!("passes_executed: {}", outcome.report.total_executed());
    let warnings = outcome
        .diagnostics
        .iter()
        .filter(|diagnostic| !diagnostic.is_error())
        .count();
    println!("warnings: {warnings}");
    println!("status: success");
}

fn list_extractors_command(args: ListExtractorsArgs) -> Result<ExitCode, String> {
    let registry = Registry::builtin().map_err(|error| error.to_string())?;
    let config = ConversionConfig {
        custom_op_libraries: args.custom_op_libraries,
        ..ConversionConfig::default()
    };
    let libraries = config.custom_op_library_paths();
    let extension_loader = DylibExtensionLoader::new();
    let extensions = if libraries.is_empty() {
        Vec::new()
    } else {
        extension_loader
            .load(&libraries)
            .map_err(|error| error.to_string())?
            .extractors
    };
    let extractors = registry
        .merged_extractors(&extensions)
        .map_err(|error| error.to_string())?;

    for op in extractors.ops() {
        let source = match extractors.source_of(op) {
            Some(ExtractorSource::Extension(library)) => library.as_str(),
            Some(ExtractorSource::Builtin) | None => "builtin",
        };
        println!("{op}\t{source}");
    }
    Ok(ExitCode::SUCCESS)
}

fn list_passes_command(args: ListPassesArgs) -> Result<ExitCode, String> {
    let registry = Registry::builtin().map_err(|error| error.to_string())?;
    let scheduler = PassScheduler::new(&registry.passes);
    let stages: Vec<Stage> = match args.stage {
        Some(stage) => vec![stage],
        None => Stage::ALL.to_vec(),
    };

    for stage in stages {
        let order = scheduler.plan(stage).map_err(|error| error.to_string())?;
        for (position, name) in order.iter().enumerate() {
            println!("{stage}\t{}\t{name}", position + 1);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn explain_command(args: ExplainArgs) -> Result<ExitCode, String> {
    match args.topic {
        ExplainTopic::ConversionErrors => print!("{CONVERSION_ERRORS_HELP}"),
    }
    Ok(ExitCode::SUCCESS)
}

const CONVERSION_ERRORS_HELP: &str = "\
#44  The input model could not be converted.
     The file is corrupt, truncated, or written in a format irforge does not
     read; a node may use an operation no extractor handles, or declare an
     input that does not exist. Check --input-format, load any custom
     operation libraries with --custom-op-libraries, and run with --verbose
     for the failing node.

#38  The conversion failed inside the pipeline.
     The model was read, but a rewrite pass failed, the passes could not be
     ordered, or the final graph did not pass validation. Re-run with
     --verbose and --graph-dump-dir to capture the graph after each stage.
";
