use crate::{Diagnostic, ExtractorSource, Stage};
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("node '{node_id}' already exists in the graph")]
    DuplicateNode { node_id: String },
    #[error("node '{node_id}' does not exist in the graph")]
    UnknownNode { node_id: String },
    #[error("node '{node_id}' declares an input from '{peer_id}': {reason}")]
    MalformedEdge {
        node_id: String,
        peer_id: String,
        reason: String,
    },
    #[error("graph is empty after {context}")]
    EmptyGraph { context: String },
    #[error(
        "extractor for operation '{op}' is already registered by {existing}; {incoming} must opt in to override it"
    )]
    DuplicateExtractor {
        op: String,
        existing: ExtractorSource,
        incoming: ExtractorSource,
    },
    #[error("extractor registry has case-insensitive duplicates: {}", .ops.join(", "))]
    CaseInsensitiveExtractorDuplicates { ops: Vec<String> },
    #[error("node '{node_id}' has operation '{op}' which no registered extractor supports")]
    UnresolvedOperator { node_id: String, op: String },
    #[error("extractor for operation '{op}' rejected node '{node_id}': {message}")]
    Extraction {
        node_id: String,
        op: String,
        message: String,
    },
    #[error("rewrite pass '{name}' is already registered")]
    DuplicatePass { name: String },
    #[error("rewrite passes of stage {stage} form an ordering cycle: {}", .cycle.join(" -> "))]
    PassCycle { stage: Stage, cycle: Vec<String> },
    #[error("rewrite pass '{pass}' of stage {stage} failed: {source}")]
    PassFailed {
        pass: String,
        stage: Stage,
        #[source]
        source: BoxError,
    },
    #[error("rewrite pass '{pass}' was scheduled a second time in the same run")]
    PassAlreadyExecuted { pass: String },
    #[error("graph metadata '{key}' is missing")]
    MissingMetadata { key: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error("failed to load custom operations library '{}': {message}", .library.display())]
    Extension { library: PathBuf, message: String },
    #[error("IR emission failed: {0}")]
    Emit(String),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the cause lies in the user's model or options rather than in
    /// the pipeline itself.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode { .. }
                | Self::UnknownNode { .. }
                | Self::MalformedEdge { .. }
                | Self::EmptyGraph { .. }
                | Self::UnresolvedOperator { .. }
                | Self::Extraction { .. }
                | Self::InvalidInput(_)
                | Self::Loader(_)
                | Self::Extension { .. }
        )
    }
}

#[derive(Debug, Error)]
#[error("failed to load model '{}': {message}", .path.display())]
pub struct LoaderError {
    pub path: PathBuf,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl LoaderError {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionErrorKind {
    MalformedInput,
    Internal,
}

impl ConversionErrorKind {
    pub fn help_topic(self) -> u32 {
        match self {
            Self::MalformedInput => 44,
            Self::Internal => 38,
        }
    }
}

/// The single user-facing failure of a conversion run.
#[derive(Debug, Error)]
#[error("{}", render_conversion_message(.input, .kind, .source))]
pub struct ConversionError {
    pub input: PathBuf,
    pub kind: ConversionErrorKind,
    #[source]
    pub source: PipelineError,
}

impl ConversionError {
    pub fn new(input: impl Into<PathBuf>, source: PipelineError) -> Self {
        let kind = if source.is_malformed_input() {
            ConversionErrorKind::MalformedInput
        } else {
            ConversionErrorKind::Internal
        };
        Self {
            input: input.into(),
            kind,
            source,
        }
    }
}

fn render_conversion_message(
    input: &Path,
    kind: &ConversionErrorKind,
    source: &PipelineError,
) -> String {
    let topic = HelpTopicRef(kind.help_topic());
    match kind {
        ConversionErrorKind::MalformedInput => format!(
            "cannot convert model \"{}\": the file is corrupt or has an unsupported format. Details: {source}. {topic}",
            input.display()
        ),
        ConversionErrorKind::Internal => format!(
            "conversion of model \"{}\" failed inside the pipeline: {source}. {topic}",
            input.display()
        ),
    }
}

struct HelpTopicRef(u32);

impl fmt::Display for HelpTopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "For more information run \"irforge explain conversion-errors\" (#{}).",
            self.0
        )
    }
}
