use crate::{AttrValue, Graph, Node, PipelineError, RawNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type ExtractedAttributes = BTreeMap<String, AttrValue>;

/// Normalizes one framework node into the IR attribute schema.
pub trait Extractor: Send + Sync {
    fn extract(&self, node: &RawNode) -> Result<ExtractedAttributes, String>;
}

impl<F> Extractor for F
where
    F: Fn(&RawNode) -> Result<ExtractedAttributes, String> + Send + Sync,
{
    fn extract(&self, node: &RawNode) -> Result<ExtractedAttributes, String> {
        self(node)
    }
}

pub type SharedExtractor = Arc<dyn Extractor>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorSource {
    Builtin,
    Extension(String),
}

impl fmt::Display for ExtractorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => f.write_str("the built-in set"),
            Self::Extension(name) => write!(f, "extension '{name}'"),
        }
    }
}

/// Extractor contributed by a custom operations library.
#[derive(Clone)]
pub struct ExtensionExtractor {
    pub op: String,
    pub extractor: SharedExtractor,
    pub source: String,
    pub allow_override: bool,
}

#[derive(Clone)]
struct ExtractorEntry {
    extractor: SharedExtractor,
    source: ExtractorSource,
}

#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    entries: BTreeMap<String, ExtractorEntry>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `extractor` for `op`. Returns the source it replaced when
    /// `allow_override` let it displace a built-in entry. An entry from an
    /// extension is never displaced.
    pub fn register(
        &mut self,
        op: impl Into<String>,
        extractor: SharedExtractor,
        source: ExtractorSource,
        allow_override: bool,
    ) -> Result<Option<ExtractorSource>, PipelineError> {
        let op = op.into();
        if let Some(existing) = self.entries.get(&op) {
            if !allow_override || existing.source != ExtractorSource::Builtin {
                return Err(PipelineError::DuplicateExtractor {
                    op,
                    existing: existing.source.clone(),
                    incoming: source,
                });
            }
            tracing::debug!(op = %op, replaced = %existing.source, by = %source, "extractor overridden");
        }
        Ok(self
            .entries
            .insert(op, ExtractorEntry { extractor, source })
            .map(|entry| entry.source))
    }

    pub fn register_builtin(
        &mut self,
        op: impl Into<String>,
        extractor: impl Extractor + 'static,
    ) -> Result<(), PipelineError> {
        self.register(op, Arc::new(extractor), ExtractorSource::Builtin, false)
            .map(|_| ())
    }

    pub fn merge_extensions(
        &mut self,
        extensions: impl IntoIterator<Item = ExtensionExtractor>,
    ) -> Result<usize, PipelineError> {
        let mut merged = 0;
        for extension in extensions {
            self.register(
                extension.op,
                extension.extractor,
                ExtractorSource::Extension(extension.source),
                extension.allow_override,
            )?;
            merged += 1;
        }
        Ok(merged)
    }

    pub fn contains(&self, op: &str) -> bool {
        self.entries.contains_key(op)
    }

    pub fn source_of(&self, op: &str) -> Option<&ExtractorSource> {
        self.entries.get(op).map(|entry| &entry.source)
    }

    pub fn ops(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rejects tags that differ only by letter case, e.g. `Conv2D` and
    /// `conv2d`.
    pub fn check_for_duplicates(&self) -> Result<(), PipelineError> {
        let mut by_lowercase: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for op in self.entries.keys() {
            by_lowercase
                .entry(op.to_ascii_lowercase())
                .or_default()
                .push(op);
        }
        let ops: Vec<String> = by_lowercase
            .into_values()
            .filter(|group| group.len() > 1)
            .flatten()
            .map(ToString::to_string)
            .collect();
        if ops.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::CaseInsensitiveExtractorDuplicates { ops })
        }
    }

    pub fn resolve(&self, node: &mut Node) -> Result<(), PipelineError> {
        let entry = self
            .entries
            .get(&node.op)
            .ok_or_else(|| PipelineError::UnresolvedOperator {
                node_id: node.id().to_string(),
                op: node.op.clone(),
            })?;

        let extracted = match node.raw.as_ref() {
            Some(raw) => entry.extractor.extract(raw),
            None => entry.extractor.extract(&RawNode::new(node.id(), node.op.clone())),
        }
        .map_err(|message| PipelineError::Extraction {
            node_id: node.id().to_string(),
            op: node.op.clone(),
            message,
        })?;

        node.attrs.clear_extracted();
        for (key, value) in extracted {
            if node.attrs.contains_key(&key) {
                tracing::debug!(node = node.id(), key = %key, "attribute written outside extraction kept");
                continue;
            }
            node.attrs.set_extracted(key, value);
        }
        Ok(())
    }

    /// Resolves every node, stopping at the first one that fails.
    pub fn resolve_all(&self, graph: &mut Graph) -> Result<usize, PipelineError> {
        self.check_for_duplicates()?;
        let mut resolved = 0;
        for node in graph.nodes_mut() {
            self.resolve(node)?;
            resolved += 1;
        }
        tracing::debug!(resolved, "node attributes extracted");
        Ok(resolved)
    }
}
