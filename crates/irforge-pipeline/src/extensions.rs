use crate::{AttrValue, ExtensionExtractor, ExtractedAttributes, PipelineError, RawNode};
use libloading::Library;
use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Exported by a custom operations library to announce the operations it
/// implements, as a comma-separated list. A leading `!` on an entry lets it
/// replace a built-in extractor.
pub const CUSTOM_OPS_SYMBOL: &[u8] = b"irforge_custom_ops";

type CustomOpsFn = unsafe extern "C" fn() -> *const c_char;

#[derive(Clone, Default)]
pub struct LoadedExtensions {
    pub libraries: Vec<PathBuf>,
    pub extractors: Vec<ExtensionExtractor>,
}

impl std::fmt::Debug for LoadedExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtensions")
            .field("libraries", &self.libraries)
            .field(
                "extractors",
                &self.extractors.iter().map(|e| e.op.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl LoadedExtensions {
    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty() && self.extractors.is_empty()
    }
}

pub trait ExtensionLoader: Send + Sync {
    fn load(&self, libraries: &[PathBuf]) -> Result<LoadedExtensions, PipelineError>;
}

/// Loads shared libraries with `libloading`. Handles stay open for as long
/// as the loader lives, so operations the libraries registered on load keep
/// working.
#[derive(Default)]
pub struct DylibExtensionLoader {
    open: Mutex<Vec<Library>>,
}

impl DylibExtensionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or_default()
    }

    fn load_one(&self, path: &Path) -> Result<Vec<ExtensionExtractor>, PipelineError> {
        let extension_error = |message: String| PipelineError::Extension {
            library: path.to_path_buf(),
            message,
        };

        // SAFETY: loading runs the library's initializers; custom operation
        // libraries are trusted input named explicitly by the user.
        let library = unsafe { Library::new(path) }.map_err(|error| extension_error(error.to_string()))?;

        let announced = unsafe {
            match library.get::<CustomOpsFn>(CUSTOM_OPS_SYMBOL) {
                Ok(symbol) => {
                    let list = symbol();
                    if list.is_null() {
                        None
                    } else {
                        Some(
                            CStr::from_ptr(list)
                                .to_str()
                                .map_err(|error| {
                                    extension_error(format!("operation list is not UTF-8: {error}"))
                                })?
                                .to_string(),
                        )
                    }
                }
                Err(_) => None,
            }
        };

        let source = path.display().to_string();
        let extractors = announced
            .as_deref()
            .map(|list| announced_extractors(list, &source))
            .unwrap_or_default();

        self.open
            .lock()
            .map_err(|_| extension_error("extension registry lock is poisoned".to_string()))?
            .push(library);
        Ok(extractors)
    }
}

impl ExtensionLoader for DylibExtensionLoader {
    fn load(&self, libraries: &[PathBuf]) -> Result<LoadedExtensions, PipelineError> {
        let mut loaded = LoadedExtensions::default();
        for path in libraries {
            let extractors = self.load_one(path)?;
            tracing::info!(
                library = %path.display(),
                operations = extractors.len(),
                "custom operations library loaded"
            );
            loaded.libraries.push(path.clone());
            loaded.extractors.extend(extractors);
        }
        Ok(loaded)
    }
}

/// Extractors for an announced operation list. Each copies the framework
/// attributes through and uses the operation name as the IR type.
pub fn announced_extractors(list: &str, source: &str) -> Vec<ExtensionExtractor> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (op, allow_override) = match entry.strip_prefix('!') {
                Some(op) => (op.trim(), true),
                None => (entry, false),
            };
            ExtensionExtractor {
                op: op.to_string(),
                extractor: Arc::new(pass_through_extract),
                source: source.to_string(),
                allow_override,
            }
        })
        .collect()
}

fn pass_through_extract(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs: ExtractedAttributes = node.attrs.clone();
    attrs.insert("type".to_string(), AttrValue::String(node.op.clone()));
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announced_extractors_override_marker_expected_flag_set() {
        let extractors = announced_extractors("FusedGelu, !Relu ,", "libfast.so");

        let summary: Vec<(&str, bool)> = extractors
            .iter()
            .map(|extension| (extension.op.as_str(), extension.allow_override))
            .collect();
        assert_eq!(summary, vec![("FusedGelu", false), ("Relu", true)]);
        assert!(extractors.iter().all(|extension| extension.source == "libfast.so"));
    }

    #[test]
    fn pass_through_extract_expected_attrs_copied_and_type_set() {
        let node = RawNode::new("g", "FusedGelu").with_attr("approximate", AttrValue::Boolean(true));

        let attrs = pass_through_extract(&node).expect("extract");
        assert_eq!(attrs.get("type"), Some(&AttrValue::String("FusedGelu".to_string())));
        assert_eq!(attrs.get("approximate"), Some(&AttrValue::Boolean(true)));
    }

    #[test]
    fn dylib_loader_missing_library_expected_extension_error() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let missing = dir.path().join("libmissing.so");

        let loader = DylibExtensionLoader::new();

        let error = loader
            .load(&[missing.clone()])
            .expect_err("missing library must fail");

        assert!(error.is_malformed_input());
        assert!(matches!(error, PipelineError::Extension { library, .. } if library == missing));
        assert_eq!(loader.open_count(), 0);
    }
}
