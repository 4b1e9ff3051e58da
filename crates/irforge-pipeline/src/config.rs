use crate::{Layout, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    #[serde(rename = "FP32", alias = "float", alias = "fp32")]
    FP32,
    #[serde(rename = "FP16", alias = "half", alias = "fp16")]
    FP16,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FP32 => "FP32",
            Self::FP16 => "FP16",
        }
    }

    pub fn byte_width(self) -> usize {
        match self {
            Self::FP32 => 4,
            Self::FP16 => 2,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "FP32" | "fp32" | "float" => Ok(Self::FP32),
            "FP16" | "fp16" | "half" => Ok(Self::FP16),
            other => Err(format!(
                "unsupported data type '{other}', expected FP32, FP16, float or half"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Json,
    Dot,
}

impl InputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "json" => Some(Self::Json),
            "dot" | "gv" => Some(Self::Dot),
            _ => None,
        }
    }
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "dot" | "gv" => Ok(Self::Dot),
            other => Err(format!("unknown input format '{other}', expected json or dot")),
        }
    }
}

/// Options of one conversion run. The whole struct is echoed into the graph
/// metadata and the emitted IR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub output_dir: PathBuf,
    pub output_model_name: Option<String>,
    pub data_type: DataType,
    pub disable_nhwc_to_nchw: bool,
    pub generate_experimental_ir_v10: bool,
    pub generate_deprecated_ir_v2: bool,
    /// Comma-delimited library paths.
    pub custom_op_libraries: Option<String>,
    pub graph_dump_dir: Option<PathBuf>,
    pub input_format: Option<InputFormat>,
    pub input_checkpoint: Option<PathBuf>,
    pub saved_model_dir: Option<PathBuf>,
    pub saved_model_tags: Vec<String>,
    pub output_nodes: Vec<String>,
}

impl ConversionConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|error| PipelineError::io(path, error))?;
        serde_json::from_str(&text).map_err(|error| {
            PipelineError::InvalidInput(format!(
                "configuration file '{}' is not valid: {error}",
                path.display()
            ))
        })
    }

    pub fn layout(&self) -> Layout {
        if self.disable_nhwc_to_nchw {
            Layout::Nchw
        } else {
            Layout::Nhwc
        }
    }

    pub fn ir_version(&self) -> i64 {
        if self.generate_deprecated_ir_v2 {
            2
        } else if self.generate_experimental_ir_v10 {
            10
        } else {
            6
        }
    }

    pub fn custom_op_library_paths(&self) -> Vec<PathBuf> {
        self.custom_op_libraries
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    pub fn model_name_for(&self, input_model: &Path) -> String {
        self.output_model_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                input_model
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "model".to_string())
    }

    pub fn input_format_for(&self, input_model: &Path) -> Result<InputFormat, PipelineError> {
        self.input_format
            .or_else(|| InputFormat::from_path(input_model))
            .ok_or_else(|| {
                PipelineError::InvalidInput(format!(
                    "cannot infer the format of '{}'; pass an explicit input format",
                    input_model.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ir_version_both_flags_expected_deprecated_wins() {
        let config = ConversionConfig {
            generate_experimental_ir_v10: true,
            generate_deprecated_ir_v2: true,
            ..ConversionConfig::default()
        };
        assert_eq!(config.ir_version(), 2);
        assert_eq!(ConversionConfig::default().ir_version(), 6);
    }

    #[test]
    fn layout_disable_flag_expected_nchw() {
        let config = ConversionConfig {
            disable_nhwc_to_nchw: true,
            ..ConversionConfig::default()
        };
        assert_eq!(config.layout(), Layout::Nchw);
        assert_eq!(ConversionConfig::default().layout(), Layout::Nhwc);
    }

    #[test]
    fn custom_op_library_paths_expected_split_and_trimmed() {
        let config = ConversionConfig {
            custom_op_libraries: Some(" libA.so, ,libB.so ".to_string()),
            ..ConversionConfig::default()
        };
        assert_eq!(
            config.custom_op_library_paths(),
            vec![PathBuf::from("libA.so"), PathBuf::from("libB.so")]
        );
    }

    #[test]
    fn model_name_for_no_override_expected_input_stem() {
        let config = ConversionConfig::default();
        assert_eq!(config.model_name_for(Path::new("/models/resnet.pb.json")), "resnet.pb");
    }

    #[test]
    fn load_from_path_partial_file_expected_defaults_and_aliases() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        write!(
            file,
            r#"{{ "data_type": "half", "output_nodes": ["logits"], "input_format": "dot" }}"#
        )
        .expect("config should be written");

        let config = ConversionConfig::load_from_path(file.path()).expect("config should load");
        assert_eq!(config.data_type, DataType::FP16);
        assert_eq!(config.output_nodes, vec!["logits"]);
        assert_eq!(config.input_format, Some(InputFormat::Dot));
        assert!(!config.disable_nhwc_to_nchw);
    }

    #[test]
    fn input_format_for_unknown_extension_expected_invalid_input() {
        let error = ConversionConfig::default()
            .input_format_for(Path::new("model.pb"))
            .expect_err("unknown extension must fail");
        assert!(error.is_malformed_input());
    }
}
