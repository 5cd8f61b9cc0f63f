//! Export configuration for HuggingFace Llama to llmpkg conversion.

use llmpkg_storage::QuantMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for exporting a model. Every field has a default, so an empty
/// JSON object is a valid config and command-line flags override file values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Quantization for weight matrices: "q4" or "none"
    #[serde(default)]
    pub quant: QuantMode,

    /// Output package path
    #[serde(default = "default_output")]
    pub output: String,

    /// Llama generation (2 or 3). Version 3 reads special token ids from the tokenizer.
    #[serde(default = "default_llama_version")]
    pub llama_version: u8,

    /// Tokenizer files produced by the tokenizer exporter
    #[serde(default)]
    pub tokenizer: TokenizerPaths,

    /// Extra keys written into the architecture section, applied last.
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
}

/// Locations of the tokenizer artifacts. Relative to the working directory;
/// unset paths default to `tokenizer.bin` / `tokenizer.ini` in the model directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerPaths {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub config: Option<String>,
}

fn default_output() -> String {
    "llama.llmpkg".to_string()
}

fn default_llama_version() -> u8 {
    3
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            quant: QuantMode::default(),
            output: default_output(),
            llama_version: default_llama_version(),
            tokenizer: TokenizerPaths::default(),
            config_overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== ExportConfig tests ====================

    #[test]
    fn test_export_config_default() {
        let config = ExportConfig::default();
        assert_eq!(config.quant, QuantMode::Q4);
        assert_eq!(config.output, "llama.llmpkg");
        assert_eq!(config.llama_version, 3);
        assert!(config.tokenizer.model.is_none());
        assert!(config.config_overrides.is_empty());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let parsed: ExportConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, ExportConfig::default());
    }

    #[test]
    fn test_export_config_deserialization() {
        let json = r#"{
            "quant": "none",
            "output": "out/tiny.llmpkg",
            "llama_version": 2,
            "tokenizer": { "model": "tok/tokenizer.bin" },
            "config_overrides": { "max_ctx_length": "4096" }
        }"#;

        let config: ExportConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.quant, QuantMode::None);
        assert_eq!(config.output, "out/tiny.llmpkg");
        assert_eq!(config.llama_version, 2);
        assert_eq!(config.tokenizer.model.as_deref(), Some("tok/tokenizer.bin"));
        assert!(config.tokenizer.config.is_none());
        assert_eq!(config.config_overrides.get("max_ctx_length").map(String::as_str), Some("4096"));
    }

    #[test]
    fn test_export_config_rejects_unknown_quant() {
        let result: Result<ExportConfig, _> = serde_json::from_str(r#"{"quant": "q8_0"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_export_config_serialization() {
        let config = ExportConfig {
            quant: QuantMode::None,
            ..ExportConfig::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"quant\": \"none\""));

        let parsed: ExportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
