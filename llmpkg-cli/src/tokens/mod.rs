//! Tokenizer inputs for a package.
//!
//! The tokenizer itself is produced by a separate exporter; this module only
//! locates its two output files and reads the special token ids Llama 3 needs.

mod special;

use anyhow::{Context, Result};
use llmpkg_storage::{TOKENIZER_BIN, TOKENIZER_INI, TokenizerArtifacts};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::export_config::TokenizerPaths;

pub use special::SpecialTokenIds;

/// Resolve artifact paths, defaulting to the files next to the checkpoint.
pub fn resolve_paths(paths: &TokenizerPaths, model_dir: &Path) -> (PathBuf, PathBuf) {
    let pick = |path: &Option<String>, default: &str| {
        path.as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join(default))
    };
    (
        pick(&paths.model, TOKENIZER_BIN),
        pick(&paths.config, TOKENIZER_INI),
    )
}

/// Read both tokenizer files. Their bytes are stored in the package unchanged.
pub fn load_artifacts(paths: &TokenizerPaths, model_dir: &Path) -> Result<TokenizerArtifacts> {
    let (model_path, config_path) = resolve_paths(paths, model_dir);

    let model = fs::read(&model_path).with_context(|| {
        format!(
            "Failed to read tokenizer model: {} (export the tokenizer first or pass --tokenizer-model)",
            model_path.display()
        )
    })?;
    let config = fs::read(&config_path).with_context(|| {
        format!(
            "Failed to read tokenizer config: {} (export the tokenizer first or pass --tokenizer-config)",
            config_path.display()
        )
    })?;

    Ok(TokenizerArtifacts::new(model, config))
}
