//! Export a HuggingFace Llama checkpoint to an `.llmpkg` package.

use anyhow::{Context, Result};
use llmpkg_storage::{LlamaConfig, LlamaExporter, Packager, QuantMode};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::common::{load_config, load_json};
use crate::config::export_config::{ExportConfig, TokenizerPaths};
use crate::loader::load_llama;
use crate::tokens::{self, SpecialTokenIds};

/// Vocab size from which a checkpoint is assumed to be Llama 3.
const LLAMA3_MIN_VOCAB: usize = 128_000;

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct ExportArgs<'a> {
    pub config_path: Option<&'a str>,
    pub quant: Option<&'a str>,
    pub output: Option<&'a str>,
    pub llama_version: Option<u8>,
    pub tokenizer_model: Option<&'a str>,
    pub tokenizer_config: Option<&'a str>,
}

/// Merge the config file with command-line overrides.
pub fn resolve_config(args: &ExportArgs<'_>) -> Result<ExportConfig> {
    let mut config: ExportConfig = load_config(args.config_path)?;

    if let Some(quant) = args.quant {
        config.quant = QuantMode::from_str(quant)?;
    }
    if let Some(output) = args.output {
        config.output = output.to_string();
    }
    if let Some(version) = args.llama_version {
        config.llama_version = version;
    }
    if let Some(path) = args.tokenizer_model {
        config.tokenizer.model = Some(path.to_string());
    }
    if let Some(path) = args.tokenizer_config {
        config.tokenizer.config = Some(path.to_string());
    }

    if !matches!(config.llama_version, 2 | 3) {
        anyhow::bail!(
            "Unsupported llama_version: {} (expected 2 or 3)",
            config.llama_version
        );
    }

    Ok(config)
}

/// Generate an export config template from a checkpoint's `config.json`.
pub fn generate_config_template(model_path: &str) -> Result<()> {
    let model_dir = Path::new(model_path);
    let llama: LlamaConfig = load_json(&model_dir.join("config.json"))?;

    println!(
        "Model: {} layers, hidden {}, {} heads ({} kv), vocab {}",
        llama.num_hidden_layers,
        llama.hidden_size,
        llama.num_attention_heads,
        llama.num_key_value_heads(),
        llama.vocab_size
    );

    let config = template_for(&llama, model_dir);
    fs::write("export_config.json", serde_json::to_string_pretty(&config)?)
        .context("Failed to write export_config.json")?;

    println!(
        "\nGenerated export_config.json (llama_version {}, quant {})",
        config.llama_version, config.quant
    );
    println!(
        "Run: llmpkg export --model {} --config export_config.json",
        model_path
    );

    Ok(())
}

fn template_for(llama: &LlamaConfig, model_dir: &Path) -> ExportConfig {
    let (tokenizer_model, tokenizer_config) =
        tokens::resolve_paths(&TokenizerPaths::default(), model_dir);

    ExportConfig {
        llama_version: if llama.vocab_size >= LLAMA3_MIN_VOCAB { 3 } else { 2 },
        tokenizer: TokenizerPaths {
            model: Some(tokenizer_model.to_string_lossy().into_owned()),
            config: Some(tokenizer_config.to_string_lossy().into_owned()),
        },
        ..ExportConfig::default()
    }
}

/// Run the export: load the checkpoint, resolve special tokens, write the package.
pub fn run(model_path: &str, args: &ExportArgs<'_>) -> Result<()> {
    let config = resolve_config(args)?;
    let model_dir = Path::new(model_path);

    let tokenizer = tokens::load_artifacts(&config.tokenizer, model_dir)?;
    let model = load_llama(model_dir)?;

    let mut packager = Packager::new(&config.output, tokenizer);
    if config.llama_version == 3 {
        let ids = SpecialTokenIds::resolve(model_dir, &model.config)?;
        println!(
            "Special tokens: bot={} eot={} eot_id={}",
            ids.bot,
            ids.eot,
            ids.eot_id.map_or_else(|| "-".to_string(), |id| id.to_string())
        );
        packager = packager
            .config_override("bot_token_id", ids.bot)
            .config_override("eot_token_id", ids.eot);
        if let Some(eot_id) = ids.eot_id {
            packager = packager.config_override("eot_id", eot_id);
        }
    }
    for (key, value) in &config.config_overrides {
        packager = packager.config_override(key.as_str(), value);
    }

    println!(
        "Exporting to llmpkg ({} quantization): {}",
        config.quant, config.output
    );

    let summary = packager
        .build(&LlamaExporter, &model, config.quant)
        .with_context(|| format!("Failed to export {}", model_path))?;

    println!(
        "Done! {} tensors, {} bytes ({} bytes tensor stream)",
        summary.tensor_count, summary.archive_bytes, summary.tensor_bytes
    );

    Ok(())
}
