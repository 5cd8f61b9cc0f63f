//! Special token ids for Llama 3 packages.
//!
//! The ids come from the HuggingFace tokenizer files in the checkpoint
//! directory, falling back to `bos_token_id` / `eos_token_id` in `config.json`.

use anyhow::{Context, Result};
use llmpkg_storage::{LlamaConfig, TokenId};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// End-of-turn marker used by Llama 3 chat templates.
pub const EOT_ID_TOKEN: &str = "<|eot_id|>";

/// Token string to id mapping built from HuggingFace tokenizer files.
#[derive(Debug, Default)]
pub struct VocabLookup {
    ids: HashMap<String, u32>,
}

impl VocabLookup {
    /// Collect ids from `tokenizer.json` (model vocab and added tokens) and
    /// `tokenizer_config.json` (`added_tokens_decoder`). Missing files are skipped.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let mut lookup = Self::default();

        if let Some(json) = read_optional_json(&model_dir.join("tokenizer.json"))? {
            lookup.add_tokenizer_json(&json);
        }
        if let Some(json) = read_optional_json(&model_dir.join("tokenizer_config.json"))? {
            lookup.add_tokenizer_config(&json);
        }

        debug!(tokens = lookup.ids.len(), "built vocab lookup");
        Ok(lookup)
    }

    pub fn insert(&mut self, token: impl Into<String>, id: u32) {
        self.ids.insert(token.into(), id);
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn add_tokenizer_json(&mut self, json: &serde_json::Value) {
        if let Some(vocab) = json.pointer("/model/vocab").and_then(|v| v.as_object()) {
            for (token, id) in vocab {
                if let Some(id) = id.as_u64().and_then(|id| u32::try_from(id).ok()) {
                    self.insert(token.as_str(), id);
                }
            }
        }

        // Added tokens take precedence over the base vocab
        if let Some(added) = json.get("added_tokens").and_then(|v| v.as_array()) {
            for token in added {
                let id = token.get("id").and_then(|v| v.as_u64());
                let content = token.get("content").and_then(|v| v.as_str());
                if let (Some(id), Some(content)) = (id, content)
                    && let Ok(id) = u32::try_from(id)
                {
                    self.insert(content, id);
                }
            }
        }
    }

    fn add_tokenizer_config(&mut self, json: &serde_json::Value) {
        let Some(decoder) = json.get("added_tokens_decoder").and_then(|v| v.as_object()) else {
            return;
        };
        for (id, token) in decoder {
            let content = token.get("content").and_then(|v| v.as_str());
            if let (Ok(id), Some(content)) = (id.parse::<u32>(), content) {
                self.insert(content, id);
            }
        }
    }
}

/// Ids written into the `[llama]` section of a Llama 3 package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub bot: u32,
    pub eot: u32,
    /// Absent in tokenizers without a chat template.
    pub eot_id: Option<u32>,
}

impl SpecialTokenIds {
    /// Resolve the ids from the tokenizer files in a checkpoint directory.
    pub fn resolve(model_dir: &Path, config: &LlamaConfig) -> Result<Self> {
        let tokenizer_config = read_optional_json(&model_dir.join("tokenizer_config.json"))?;
        let vocab = VocabLookup::from_model_dir(model_dir)?;
        Self::from_parts(tokenizer_config.as_ref(), &vocab, config)
    }

    pub fn from_parts(
        tokenizer_config: Option<&serde_json::Value>,
        vocab: &VocabLookup,
        config: &LlamaConfig,
    ) -> Result<Self> {
        let lookup = |key: &str| {
            tokenizer_config
                .and_then(|json| extract_token_string(json, key))
                .and_then(|token| vocab.get(&token))
        };

        let bot = lookup("bos_token")
            .or_else(|| config.bos_token_id.as_ref().and_then(TokenId::first))
            .context("Cannot determine the bos token id from the tokenizer or config.json")?;
        let eot = lookup("eos_token")
            .or_else(|| config.eos_token_id.as_ref().and_then(TokenId::first))
            .context("Cannot determine the eos token id from the tokenizer or config.json")?;

        let eot_id = vocab.get(EOT_ID_TOKEN);
        if eot_id.is_none() {
            warn!("{} not found in tokenizer, eot_id left unset", EOT_ID_TOKEN);
        }

        Ok(Self { bot, eot, eot_id })
    }
}

fn read_optional_json(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let json = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(json))
}

/// Extract a token string from JSON (handles both string and object formats).
fn extract_token_string(json: &serde_json::Value, key: &str) -> Option<String> {
    json.get(key).and_then(|v| {
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else if let Some(obj) = v.as_object() {
            obj.get("content").and_then(|c| c.as_str()).map(String::from)
        } else {
            None
        }
    })
}
