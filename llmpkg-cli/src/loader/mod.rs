//! Loading HuggingFace Llama checkpoints into the in-memory model.
//!
//! A checkpoint directory holds `config.json` and one or more `.safetensors`
//! shards using the `model.layers.{i}.*` naming scheme.

use anyhow::{Context, Result};
use candle_core::Tensor;
use llmpkg_storage::{
    LlamaAttention, LlamaBlock, LlamaConfig, LlamaMlp, LlamaModel, RmsNorm,
};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::common::{discover_safetensor_files, load_json, tensor_from_view};

/// All tensors of a checkpoint keyed by their source names.
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    /// Read every tensor from the given shards. Names must be unique across shards.
    pub fn load(files: &[PathBuf]) -> Result<Self> {
        let mut tensors = HashMap::new();

        for file in files {
            let bytes = fs::read(file)
                .with_context(|| format!("Failed to read: {}", file.display()))?;
            let st = SafeTensors::deserialize(&bytes)
                .with_context(|| format!("Failed to parse safetensors: {}", file.display()))?;

            for (name, view) in st.tensors() {
                let tensor = tensor_from_view(&view)
                    .with_context(|| format!("Failed to load tensor: {}", name))?;
                if tensors.insert(name.clone(), tensor).is_some() {
                    anyhow::bail!("Tensor {} appears in more than one shard", name);
                }
            }
            debug!(file = %file.display(), total = tensors.len(), "loaded shard");
        }

        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Remove and return a tensor.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .with_context(|| format!("Missing tensor: {}", name))
    }

    /// Names not consumed yet, sorted.
    pub fn remaining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn norm(tensors: &mut TensorMap, name: &str) -> Result<RmsNorm> {
    Ok(RmsNorm {
        weight: tensors.take(name)?,
    })
}

fn block(tensors: &mut TensorMap, config: &LlamaConfig, i: usize) -> Result<LlamaBlock> {
    let p = format!("model.layers.{}", i);
    let w = |part: &str| format!("{}.{}.weight", p, part);

    Ok(LlamaBlock {
        input_norm: norm(tensors, &w("input_layernorm"))?,
        attn: LlamaAttention {
            q_proj: tensors.take(&w("self_attn.q_proj"))?,
            k_proj: tensors.take(&w("self_attn.k_proj"))?,
            v_proj: tensors.take(&w("self_attn.v_proj"))?,
            o_proj: tensors.take(&w("self_attn.o_proj"))?,
            rotary_emb: Some(config.rotary_embedding()),
        },
        post_attn_norm: norm(tensors, &w("post_attention_layernorm"))?,
        mlp: LlamaMlp {
            gate_proj: tensors.take(&w("mlp.gate_proj"))?,
            up_proj: tensors.take(&w("mlp.up_proj"))?,
            down_proj: tensors.take(&w("mlp.down_proj"))?,
        },
    })
}

/// Assemble a [`LlamaModel`] from a parsed config and its tensors.
pub fn build_llama(config: LlamaConfig, mut tensors: TensorMap) -> Result<LlamaModel> {
    let embed_tokens = tensors.take("model.embed_tokens.weight")?;
    let norm = norm(&mut tensors, "model.norm.weight")?;

    let layers = (0..config.num_hidden_layers)
        .map(|i| block(&mut tensors, &config, i))
        .collect::<Result<Vec<_>>>()?;

    let lm_head = if tensors.contains("lm_head.weight") {
        tensors.take("lm_head.weight")?
    } else if config.tie_word_embeddings {
        embed_tokens.clone()
    } else {
        anyhow::bail!("Missing tensor: lm_head.weight (and tie_word_embeddings is false)");
    };

    for name in tensors.remaining() {
        // e.g. rotary_emb.inv_freq buffers in older checkpoints
        debug!(tensor = name, "ignoring unused tensor");
    }

    Ok(LlamaModel {
        config,
        embed_tokens,
        norm,
        layers,
        lm_head,
    })
}

/// Load `config.json` and every safetensors shard from a checkpoint directory.
pub fn load_llama(model_dir: &Path) -> Result<LlamaModel> {
    if !model_dir.is_dir() {
        anyhow::bail!("Model path must be a directory: {}", model_dir.display());
    }

    let config: LlamaConfig = load_json(&model_dir.join("config.json"))?;
    let files = discover_safetensor_files(model_dir)?;
    println!(
        "Loading {} layers from {} file(s)...",
        config.num_hidden_layers,
        files.len()
    );

    let tensors = TensorMap::load(&files)?;
    println!("Loaded {} tensors", tensors.len());

    build_llama(config, tensors)
}
