//! Llama architecture: hyperparameters, weights and the tensor layout the
//! runtime expects.
//!
//! Record order under the `llama` root:
//! - `embd`, `norm.weight`, `rope`
//! - per block `blockN`: `input_norm.weight`, `attn.qkv_proj.weight`,
//!   `attn.out_proj.weight`, `post_attn_norm.weight`, `mlp.gate_up_proj.weight`,
//!   `mlp.down_proj.weight`
//! - `out_proj.weight`
//!
//! Norm weights and the rotary cache are always stored unquantized.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::rope::{RopeScaling, RotaryEmbedding};
use super::{ModelExporter, TensorEntry};
use crate::config::ConfigSection;
use crate::context::Context;
use crate::error::{ExportError, Result};
use crate::quant::QuantMode;

/// Placeholder special-token ids written until the tokenizer provides real ones.
pub const DEFAULT_BOT_TOKEN_ID: u32 = 1;
pub const DEFAULT_EOT_TOKEN_ID: u32 = 2;

/// A token id field that may hold one id or a list (`eos_token_id` in Llama 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenId {
    pub fn first(&self) -> Option<u32> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Multiple(ids) => ids.first().copied(),
        }
    }
}

/// Hyperparameters, deserialized from a HuggingFace `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub intermediate_size: usize,
    pub rms_norm_eps: f64,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_pretraining_tp")]
    pub pretraining_tp: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<TokenId>,
    #[serde(default)]
    pub eos_token_id: Option<TokenId>,
}

fn default_pretraining_tp() -> usize {
    1
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f64 {
    10000.0
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Rotary embedding shared by every attention layer.
    pub fn rotary_embedding(&self) -> RotaryEmbedding {
        RotaryEmbedding::new(self.head_dim(), self.rope_theta, self.max_position_embeddings)
            .with_scaling(self.rope_scaling.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RmsNorm {
    pub weight: Tensor,
}

#[derive(Debug, Clone)]
pub struct LlamaAttention {
    pub q_proj: Tensor,
    pub k_proj: Tensor,
    pub v_proj: Tensor,
    pub o_proj: Tensor,
    pub rotary_emb: Option<RotaryEmbedding>,
}

#[derive(Debug, Clone)]
pub struct LlamaMlp {
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

#[derive(Debug, Clone)]
pub struct LlamaBlock {
    pub input_norm: RmsNorm,
    pub attn: LlamaAttention,
    pub post_attn_norm: RmsNorm,
    pub mlp: LlamaMlp,
}

/// A loaded Llama model. Weights are `[out, in]` matrices as in the checkpoint.
#[derive(Debug, Clone)]
pub struct LlamaModel {
    pub config: LlamaConfig,
    pub embed_tokens: Tensor,
    pub norm: RmsNorm,
    pub layers: Vec<LlamaBlock>,
    pub lm_head: Tensor,
}

impl LlamaModel {
    /// Rotary embedding of the first block, the source of the exported cache.
    fn first_rotary(&self) -> Result<&RotaryEmbedding> {
        let first = self.layers.first().ok_or_else(|| {
            ExportError::StructuralMismatch("model has no transformer blocks".to_string())
        })?;
        first.attn.rotary_emb.as_ref().ok_or_else(|| {
            ExportError::StructuralMismatch(
                "first block has no rotary embedding".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaExporter;

impl LlamaExporter {
    fn rms_norm(entries: &mut Vec<TensorEntry>, ctx: &Context, norm: &RmsNorm) {
        entries.push(TensorEntry::tensor(
            ctx.with_subname("weight").with_quant(QuantMode::None),
            norm.weight.clone(),
        ));
    }

    fn block(entries: &mut Vec<TensorEntry>, ctx: &Context, block: &LlamaBlock) {
        Self::rms_norm(entries, &ctx.with_subname("input_norm"), &block.input_norm);

        let attn = ctx.with_subname("attn");
        entries.push(TensorEntry::concat(
            attn.with_subname("qkv_proj.weight"),
            vec![
                block.attn.q_proj.clone(),
                block.attn.k_proj.clone(),
                block.attn.v_proj.clone(),
            ],
        ));
        entries.push(TensorEntry::tensor(
            attn.with_subname("out_proj.weight"),
            block.attn.o_proj.clone(),
        ));

        Self::rms_norm(entries, &ctx.with_subname("post_attn_norm"), &block.post_attn_norm);

        let mlp = ctx.with_subname("mlp");
        entries.push(TensorEntry::concat(
            mlp.with_subname("gate_up_proj.weight"),
            vec![block.mlp.gate_proj.clone(), block.mlp.up_proj.clone()],
        ));
        entries.push(TensorEntry::tensor(
            mlp.with_subname("down_proj.weight"),
            block.mlp.down_proj.clone(),
        ));
    }
}

impl ModelExporter for LlamaExporter {
    type Model = LlamaModel;

    fn architecture(&self) -> &'static str {
        "llama"
    }

    fn check_config(&self, model: &LlamaModel) -> Result<()> {
        let config = &model.config;
        if config.pretraining_tp != 1 {
            return Err(ExportError::UnsupportedConfiguration(format!(
                "pretraining_tp = {} (only 1 is supported)",
                config.pretraining_tp
            )));
        }
        if config.hidden_act != "silu" {
            return Err(ExportError::UnsupportedConfiguration(format!(
                "hidden_act = '{}' (only silu is supported)",
                config.hidden_act
            )));
        }
        if config.num_attention_heads == 0 {
            return Err(ExportError::UnsupportedConfiguration(
                "num_attention_heads = 0".to_string(),
            ));
        }
        if let Some(scaling) = &config.rope_scaling {
            scaling.validate()?;
        }

        if model.layers.len() != config.num_hidden_layers {
            return Err(ExportError::StructuralMismatch(format!(
                "model has {} blocks but num_hidden_layers = {}",
                model.layers.len(),
                config.num_hidden_layers
            )));
        }
        model.first_rotary()?.validate()
    }

    fn traverse(&self, model: &LlamaModel, ctx: &Context) -> Result<Vec<TensorEntry>> {
        let rope = model.first_rotary()?.position_cache()?;

        let mut entries = Vec::with_capacity(4 + 6 * model.layers.len());
        entries.push(TensorEntry::tensor(
            ctx.with_subname("embd"),
            model.embed_tokens.clone(),
        ));
        Self::rms_norm(&mut entries, &ctx.with_subname("norm"), &model.norm);
        entries.push(TensorEntry::tensor(
            ctx.with_subname("rope").with_quant(QuantMode::None),
            rope,
        ));

        for (idx, block) in model.layers.iter().enumerate() {
            Self::block(&mut entries, &ctx.with_subname(&format!("block{idx}")), block);
        }

        entries.push(TensorEntry::tensor(
            ctx.with_subname("out_proj.weight"),
            model.lm_head.clone(),
        ));
        Ok(entries)
    }

    fn generate_config(&self, model: &LlamaModel) -> Result<ConfigSection> {
        let config = &model.config;
        let mut section = ConfigSection::new(self.architecture());
        section
            .set("hidden_size", config.hidden_size)
            .set("num_heads", config.num_attention_heads)
            .set("num_key_value_heads", config.num_key_value_heads())
            .set("intermediate_size", config.intermediate_size)
            .set("norm_eps", config.rms_norm_eps)
            .set("num_layers", config.num_hidden_layers)
            .set("vocab_size", config.vocab_size)
            .set("max_ctx_length", config.max_position_embeddings)
            .set("bot_token_id", DEFAULT_BOT_TOKEN_ID)
            .set("eot_token_id", DEFAULT_EOT_TOKEN_ID);
        Ok(section)
    }
}
