//! Rotary position embedding parameters and the precomputed cos/sin cache.

use std::f64::consts::PI;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// `rope_scaling` block of a HuggingFace config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "type", default = "default_rope_type")]
    pub rope_type: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
}

fn default_rope_type() -> String {
    "default".to_string()
}

fn default_factor() -> f64 {
    1.0
}

impl RopeScaling {
    /// Reject scaling types the runtime has no implementation for.
    pub fn validate(&self) -> Result<()> {
        match self.rope_type.as_str() {
            "default" => Ok(()),
            "linear" | "llama3" if self.factor.is_nan() || self.factor <= 0.0 => Err(
                ExportError::UnsupportedConfiguration(format!(
                    "rope_scaling factor must be positive, got {}",
                    self.factor
                )),
            ),
            "linear" => Ok(()),
            "llama3" => {
                let (low, high, _) = self.llama3_params()?;
                if low >= high {
                    return Err(ExportError::UnsupportedConfiguration(format!(
                        "llama3 rope_scaling needs low_freq_factor < high_freq_factor, got {low} and {high}"
                    )));
                }
                Ok(())
            }
            other => Err(ExportError::UnsupportedConfiguration(format!(
                "rope_scaling type '{other}' is not supported"
            ))),
        }
    }

    fn llama3_params(&self) -> Result<(f64, f64, usize)> {
        match (
            self.low_freq_factor,
            self.high_freq_factor,
            self.original_max_position_embeddings,
        ) {
            (Some(low), Some(high), Some(original)) => Ok((low, high, original)),
            _ => Err(ExportError::UnsupportedConfiguration(
                "llama3 rope_scaling requires low_freq_factor, high_freq_factor and original_max_position_embeddings".to_string(),
            )),
        }
    }
}

/// Rotary embedding of one attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEmbedding {
    /// Rotated dimensions per head.
    pub dim: usize,
    /// Base frequency (`rope_theta`).
    pub base: f64,
    /// Positions covered by the exported cache.
    pub original_max_seq_len: usize,
    pub scaling: Option<RopeScaling>,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, base: f64, original_max_seq_len: usize) -> Self {
        Self {
            dim,
            base,
            original_max_seq_len,
            scaling: None,
        }
    }

    pub fn with_scaling(mut self, scaling: Option<RopeScaling>) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 || !self.dim.is_multiple_of(2) {
            return Err(ExportError::StructuralMismatch(format!(
                "rotary dimension must be even and non-zero, got {}",
                self.dim
            )));
        }
        if self.original_max_seq_len == 0 {
            return Err(ExportError::StructuralMismatch(
                "rotary cache needs at least one position".to_string(),
            ));
        }
        if let Some(scaling) = &self.scaling {
            scaling.validate()?;
        }
        Ok(())
    }

    /// Inverse frequencies for the `dim / 2` rotated pairs, scaling applied.
    pub fn inv_freq(&self) -> Result<Vec<f32>> {
        self.validate()?;
        let base: Vec<f64> = (0..self.dim)
            .step_by(2)
            .map(|i| 1.0 / self.base.powf(i as f64 / self.dim as f64))
            .collect();

        let scaled = match &self.scaling {
            None => base,
            Some(s) if s.rope_type == "default" => base,
            Some(s) if s.rope_type == "linear" => base.into_iter().map(|f| f / s.factor).collect(),
            Some(s) => {
                let (low_freq_factor, high_freq_factor, original) = s.llama3_params()?;
                let original = original as f64;
                let low_freq_wavelen = original / low_freq_factor;
                let high_freq_wavelen = original / high_freq_factor;

                base.into_iter()
                    .map(|freq| {
                        let wavelen = 2.0 * PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / s.factor
                        } else {
                            let smooth = (original / wavelen - low_freq_factor)
                                / (high_freq_factor - low_freq_factor);
                            (1.0 - smooth) * freq / s.factor + smooth * freq
                        }
                    })
                    .collect()
            }
        };

        Ok(scaled.into_iter().map(|f| f as f32).collect())
    }

    /// Cos/sin cache over positions `0..original_max_seq_len`.
    ///
    /// Shape `[2, 1, seq, dim]` in f32: index 0 holds cos, index 1 holds sin, and
    /// each row repeats the frequencies across both halves of the head.
    pub fn position_cache(&self) -> Result<Tensor> {
        let inv_freq = self.inv_freq()?;
        let half = inv_freq.len();
        let seq = self.original_max_seq_len;
        let device = Device::Cpu;

        let inv_freq = Tensor::from_vec(inv_freq, (1, half), &device)?;
        let positions = Tensor::arange(0u32, seq as u32, &device)?
            .to_dtype(DType::F32)?
            .reshape((seq, 1))?;

        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos = emb.cos()?.unsqueeze(0)?;
        let sin = emb.sin()?.unsqueeze(0)?;
        Ok(Tensor::stack(&[cos, sin], 0)?)
    }
}
