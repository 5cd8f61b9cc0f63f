//! Model traversal and export.
//!
//! An architecture implements [`ModelExporter`] to describe which tensors it has,
//! under which names, and how its hyperparameters map onto the config document.
//! [`export_model`] drives any exporter through the shared writer, so adding an
//! architecture never touches the stream or archive code.

pub mod llama;
pub mod rope;

use std::io::Write;

use candle_core::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{ConfigDocument, ConfigSection};
use crate::context::Context;
use crate::error::{ExportError, Result};
use crate::quant::{QuantMode, QuantizedTensor, quantize};
use crate::writer::{TensorWriter, WriteSummary};

/// Where the bytes of one record come from.
#[derive(Debug, Clone)]
pub enum TensorSource {
    Tensor(Tensor),
    /// Concatenation along dim 0, materialized only when the record is encoded.
    Concat(Vec<Tensor>),
}

impl TensorSource {
    /// Check that the parts of a concatenation agree on rank, trailing
    /// dimensions and element type.
    pub fn validate(&self, name: &str) -> Result<()> {
        let Self::Concat(parts) = self else {
            return Ok(());
        };
        let Some(first) = parts.first() else {
            return Err(ExportError::StructuralMismatch(format!(
                "'{name}': nothing to concatenate"
            )));
        };
        if first.rank() == 0 {
            return Err(ExportError::StructuralMismatch(format!(
                "'{name}': cannot concatenate scalars"
            )));
        }

        for (i, part) in parts.iter().enumerate().skip(1) {
            if part.rank() != first.rank() || part.dims()[1..] != first.dims()[1..] {
                return Err(ExportError::StructuralMismatch(format!(
                    "'{name}': part {i} has shape {:?}, expected [_, {:?}]",
                    part.dims(),
                    &first.dims()[1..]
                )));
            }
            if part.dtype() != first.dtype() {
                return Err(ExportError::StructuralMismatch(format!(
                    "'{name}': part {i} is {:?}, expected {:?}",
                    part.dtype(),
                    first.dtype()
                )));
            }
        }
        Ok(())
    }

    /// Produce the tensor to encode.
    pub fn materialize(&self, name: &str) -> Result<Tensor> {
        match self {
            Self::Tensor(tensor) => Ok(tensor.clone()),
            Self::Concat(parts) => {
                self.validate(name)?;
                Ok(Tensor::cat(parts.as_slice(), 0)?)
            }
        }
    }

    /// Shape of the materialized tensor.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Tensor(tensor) => tensor.dims().to_vec(),
            Self::Concat(parts) => {
                let mut dims = parts.first().map(|p| p.dims().to_vec()).unwrap_or_default();
                if let Some(rows) = dims.first_mut() {
                    *rows = parts.iter().map(|p| p.dims().first().copied().unwrap_or(0)).sum();
                }
                dims
            }
        }
    }
}

/// One record to write: its naming context and its data.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub ctx: Context,
    pub source: TensorSource,
}

impl TensorEntry {
    pub fn tensor(ctx: Context, tensor: Tensor) -> Self {
        Self {
            ctx,
            source: TensorSource::Tensor(tensor),
        }
    }

    /// Fused matrix built from `parts` stacked along dim 0.
    pub fn concat(ctx: Context, parts: Vec<Tensor>) -> Self {
        Self {
            ctx,
            source: TensorSource::Concat(parts),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }
}

/// Architecture-specific export capability.
pub trait ModelExporter {
    type Model;

    /// Architecture name. Used as the root context, the config section name and
    /// the `[model] type` value.
    fn architecture(&self) -> &'static str;

    /// Reject configurations the runtime cannot execute. Runs before any output.
    fn check_config(&self, model: &Self::Model) -> Result<()>;

    /// Every record of the model in canonical order, named under `ctx`.
    fn traverse(&self, model: &Self::Model, ctx: &Context) -> Result<Vec<TensorEntry>>;

    /// Hyperparameter section of the config document.
    fn generate_config(&self, model: &Self::Model) -> Result<ConfigSection>;
}

/// Result of a completed export.
#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub summary: WriteSummary,
    pub config: ConfigDocument,
}

/// Export `model` into `sink` and build its config document.
///
/// Tensors are quantized in parallel in bounded batches and appended in
/// traversal order, so the stream is identical to a sequential run.
/// `tensor_file` is the archive entry name recorded as `[model] model_file`.
pub fn export_model<E, W>(
    exporter: &E,
    model: &E::Model,
    quant: QuantMode,
    sink: W,
    tensor_file: &str,
) -> Result<(W, ExportOutput)>
where
    E: ModelExporter,
    W: Write,
{
    let architecture = exporter.architecture();
    exporter.check_config(model)?;
    let section = exporter.generate_config(model)?;

    let root = Context::new(architecture, quant);
    let entries = exporter.traverse(model, &root)?;
    for entry in &entries {
        entry.source.validate(entry.name())?;
        debug!(
            name = entry.name(),
            dims = ?entry.source.dims(),
            quant = %entry.ctx.quant(),
            "queued tensor"
        );
    }

    info!(architecture, tensors = entries.len(), %quant, "exporting model");

    let mut writer = TensorWriter::new(sink)?;
    let batch_size = rayon::current_num_threads().saturating_mul(2).max(4);
    let total = entries.len();

    for batch in entries.chunks(batch_size) {
        let encoded: Vec<Result<QuantizedTensor>> = batch
            .par_iter()
            .map(|entry| {
                let tensor = entry.source.materialize(entry.name())?;
                quantize(entry.name(), &tensor, entry.ctx.quant())
            })
            .collect();

        // Surface the first failure in traversal order
        for (entry, tensor) in batch.iter().zip(encoded) {
            writer.append(entry.name(), &tensor?)?;
        }
        info!(
            written = writer.len(),
            total,
            bytes = writer.bytes_written(),
            "tensor batch written"
        );
    }

    let (sink, summary) = writer.finish()?;

    let mut config = ConfigDocument::new();
    config.insert_section(section);
    config
        .section_mut("model")
        .set("type", architecture)
        .set("model_file", tensor_file);

    info!(
        architecture,
        tensors = summary.tensor_count,
        bytes = summary.bytes_written,
        "model export finished"
    );

    Ok((sink, ExportOutput { summary, config }))
}
