//! Error taxonomy for the export pipeline.
//!
//! Every variant is fatal for the current export: there is no retry or
//! partial-success path.

use crate::formats::ElementType;
use crate::quant::QuantMode;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Block-size or dimension mismatch during quantization.
    #[error("shape error for '{name}': {reason}")]
    Shape { name: String, reason: String },

    #[error("cannot quantize '{name}' ({element_type}) as {mode}")]
    UnsupportedQuantMode {
        name: String,
        mode: QuantMode,
        element_type: ElementType,
    },

    #[error("unknown quantization mode '{0}' (expected 'none' or 'q4')")]
    UnknownQuantMode(String),

    #[error("unsupported element type {dtype} for tensor '{name}'")]
    UnsupportedElementType { name: String, dtype: String },

    #[error("tensor '{0}' contains values that cannot be quantized (NaN, infinity or f16 overflow)")]
    NonFiniteValue(String),

    /// A name was written twice in one session. Signals an exporter bug.
    #[error("duplicate tensor name: {0}")]
    DuplicateName(String),

    #[error("invalid tensor name '{0}'")]
    InvalidName(String),

    /// The host model does not have the shape the exporter expects.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("invalid tensor stream: {0}")]
    InvalidStream(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, ExportError>;

impl ExportError {
    pub(crate) fn shape(name: &str, reason: impl Into<String>) -> Self {
        Self::Shape {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
