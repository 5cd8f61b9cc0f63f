//! llmpkg storage - quantized tensor streams and archive packaging.
//!
//! Converts an in-memory model into a `.llmpkg` archive for the inference runtime.
//!
//! # Pipeline
//! - [`Context`]: immutable name/quantization accumulator threaded through traversal
//! - [`quant`]: NONE and Q4 (group size 32, f16 scale, 4-bit zero point) codecs
//! - [`TensorWriter`]: append-only record stream with a trailing name index
//! - [`ModelExporter`]: architecture capability trait ([`LlamaExporter`] for Llama)
//! - [`ConfigDocument`]: INI config describing hyperparameters and the tensor file
//! - [`Packager`]: bundles tensors, config and tokenizer into one stored ZIP64 archive
//!
//! # Usage
//! ```ignore
//! use llmpkg_storage::{LlamaExporter, Packager, QuantMode, TokenizerArtifacts};
//!
//! let tokenizer = TokenizerArtifacts::new(model_bytes, config_bytes);
//! let summary = Packager::new("llama.llmpkg", tokenizer)
//!     .build(&LlamaExporter, &model, QuantMode::Q4)?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod formats;
pub mod package;
pub mod quant;
pub mod reader;
pub mod writer;

// Re-exports
pub use config::{ConfigDocument, ConfigSection, validate_entry};
pub use context::Context;
pub use error::{ExportError, Result};
pub use exporter::llama::{
    LlamaAttention, LlamaBlock, LlamaConfig, LlamaExporter, LlamaMlp, LlamaModel, RmsNorm,
    TokenId,
};
pub use exporter::rope::{RopeScaling, RotaryEmbedding};
pub use exporter::{ExportOutput, ModelExporter, TensorEntry, TensorSource, export_model};
pub use formats::{ElementType, STREAM_MAGIC, STREAM_VERSION};
pub use package::{
    MODEL_BIN, MODEL_INI, PackageArchive, PackageSummary, Packager, TOKENIZER_BIN,
    TOKENIZER_INI, TokenizerArtifacts,
};
pub use quant::{QuantMode, QuantizedTensor, quantize};
pub use reader::{TensorRecord, TensorStreamReader};
pub use writer::{IndexEntry, TensorWriter, WriteSummary};
