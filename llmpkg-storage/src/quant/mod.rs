//! Quantization codecs for tensor records.
//!
//! - `None`: native little-endian bytes, no metadata
//! - `Q4`: 4-bit asymmetric groups of 32 elements, see [`q4`]
//!
//! Quantization is pure: identical input bytes always produce identical output,
//! so it is safe to run on several tensors concurrently.

pub mod q4;

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::formats::ElementType;

/// Quantization applied to a tensor before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    /// Stored as-is. Required for norms and the rotary cache.
    None,
    /// 4-bit groups of [`q4::GROUP_SIZE`] with an f16 scale and a 4-bit zero point.
    #[default]
    Q4,
}

impl QuantMode {
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Q4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Q4),
            _ => None,
        }
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Q4 => f.write_str("q4"),
        }
    }
}

impl FromStr for QuantMode {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "q4" => Ok(Self::Q4),
            _ => Err(ExportError::UnknownQuantMode(s.to_string())),
        }
    }
}

/// Encoded tensor ready to be appended as a record.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub mode: QuantMode,
    /// Element type of the source tensor.
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub payload: Vec<u8>,
    /// Per-group scales and zero points for Q4, empty for None.
    pub metadata: Vec<u8>,
}

/// Encode `tensor` with `mode`. `name` is only used for error reporting.
pub fn quantize(name: &str, tensor: &Tensor, mode: QuantMode) -> Result<QuantizedTensor> {
    let element_type = ElementType::from_dtype(tensor.dtype()).ok_or_else(|| {
        ExportError::UnsupportedElementType {
            name: name.to_string(),
            dtype: format!("{:?}", tensor.dtype()),
        }
    })?;
    let shape = tensor.dims().to_vec();

    match mode {
        QuantMode::None => Ok(QuantizedTensor {
            mode,
            element_type,
            shape,
            payload: native_bytes(tensor, element_type)?,
            metadata: Vec::new(),
        }),
        QuantMode::Q4 => {
            if !element_type.is_float() {
                return Err(ExportError::UnsupportedQuantMode {
                    name: name.to_string(),
                    mode,
                    element_type,
                });
            }
            let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            let data = q4::encode(name, &values, &shape)?;
            Ok(QuantizedTensor {
                mode,
                element_type,
                shape,
                metadata: data.metadata_bytes(),
                payload: data.packed,
            })
        }
    }
}

/// Decode a record payload to f32 values in row-major order.
///
/// Integer element types are rejected: they have no meaningful f32 view.
pub fn dequantize(
    name: &str,
    mode: QuantMode,
    element_type: ElementType,
    shape: &[usize],
    payload: &[u8],
    metadata: &[u8],
) -> Result<Vec<f32>> {
    let numel: usize = shape.iter().product();
    match mode {
        QuantMode::Q4 => Ok(q4::Q4Data::from_parts(name, numel, payload, metadata)?.decode()),
        QuantMode::None => {
            let expected = numel * element_type.size_in_bytes();
            if payload.len() != expected {
                return Err(ExportError::InvalidStream(format!(
                    "'{name}': payload is {} bytes, shape {shape:?} needs {expected}",
                    payload.len()
                )));
            }
            match element_type {
                ElementType::F32 => Ok(payload
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()),
                ElementType::F16 => Ok(payload
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect()),
                ElementType::BF16 => Ok(payload
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect()),
                ElementType::F64 => Ok(payload
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b) as f32
                    })
                    .collect()),
                other => Err(ExportError::UnsupportedElementType {
                    name: name.to_string(),
                    dtype: other.to_string(),
                }),
            }
        }
    }
}

/// Native little-endian bytes of a tensor in row-major order.
fn native_bytes(tensor: &Tensor, element_type: ElementType) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match element_type {
        ElementType::F32 => le_bytes(flat.to_vec1::<f32>()?, f32::to_le_bytes),
        ElementType::F16 => le_bytes(flat.to_vec1::<f16>()?, f16::to_le_bytes),
        ElementType::BF16 => le_bytes(flat.to_vec1::<bf16>()?, bf16::to_le_bytes),
        ElementType::F64 => le_bytes(flat.to_vec1::<f64>()?, f64::to_le_bytes),
        ElementType::U8 => flat.to_vec1::<u8>()?,
        ElementType::U32 => le_bytes(flat.to_vec1::<u32>()?, u32::to_le_bytes),
        ElementType::I64 => le_bytes(flat.to_vec1::<i64>()?, i64::to_le_bytes),
    };
    Ok(bytes)
}

#[inline]
fn le_bytes<T, const N: usize>(values: Vec<T>, to_bytes: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(to_bytes).collect()
}

#[cfg(test)]
mod tests;
