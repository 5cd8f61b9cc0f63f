//! Q4 group quantization.
//!
//! Elements are taken in row-major order in groups of [`GROUP_SIZE`] along the
//! innermost dimension. Each group stores:
//! - 16 bytes of packed nibbles (element `2j` low, `2j+1` high)
//! - one f16 scale
//! - one 4-bit zero point (even group low nibble, odd group high nibble)
//!
//! Decoding is `x = (q - zero) * scale`. The encoded range always includes zero,
//! so the zero point fits in `0..=15`.

use half::f16;

use crate::error::{ExportError, Result};

/// Elements per quantization group. Fixed by the consumer runtime.
pub const GROUP_SIZE: usize = 32;

/// Largest 4-bit code
const Q_MAX: f32 = 15.0;

/// Q4 encoded data for one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Q4Data {
    pub packed: Vec<u8>,
    pub scales: Vec<f16>,
    pub zeros: Vec<u8>,
}

impl Q4Data {
    pub fn num_groups(&self) -> usize {
        self.scales.len()
    }

    pub fn zero_point(&self, group: usize) -> u8 {
        let byte = self.zeros[group / 2];
        if group.is_multiple_of(2) {
            byte & 0x0F
        } else {
            byte >> 4
        }
    }

    /// Record metadata: scales (f16 little-endian) followed by packed zero points.
    pub fn metadata_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.scales.len() * 2 + self.zeros.len());
        for scale in &self.scales {
            out.extend_from_slice(&scale.to_le_bytes());
        }
        out.extend_from_slice(&self.zeros);
        out
    }

    /// Rebuild from a record's payload and metadata, validating all lengths.
    pub fn from_parts(name: &str, numel: usize, payload: &[u8], metadata: &[u8]) -> Result<Self> {
        if !numel.is_multiple_of(GROUP_SIZE) {
            return Err(ExportError::InvalidStream(format!(
                "'{name}': {numel} elements is not a whole number of Q4 groups"
            )));
        }
        let num_groups = numel / GROUP_SIZE;
        let scales_len = num_groups * 2;
        let zeros_len = num_groups.div_ceil(2);

        if payload.len() != numel / 2 || metadata.len() != scales_len + zeros_len {
            return Err(ExportError::InvalidStream(format!(
                "'{name}': Q4 sizes do not match {numel} elements (payload {}, metadata {})",
                payload.len(),
                metadata.len()
            )));
        }

        let scales = metadata[..scales_len]
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect();

        Ok(Self {
            packed: payload.to_vec(),
            scales,
            zeros: metadata[scales_len..].to_vec(),
        })
    }

    /// Dequantize to f32 in row-major order.
    pub fn decode(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.packed.len() * 2);
        for (group, bytes) in self.packed.chunks_exact(GROUP_SIZE / 2).enumerate() {
            let scale = self.scales[group].to_f32();
            let zero = self.zero_point(group) as f32;
            for &b in bytes {
                out.push(((b & 0x0F) as f32 - zero) * scale);
                out.push(((b >> 4) as f32 - zero) * scale);
            }
        }
        out
    }
}

/// Quantize row-major `values` of the given `shape`.
///
/// # Errors
/// - `Shape` if the tensor is a scalar or its innermost dimension is not a
///   multiple of [`GROUP_SIZE`]
/// - `NonFiniteValue` on NaN/infinite input or a group range that overflows f16
pub fn encode(name: &str, values: &[f32], shape: &[usize]) -> Result<Q4Data> {
    let Some(&inner) = shape.last() else {
        return Err(ExportError::shape(name, "scalar tensors cannot be Q4 quantized"));
    };
    if !inner.is_multiple_of(GROUP_SIZE) {
        return Err(ExportError::shape(
            name,
            format!("innermost dimension {inner} is not a multiple of the Q4 group size {GROUP_SIZE}"),
        ));
    }
    debug_assert_eq!(values.len(), shape.iter().product::<usize>());

    let num_groups = values.len() / GROUP_SIZE;
    let mut packed = vec![0u8; values.len() / 2];
    let mut scales = Vec::with_capacity(num_groups);
    let mut zeros = vec![0u8; num_groups.div_ceil(2)];

    let groups = values
        .chunks_exact(GROUP_SIZE)
        .zip(packed.chunks_exact_mut(GROUP_SIZE / 2));
    for (group, (input, out)) in groups.enumerate() {
        let (scale, zero) =
            encode_group(input, out).ok_or_else(|| ExportError::NonFiniteValue(name.to_string()))?;
        scales.push(scale);
        if group.is_multiple_of(2) {
            zeros[group / 2] |= zero;
        } else {
            zeros[group / 2] |= zero << 4;
        }
    }

    Ok(Q4Data {
        packed,
        scales,
        zeros,
    })
}

/// Encode one group into `out` (GROUP_SIZE / 2 bytes). Returns `None` on
/// non-finite input or scale overflow.
fn encode_group(group: &[f32], out: &mut [u8]) -> Option<(f16, u8)> {
    let mut lo = 0.0f32;
    let mut hi = 0.0f32;
    for &x in group {
        if !x.is_finite() {
            return None;
        }
        lo = lo.min(x);
        hi = hi.max(x);
    }

    let scale = f16::from_f32((hi - lo) / Q_MAX);
    if !scale.is_finite() {
        return None;
    }

    let s = scale.to_f32();
    if s == 0.0 {
        out.fill(0);
        return Some((f16::ZERO, 0));
    }

    let zero = (-lo / s).round_ties_even().clamp(0.0, Q_MAX) as u8;
    for (pair, byte) in group.chunks_exact(2).zip(out.iter_mut()) {
        let q0 = quantize_value(pair[0], s, zero);
        let q1 = quantize_value(pair[1], s, zero);
        *byte = q0 | (q1 << 4);
    }

    Some((scale, zero))
}

#[inline(always)]
fn quantize_value(x: f32, scale: f32, zero: u8) -> u8 {
    ((x / scale).round_ties_even() + zero as f32).clamp(0.0, Q_MAX) as u8
}
