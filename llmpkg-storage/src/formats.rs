//! Binary format specification for the llmpkg tensor stream.
//!
//! All integers are little-endian.
//!
//! ```text
//! header : magic "LPKT" | version u16
//! record : magic "tnsr" | name_len u16 | name (utf-8) | quant u8 | element u8 | rank u8
//!          | dims u64 x rank | payload_len u64 | payload | meta_len u64 | metadata
//! index  : magic "tidx" | count u32 | { name_len u16 | name | offset u64 | length u64 } x count
//! footer : index_offset u64 | magic "LPKE"
//! ```
//!
//! Record offsets in the index are absolute from the start of the stream and
//! `length` spans the complete record. The footer has a fixed size so a consumer
//! can locate the index without scanning records.

use std::fmt;
use std::io::{Read, Write};

use candle_core::DType;

use crate::error::{ExportError, Result};
use crate::quant::QuantMode;

/// Tensor stream magic bytes
pub const STREAM_MAGIC: [u8; 4] = *b"LPKT";

/// Tensor stream format version
pub const STREAM_VERSION: u16 = 1;

/// Record magic bytes
pub const RECORD_MAGIC: [u8; 4] = *b"tnsr";

/// Index magic bytes
pub const INDEX_MAGIC: [u8; 4] = *b"tidx";

/// Footer magic bytes, last four bytes of a finished stream
pub const FOOTER_MAGIC: [u8; 4] = *b"LPKE";

/// Stream header size in bytes
pub const HEADER_SIZE: u64 = 6;

/// Footer size in bytes (index offset + magic)
pub const FOOTER_SIZE: u64 = 12;

/// Element type of a record payload before quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    F32 = 0,
    F16 = 1,
    BF16 = 2,
    F64 = 3,
    U8 = 4,
    U32 = 5,
    I64 = 6,
}

impl ElementType {
    /// Map a candle dtype to its on-disk tag, if it has one.
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Self::F32),
            DType::F16 => Some(Self::F16),
            DType::BF16 => Some(Self::BF16),
            DType::F64 => Some(Self::F64),
            DType::U8 => Some(Self::U8),
            DType::U32 => Some(Self::U32),
            DType::I64 => Some(Self::I64),
            _ => None,
        }
    }

    pub fn to_dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F64 => DType::F64,
            Self::U8 => DType::U8,
            Self::U32 => DType::U32,
            Self::I64 => DType::I64,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::BF16),
            3 => Some(Self::F64),
            4 => Some(Self::U8),
            5 => Some(Self::U32),
            6 => Some(Self::I64),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::U32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16 | Self::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F64 => "f64",
            Self::U8 => "u8",
            Self::U32 => "u32",
            Self::I64 => "i64",
        };
        f.write_str(s)
    }
}

/// Fixed part of a record preceding the payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub name: String,
    pub quant: QuantMode,
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub payload_len: u64,
}

impl RecordHeader {
    /// Write header to writer
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let rank = u8::try_from(self.shape.len()).map_err(|_| {
            ExportError::shape(&self.name, format!("rank {} exceeds 255", self.shape.len()))
        })?;

        w.write_all(&RECORD_MAGIC)?;
        write_name(w, &self.name)?;
        w.write_all(&[self.quant.tag(), self.element_type.tag(), rank])?;
        for &dim in &self.shape {
            w.write_all(&(dim as u64).to_le_bytes())?;
        }
        w.write_all(&self.payload_len.to_le_bytes())?;
        Ok(())
    }

    /// Read header from reader
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        expect_magic(r, &RECORD_MAGIC, "record")?;
        let name = read_name(r)?;

        let quant_tag = read_u8(r)?;
        let quant = QuantMode::from_tag(quant_tag).ok_or_else(|| {
            ExportError::InvalidStream(format!("unknown quant tag {quant_tag} in '{name}'"))
        })?;

        let element_tag = read_u8(r)?;
        let element_type = ElementType::from_tag(element_tag).ok_or_else(|| {
            ExportError::InvalidStream(format!("unknown element tag {element_tag} in '{name}'"))
        })?;

        let rank = read_u8(r)? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            shape.push(read_u64(r)? as usize);
        }

        let payload_len = read_u64(r)?;

        Ok(Self {
            name,
            quant,
            element_type,
            shape,
            payload_len,
        })
    }

    /// Number of elements described by the shape, saturating on overflow
    pub fn numel(&self) -> usize {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .unwrap_or(usize::MAX)
    }

    /// Payload size implied by the shape, element type and quant mode.
    pub fn expected_payload_len(&self) -> u64 {
        let numel = self.numel();
        let bytes = match self.quant {
            QuantMode::None => numel.saturating_mul(self.element_type.size_in_bytes()),
            QuantMode::Q4 => numel / 2,
        };
        bytes as u64
    }
}

/// Validate a record name: non-empty and short enough for a u16 length prefix.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > u16::MAX as usize {
        return Err(ExportError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn write_name<W: Write>(w: &mut W, name: &str) -> Result<()> {
    validate_name(name)?;
    w.write_all(&(name.len() as u16).to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    Ok(())
}

pub(crate) fn read_name<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u16(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| ExportError::InvalidStream("tensor name is not valid utf-8".to_string()))
}

pub(crate) fn expect_magic<R: Read>(r: &mut R, magic: &[u8; 4], what: &str) -> Result<()> {
    let mut found = [0u8; 4];
    r.read_exact(&mut found)?;
    if &found != magic {
        return Err(ExportError::InvalidStream(format!(
            "invalid {what} magic: expected {magic:?}, got {found:?}"
        )));
    }
    Ok(())
}

pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}
