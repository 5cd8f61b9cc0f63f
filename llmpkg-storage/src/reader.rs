//! Tensor stream reader - the consumer-side view of a written stream.
//!
//! Locates the index through the fixed-size footer, then reads records by name
//! without scanning the stream.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use candle_core::{Device, Tensor};

use crate::error::{ExportError, Result};
use crate::formats::{
    ElementType, FOOTER_MAGIC, FOOTER_SIZE, HEADER_SIZE, INDEX_MAGIC, RecordHeader, STREAM_MAGIC,
    STREAM_VERSION, expect_magic, read_name, read_u16, read_u32, read_u64,
};
use crate::quant::{QuantMode, dequantize};
use crate::writer::IndexEntry;

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub name: String,
    pub quant: QuantMode,
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl TensorRecord {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Dequantize (Q4) or widen (native floats) to f32.
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        dequantize(
            &self.name,
            self.quant,
            self.element_type,
            &self.shape,
            &self.payload,
            &self.metadata,
        )
    }

    /// Decoded values as an f32 CPU tensor.
    pub fn to_tensor(&self) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.to_f32()?, self.shape.as_slice(), &Device::Cpu)?)
    }
}

pub struct TensorStreamReader<R> {
    reader: R,
    index: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
}

impl<R: Read + Seek> TensorStreamReader<R> {
    /// Validate header and footer and load the index.
    pub fn new(mut reader: R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        expect_magic(&mut reader, &STREAM_MAGIC, "stream")?;
        let version = read_u16(&mut reader)?;
        if version != STREAM_VERSION {
            return Err(ExportError::InvalidStream(format!(
                "unsupported stream version {version} (expected {STREAM_VERSION})"
            )));
        }

        let end = reader.seek(SeekFrom::End(0))?;
        if end < HEADER_SIZE + FOOTER_SIZE {
            return Err(ExportError::InvalidStream(
                "stream is truncated (no footer)".to_string(),
            ));
        }

        reader.seek(SeekFrom::Start(end - FOOTER_SIZE))?;
        let index_offset = read_u64(&mut reader)?;
        expect_magic(&mut reader, &FOOTER_MAGIC, "footer")?;
        if index_offset < HEADER_SIZE || index_offset > end - FOOTER_SIZE {
            return Err(ExportError::InvalidStream(format!(
                "index offset {index_offset} outside stream of {end} bytes"
            )));
        }

        reader.seek(SeekFrom::Start(index_offset))?;
        expect_magic(&mut reader, &INDEX_MAGIC, "index")?;
        let count = read_u32(&mut reader)? as usize;

        let mut index = Vec::with_capacity(count.min(1 << 16));
        let mut by_name = HashMap::with_capacity(count.min(1 << 16));
        for position in 0..count {
            let name = read_name(&mut reader)?;
            let offset = read_u64(&mut reader)?;
            let length = read_u64(&mut reader)?;

            if offset < HEADER_SIZE || offset.saturating_add(length) > index_offset {
                return Err(ExportError::InvalidStream(format!(
                    "record '{name}' at {offset}+{length} overlaps the index"
                )));
            }
            if by_name.insert(name.clone(), position).is_some() {
                return Err(ExportError::InvalidStream(format!(
                    "index lists '{name}' twice"
                )));
            }
            index.push(IndexEntry {
                name,
                offset,
                length,
            });
        }

        Ok(Self {
            reader,
            index,
            by_name,
        })
    }

    /// Index entries in write order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.iter().map(|e| e.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Read a record by name.
    pub fn read(&mut self, name: &str) -> Result<TensorRecord> {
        let position = *self
            .by_name
            .get(name)
            .ok_or_else(|| ExportError::InvalidStream(format!("no tensor named '{name}'")))?;
        let entry = self.index[position].clone();
        self.read_entry(&entry)
    }

    /// Read every record in write order.
    pub fn records(&mut self) -> Result<Vec<TensorRecord>> {
        let entries = self.index.clone();
        entries.iter().map(|e| self.read_entry(e)).collect()
    }

    fn read_entry(&mut self, entry: &IndexEntry) -> Result<TensorRecord> {
        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let header = RecordHeader::read_from(&mut self.reader)?;
        if header.name != entry.name {
            return Err(ExportError::InvalidStream(format!(
                "index entry '{}' points at record '{}'",
                entry.name, header.name
            )));
        }
        if header.payload_len != header.expected_payload_len() {
            return Err(ExportError::InvalidStream(format!(
                "'{}' payload of {} bytes does not match shape {:?} ({} {})",
                entry.name,
                header.payload_len,
                header.shape,
                header.quant,
                header.element_type
            )));
        }
        if header.payload_len > entry.length {
            return Err(ExportError::InvalidStream(format!(
                "'{}' payload of {} bytes exceeds its record length {}",
                entry.name, header.payload_len, entry.length
            )));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.reader.read_exact(&mut payload)?;

        let meta_len = read_u64(&mut self.reader)?;
        if meta_len > entry.length {
            return Err(ExportError::InvalidStream(format!(
                "'{}' metadata of {meta_len} bytes exceeds its record length",
                entry.name
            )));
        }
        let mut metadata = vec![0u8; meta_len as usize];
        self.reader.read_exact(&mut metadata)?;

        let consumed = self.reader.stream_position()? - entry.offset;
        if consumed != entry.length {
            return Err(ExportError::InvalidStream(format!(
                "'{}' spans {consumed} bytes, index says {}",
                entry.name, entry.length
            )));
        }

        let RecordHeader {
            name,
            quant,
            element_type,
            shape,
            ..
        } = header;

        Ok(TensorRecord {
            name,
            quant,
            element_type,
            shape,
            payload,
            metadata,
        })
    }
}
