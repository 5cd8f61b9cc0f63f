//! Append-only tensor stream writer.
//!
//! Writes records in the order they are received and keeps a name index that
//! [`TensorWriter::finish`] appends as the trailing table of contents. A writer
//! dropped without `finish` leaves a stream with no footer, which readers reject.

use std::collections::HashSet;
use std::io::{self, Write};

use candle_core::Tensor;
use tracing::debug;

use crate::context::Context;
use crate::error::{ExportError, Result};
use crate::formats::{
    FOOTER_MAGIC, INDEX_MAGIC, RecordHeader, STREAM_MAGIC, STREAM_VERSION, validate_name, write_name,
};
use crate::quant::{QuantizedTensor, quantize};

/// Location of one record in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    /// Absolute offset of the record from the start of the stream.
    pub offset: u64,
    /// Length of the complete record in bytes.
    pub length: u64,
}

/// Result of a finished writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub tensor_count: usize,
    pub bytes_written: u64,
}

/// Tracks how many bytes went through so offsets never need `Seek`.
struct CountingWriter<W> {
    inner: W,
    position: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Single-session writer owning the output stream.
pub struct TensorWriter<W: Write> {
    sink: CountingWriter<W>,
    index: Vec<IndexEntry>,
    names: HashSet<String>,
}

impl<W: Write> TensorWriter<W> {
    /// Open a session and write the stream header.
    pub fn new(sink: W) -> Result<Self> {
        let mut sink = CountingWriter { inner: sink, position: 0 };
        sink.write_all(&STREAM_MAGIC)?;
        sink.write_all(&STREAM_VERSION.to_le_bytes())?;

        Ok(Self {
            sink,
            index: Vec::new(),
            names: HashSet::new(),
        })
    }

    /// Quantize `tensor` as requested by `ctx` and append it under `ctx.name()`.
    pub fn write(&mut self, ctx: &Context, tensor: &Tensor) -> Result<()> {
        self.check_name(ctx.name())?;
        let quantized = quantize(ctx.name(), tensor, ctx.quant())?;
        self.append(ctx.name(), &quantized)
    }

    /// Append an already quantized tensor.
    pub fn append(&mut self, name: &str, tensor: &QuantizedTensor) -> Result<()> {
        self.check_name(name)?;

        let offset = self.sink.position;
        let header = RecordHeader {
            name: name.to_string(),
            quant: tensor.mode,
            element_type: tensor.element_type,
            shape: tensor.shape.clone(),
            payload_len: tensor.payload.len() as u64,
        };
        header.write_to(&mut self.sink)?;
        self.sink.write_all(&tensor.payload)?;
        self.sink
            .write_all(&(tensor.metadata.len() as u64).to_le_bytes())?;
        self.sink.write_all(&tensor.metadata)?;

        let length = self.sink.position - offset;
        debug!(
            name,
            offset,
            length,
            quant = %tensor.mode,
            shape = ?tensor.shape,
            "appended tensor record"
        );

        self.names.insert(name.to_string());
        self.index.push(IndexEntry {
            name: name.to_string(),
            offset,
            length,
        });
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.contains(name) {
            return Err(ExportError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Records written so far, in write order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.sink.position
    }

    /// Write the index and footer, flush, and hand back the sink.
    pub fn finish(mut self) -> Result<(W, WriteSummary)> {
        let index_offset = self.sink.position;

        self.sink.write_all(&INDEX_MAGIC)?;
        self.sink.write_all(&(self.index.len() as u32).to_le_bytes())?;
        for entry in &self.index {
            write_name(&mut self.sink, &entry.name)?;
            self.sink.write_all(&entry.offset.to_le_bytes())?;
            self.sink.write_all(&entry.length.to_le_bytes())?;
        }

        self.sink.write_all(&index_offset.to_le_bytes())?;
        self.sink.write_all(&FOOTER_MAGIC)?;
        self.sink.flush()?;

        let summary = WriteSummary {
            tensor_count: self.index.len(),
            bytes_written: self.sink.position,
        };
        debug!(
            tensors = summary.tensor_count,
            bytes = summary.bytes_written,
            "tensor stream finished"
        );

        Ok((self.sink.inner, summary))
    }
}
