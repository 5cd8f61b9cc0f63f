//! `.llmpkg` archive assembly.
//!
//! A package is a ZIP archive with four stored (uncompressed) ZIP64 entries:
//! the tensor stream, its INI config and the two tokenizer files. The archive is
//! built in a temporary file next to the destination and only moved into place
//! once it is complete, so a failed export never leaves a package behind.

use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::{ConfigDocument, validate_entry};
use crate::error::{ExportError, Result};
use crate::exporter::{ModelExporter, export_model};
use crate::quant::QuantMode;
use crate::reader::TensorStreamReader;

/// Tensor stream entry name
pub const MODEL_BIN: &str = "model.bin";

/// Model config entry name
pub const MODEL_INI: &str = "model.ini";

/// Tokenizer binary entry name
pub const TOKENIZER_BIN: &str = "tokenizer.bin";

/// Tokenizer config entry name
pub const TOKENIZER_INI: &str = "tokenizer.ini";

/// Tokenizer files produced by the tokenizer exporter, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerArtifacts {
    pub model: Vec<u8>,
    pub config: Vec<u8>,
}

impl TokenizerArtifacts {
    pub fn new(model: impl Into<Vec<u8>>, config: impl Into<Vec<u8>>) -> Self {
        Self {
            model: model.into(),
            config: config.into(),
        }
    }
}

/// Result of a successful [`Packager::build`].
#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub path: PathBuf,
    pub tensor_count: usize,
    pub tensor_bytes: u64,
    pub archive_bytes: u64,
    pub config: ConfigDocument,
}

/// Builds one package at a destination path.
#[derive(Debug, Clone)]
pub struct Packager {
    dest: PathBuf,
    tokenizer: TokenizerArtifacts,
    overrides: Vec<(String, String)>,
}

impl Packager {
    pub fn new(dest: impl Into<PathBuf>, tokenizer: TokenizerArtifacts) -> Self {
        Self {
            dest: dest.into(),
            tokenizer,
            overrides: Vec::new(),
        }
    }

    /// Override a key of the architecture section after it is generated.
    pub fn config_override(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.overrides.push((key.into(), value.to_string()));
        self
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Export `model` and write the complete archive, replacing any existing file.
    pub fn build<E: ModelExporter>(
        &self,
        exporter: &E,
        model: &E::Model,
        quant: QuantMode,
    ) -> Result<PackageSummary> {
        // Fail before touching the filesystem
        for (key, value) in &self.overrides {
            validate_entry(key, value)?;
        }
        exporter.check_config(model)?;

        let dir = match self.dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        debug!(path = %tmp.path().display(), "writing package to temporary file");

        let (tensor_count, tensor_bytes, config) = {
            let mut zip = ZipWriter::new(tmp.as_file_mut());
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .large_file(true);

            zip.start_file(MODEL_BIN, options)?;
            let (_, output) = export_model(exporter, model, quant, &mut zip, MODEL_BIN)?;

            let mut config = output.config;
            let section = config.section_mut(exporter.architecture());
            for (key, value) in &self.overrides {
                section.set(key.as_str(), value);
            }

            zip.start_file(MODEL_INI, options)?;
            zip.write_all(config.to_string().as_bytes())?;

            zip.start_file(TOKENIZER_BIN, options)?;
            zip.write_all(&self.tokenizer.model)?;

            zip.start_file(TOKENIZER_INI, options)?;
            zip.write_all(&self.tokenizer.config)?;

            zip.finish()?;
            (
                output.summary.tensor_count,
                output.summary.bytes_written,
                config,
            )
        };

        tmp.as_file().sync_all()?;
        let archive_bytes = tmp.as_file().metadata()?.len();
        tmp.persist(&self.dest).map_err(|e| e.error)?;

        info!(
            path = %self.dest.display(),
            tensors = tensor_count,
            bytes = archive_bytes,
            "package written"
        );

        Ok(PackageSummary {
            path: self.dest.clone(),
            tensor_count,
            tensor_bytes,
            archive_bytes,
            config,
        })
    }
}

/// A package opened for reading.
pub struct PackageArchive {
    pub config: ConfigDocument,
    pub tensors: TensorStreamReader<Cursor<Vec<u8>>>,
    pub tokenizer: TokenizerArtifacts,
    /// Entry names in archive order.
    pub entries: Vec<String>,
}

impl PackageArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Read every entry. The tensor stream is located through `[model] model_file`.
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let entries = archive.file_names().map(str::to_string).collect::<Vec<_>>();

        let config_text = String::from_utf8(read_entry(&mut archive, MODEL_INI)?)
            .map_err(|_| ExportError::InvalidStream(format!("{MODEL_INI} is not utf-8")))?;
        let config = ConfigDocument::parse(&config_text)?;

        let model_file = config.get("model", "model_file").unwrap_or(MODEL_BIN).to_string();
        let tensors = TensorStreamReader::new(Cursor::new(read_entry(&mut archive, &model_file)?))?;

        let tokenizer = TokenizerArtifacts::new(
            read_entry(&mut archive, TOKENIZER_BIN)?,
            read_entry(&mut archive, TOKENIZER_INI)?,
        );

        Ok(Self {
            config,
            tensors,
            tokenizer,
            entries,
        })
    }
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}
