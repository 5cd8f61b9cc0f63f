//! Common utilities shared between the export and inspect commands.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Discover safetensor files from a path (file or directory).
pub fn discover_safetensor_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        match path.extension().and_then(|s| s.to_str()) {
            Some("safetensors") => Ok(vec![path.to_path_buf()]),
            _ => anyhow::bail!("Expected .safetensors file, got: {}", path.display()),
        }
    } else if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)
            .with_context(|| format!("Failed to read directory: {}", path.display()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("safetensors"))
            .collect();

        if files.is_empty() {
            anyhow::bail!("No .safetensors files found in: {}", path.display());
        }
        files.sort_unstable();
        Ok(files)
    } else {
        anyhow::bail!("Path does not exist: {}", path.display())
    }
}

/// Read and parse a JSON file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load a JSON config file, falling back to defaults when no path is given.
pub fn load_config<T: DeserializeOwned + Default>(config_path: Option<&str>) -> Result<T> {
    match config_path {
        Some(path) => load_json(Path::new(path)),
        None => Ok(T::default()),
    }
}

/// Map a safetensors dtype to the candle dtype used in memory.
pub fn candle_dtype(dtype: safetensors::Dtype) -> Result<DType> {
    use safetensors::Dtype;

    match dtype {
        Dtype::F32 => Ok(DType::F32),
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        Dtype::F64 => Ok(DType::F64),
        Dtype::U8 => Ok(DType::U8),
        Dtype::U32 => Ok(DType::U32),
        Dtype::I64 => Ok(DType::I64),
        _ => anyhow::bail!("Unsupported dtype: {:?}", dtype),
    }
}

/// Copy a safetensors view into a CPU tensor, keeping its dtype.
pub fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>) -> Result<Tensor> {
    let dtype = candle_dtype(view.dtype())?;
    let expected = view.shape().iter().product::<usize>() * dtype.size_in_bytes();
    if view.data().len() != expected {
        anyhow::bail!(
            "{:?} size mismatch: expected {} bytes, got {}",
            view.dtype(),
            expected,
            view.data().len()
        );
    }
    Ok(Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?)
}
