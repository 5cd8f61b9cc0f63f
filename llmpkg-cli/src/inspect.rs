//! Print the contents of an `.llmpkg` package.

use anyhow::{Context, Result};
use llmpkg_storage::PackageArchive;

/// Summary statistics of a decoded tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub min: f32,
    pub max: f32,
    pub mean: f64,
    pub rms: f64,
}

impl TensorStats {
    pub fn compute(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
        }

        let n = values.len() as f64;
        Some(Self {
            min,
            max,
            mean: sum / n,
            rms: (sum_sq / n).sqrt(),
        })
    }
}

fn format_shape(shape: &[usize]) -> String {
    shape
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join("x")
}

pub fn run(package_path: &str, tensor: Option<&str>) -> Result<()> {
    let mut package = PackageArchive::open(package_path)
        .with_context(|| format!("Failed to open package: {}", package_path))?;

    if let Some(name) = tensor {
        let record = package.tensors.read(name)?;
        let values = record.to_f32()?;
        println!(
            "{} [{}] quant={} type={} payload={} bytes metadata={} bytes",
            record.name,
            format_shape(&record.shape),
            record.quant,
            record.element_type,
            record.payload.len(),
            record.metadata.len()
        );
        if let Some(stats) = TensorStats::compute(&values) {
            println!(
                "  min={:.6} max={:.6} mean={:.6} rms={:.6}",
                stats.min, stats.max, stats.mean, stats.rms
            );
        }
        return Ok(());
    }

    println!("Entries:");
    for entry in &package.entries {
        println!("  {}", entry);
    }

    println!("\nConfig:\n{}", package.config);

    println!("Tensors ({}):", package.tensors.len());
    let names: Vec<String> = package.tensors.names().map(String::from).collect();
    for name in names {
        let record = package.tensors.read(&name)?;
        println!(
            "  {} [{}] {} {} {} bytes",
            record.name,
            format_shape(&record.shape),
            record.quant,
            record.element_type,
            record.payload.len() + record.metadata.len()
        );
    }

    Ok(())
}
