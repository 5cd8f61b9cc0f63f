//! llmpkg CLI - Export HuggingFace Llama checkpoints to llmpkg packages.

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod common;
mod config;
mod export;
mod inspect;
mod loader;
mod tokens;

#[derive(Parser)]
#[command(name = "llmpkg")]
#[command(about = "CLI tool for exporting Llama models to llmpkg packages")]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a HuggingFace Llama checkpoint to an llmpkg package
    Export {
        /// Path to the checkpoint folder (config.json + .safetensors)
        #[arg(short, long)]
        model: String,

        /// Path to export config JSON (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Quantization for weight matrices: q4 or none
        #[arg(short, long)]
        quant: Option<String>,

        /// Output package path
        #[arg(short, long)]
        output: Option<String>,

        /// Llama generation (2 or 3)
        #[arg(long)]
        llama_version: Option<u8>,

        /// Path to the exported tokenizer.bin
        #[arg(long)]
        tokenizer_model: Option<String>,

        /// Path to the exported tokenizer.ini
        #[arg(long)]
        tokenizer_config: Option<String>,

        /// Generate a template config instead of exporting
        #[arg(long)]
        generate_config: bool,
    },

    /// Print the entries, config and tensors of a package
    Inspect {
        /// Path to the .llmpkg file
        #[arg(short, long)]
        package: String,

        /// Decode one tensor and print its statistics
        #[arg(short, long)]
        tensor: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Export {
            model,
            config,
            quant,
            output,
            llama_version,
            tokenizer_model,
            tokenizer_config,
            generate_config,
        } => {
            if generate_config {
                export::generate_config_template(&model)?;
            } else {
                let args = export::ExportArgs {
                    config_path: config.as_deref(),
                    quant: quant.as_deref(),
                    output: output.as_deref(),
                    llama_version,
                    tokenizer_model: tokenizer_model.as_deref(),
                    tokenizer_config: tokenizer_config.as_deref(),
                };
                export::run(&model, &args)?;
            }
        }
        Commands::Inspect { package, tensor } => {
            inspect::run(&package, tensor.as_deref())?;
        }
    }

    Ok(())
}
