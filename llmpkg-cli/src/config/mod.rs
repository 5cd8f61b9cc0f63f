//! JSON configuration files accepted by the CLI.

pub mod export_config;
