//! Command-line surface.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use mt_domain::config::Config;

#[derive(Parser)]
#[command(name = "meterd", version, about = "Multi-tenant usage-metering service")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP service (the default).
    Serve,
    /// Inspect the configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Load the config and report warnings/errors.
    Validate,
    /// Print the effective config as TOML.
    Show,
}

/// Resolve the config path (`--config`, then `METERD_CONFIG`, then
/// `./meterd.toml`) and load it. A missing file yields the built-in
/// defaults, so a bare `meterd` still starts.
pub fn load_config(cli_path: Option<&Path>) -> anyhow::Result<(Config, PathBuf)> {
    let path = cli_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("METERD_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("meterd.toml"));

    if !path.exists() {
        return Ok((Config::default(), path));
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config =
        Config::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok((config, path))
}
