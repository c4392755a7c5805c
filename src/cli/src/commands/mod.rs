//! CLI command definitions and dispatch.

mod stemcells;
mod upload_stemcell;
mod version;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use stemcell_core::config::CONFIG_ENV_VAR;
use stemcell_core::DirectorConfig;

/// Stemcell director - upload stemcells to every configured CPI.
#[derive(Parser)]
#[command(name = "stemcell-director", version, about)]
pub struct Cli {
    /// Director config file (default: $STEMCELL_DIRECTOR_CONFIG or ~/.stemcell/director.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Upload a stemcell tarball or URL to all CPIs
    UploadStemcell(upload_stemcell::UploadStemcellArgs),
    /// List stemcells in the catalog
    Stemcells(stemcells::StemcellsArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load the director configuration.
///
/// A missing file at the default location yields the default configuration;
/// a missing file that was asked for explicitly is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<DirectorConfig, Box<dyn std::error::Error>> {
    let path = DirectorConfig::resolve_path(explicit);
    let requested = explicit.is_some() || std::env::var_os(CONFIG_ENV_VAR).is_some();
    if !requested && !path.exists() {
        return Ok(DirectorConfig::default());
    }
    Ok(DirectorConfig::load(&path)?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: DirectorConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::UploadStemcell(args) => upload_stemcell::execute(args, &config).await,
        Command::Stemcells(args) => stemcells::execute(args, &config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
