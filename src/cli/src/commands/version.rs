//! `stemcell-director version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("stemcell-director version {}", stemcell_core::VERSION);
    println!("runtime version {}", stemcell_runtime::VERSION);
    Ok(())
}
