//! `stemcell-director stemcells` command.

use clap::Args;
use serde::Serialize;
use stemcell_core::{CatalogEntry, DirectorConfig};
use stemcell_runtime::{CatalogStore, FileCatalog};

use crate::output;

#[derive(Args)]
pub struct StemcellsArgs {
    /// Only show stemcells with this name
    #[arg(long)]
    pub name: Option<String>,

    /// Print the catalog as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: StemcellsArgs,
    config: &DirectorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = FileCatalog::open(&config.store_dir).await?;
    let entries: Vec<CatalogEntry> = catalog
        .list()
        .await?
        .into_iter()
        .filter(|e| args.name.as_deref().map_or(true, |name| e.name == name))
        .collect();

    let rows: Vec<StemcellRow> = entries.iter().map(StemcellRow::from_entry).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table =
        output::new_table(&["NAME", "VERSION", "OS", "CPI", "CID", "DIGEST", "CREATED"]);
    for row in &rows {
        table.add_row(&[
            &row.name,
            &row.version,
            &output::or_dash(row.operating_system.as_deref()),
            &output::or_dash(Some(&row.cpi)),
            &row.cid,
            &row.digest,
            &row.created,
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Display fields for one catalog entry.
#[derive(Serialize)]
struct StemcellRow {
    name: String,
    version: String,
    operating_system: Option<String>,
    cpi: String,
    cid: String,
    digest: String,
    api_version: Option<u32>,
    created: String,
}

impl StemcellRow {
    fn from_entry(entry: &CatalogEntry) -> Self {
        Self {
            name: entry.name.clone(),
            version: entry.version.clone(),
            operating_system: entry.operating_system.clone(),
            cpi: entry.cpi.clone(),
            cid: entry.cid.clone(),
            digest: entry.digest.clone(),
            api_version: entry.api_version,
            created: output::format_ago(&entry.created_at),
        }
    }
}
