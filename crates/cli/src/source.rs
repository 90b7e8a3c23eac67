//! Where the books are read from.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;

use vikoba_accounting::JournalSnapshot;
use vikoba_core::GroupId;
use vikoba_infra::{JournalStore, LedgerConfig, PostgresJournalStore};

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// JSON snapshot of a group's books
    #[arg(long, global = true)]
    pub snapshot: Option<PathBuf>,

    /// Postgres connection string (used when no snapshot is given)
    #[arg(long, global = true, env = "VIKOBA_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Group whose books to read
    #[arg(short, long, global = true)]
    pub group: Option<GroupId>,
}

pub async fn load_snapshot(args: &SourceArgs, config: &LedgerConfig) -> Result<JournalSnapshot> {
    if let Some(path) = &args.snapshot {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot: JournalSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        if let Some(group) = args.group {
            if group != snapshot.group_id {
                bail!(
                    "snapshot {} belongs to group {}, not {group}",
                    path.display(),
                    snapshot.group_id
                );
            }
        }
        return Ok(snapshot);
    }

    let Some(url) = args.database_url.as_deref().or(config.database_url.as_deref()) else {
        bail!("either --snapshot or --database-url is required");
    };
    let Some(group) = args.group else {
        bail!("--group is required when reading from the database");
    };

    let store = PostgresJournalStore::connect(url)
        .await
        .context("connecting to the ledger database")?;
    store
        .snapshot(group)
        .await
        .with_context(|| format!("reading books of group {group}"))
}
