//! `vikoba`: operator tool for a group's ledger.
//!
//! - `reconcile`: compare the books against reference totals (JSON)
//! - `balance`: print one account's balance, optionally as of a date
//! - `verify`: run the journal integrity sweep only
//!
//! The books come from a JSON snapshot file or straight from Postgres.
//! `reconcile` and `verify` exit with status 2 when the run fails.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use vikoba_accounting::AccountKey;
use vikoba_core::{GroupId, Money};
use vikoba_infra::LedgerConfig;
use vikoba_observability::LogFormat;
use vikoba_reconciliation::{ReconciliationReport, ReferenceTotals, reconcile};

mod source;

use source::SourceArgs;

const EXIT_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "vikoba")]
#[command(about = "Village-bank ledger: balances, verification and reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file (environment variables still apply on top)
    #[arg(short, long, env = "VIKOBA_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format (json, pretty)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(flatten)]
    source: SourceArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the books against legacy reference totals
    Reconcile {
        /// Reference totals (JSON)
        #[arg(short, long)]
        reference: PathBuf,

        /// Allowed |derived - reference|, e.g. 0.01
        #[arg(short, long)]
        tolerance: Option<Money>,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print an account balance
    Balance {
        /// Account, `BANK_CASH` or `MEMBER_SAVINGS:<member uuid>` style
        #[arg(short, long)]
        account: AccountKey,

        /// Only count entries that occurred at or before this instant (RFC 3339)
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },

    /// Check the journal's structural integrity
    Verify,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    vikoba_observability::init(config.log_format);

    let snapshot = source::load_snapshot(&cli.source, &config).await?;
    tracing::info!(
        group_id = %snapshot.group_id,
        entries = snapshot.entries.len(),
        last_sequence = snapshot.last_sequence,
        "snapshot loaded"
    );

    match cli.command {
        Commands::Reconcile {
            reference,
            tolerance,
            output,
        } => {
            let raw = std::fs::read_to_string(&reference)
                .with_context(|| format!("reading reference totals {}", reference.display()))?;
            let reference: ReferenceTotals = serde_json::from_str(&raw)
                .with_context(|| format!("parsing reference totals {}", reference.display()))?;
            let tolerance = tolerance.unwrap_or(config.reconciliation_tolerance);

            let report = reconcile(&snapshot, &reference, tolerance)?;
            write_report(&report, output)?;
            Ok(exit_for(&report))
        }
        Commands::Balance { account, as_of } => {
            let balance = snapshot.balance_of(&account, as_of)?;
            let out = serde_json::json!({
                "group_id": snapshot.group_id,
                "account": account,
                "as_of": as_of,
                "balance": balance.to_string(),
                "balance_minor": balance.minor(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify => {
            let report = reconcile(&snapshot, &ReferenceTotals::default(), Money::ZERO)?;
            write_report(&report, None)?;
            Ok(exit_for(&report))
        }
    }
}

fn write_report(report: &ReconciliationReport, output: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn exit_for(report: &ReconciliationReport) -> ExitCode {
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        tracing::warn!(
            discrepancies = report.discrepancies.len(),
            integrity_issues = report.integrity_issues.len(),
            "reconciliation failed"
        );
        ExitCode::from(EXIT_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_reconcile_with_snapshot() {
        let cli = Cli::try_parse_from([
            "vikoba",
            "--snapshot",
            "books.json",
            "reconcile",
            "--reference",
            "legacy.json",
            "--tolerance",
            "0.01",
        ])
        .unwrap();

        assert_eq!(cli.source.snapshot, Some(PathBuf::from("books.json")));
        match cli.command {
            Commands::Reconcile { tolerance, .. } => {
                assert_eq!(tolerance, Some(Money::from_minor(1)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_member_account_for_balance() {
        let member = vikoba_core::MemberId::new();
        let account = format!("MEMBER_SAVINGS:{member}");
        let cli = Cli::try_parse_from([
            "vikoba",
            "--snapshot",
            "books.json",
            "balance",
            "--account",
            account.as_str(),
        ])
        .unwrap();
        match cli.command {
            Commands::Balance { account, as_of } => {
                assert_eq!(account, AccountKey::member_savings(member));
                assert!(as_of.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_tolerance() {
        let err = Cli::try_parse_from([
            "vikoba",
            "reconcile",
            "--reference",
            "legacy.json",
            "--tolerance",
            "0.001",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn group_id_parses() {
        let group = GroupId::new();
        let group_arg = group.to_string();
        let cli = Cli::try_parse_from(["vikoba", "--group", group_arg.as_str(), "verify"]).unwrap();
        assert_eq!(cli.source.group, Some(group));
    }
}
