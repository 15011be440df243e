use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parcel_reconcile::{
    get_classification_counts, get_document_stats, get_map_points, get_presence_timeline,
    get_records_by_classification, get_records_by_parcel, open_readonly, run_rebuild, store_digest,
    verify_count, Classification, ParcelRecord, ReconcileConfig,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "parcel-reconcile", version, about = "Reconcile evidence parcels against yearly snapshots")]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output store, overrides the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the store from the current input file set
    Rebuild {
        /// Evidence directory, overrides the config file
        #[arg(long)]
        evidence_dir: Option<PathBuf>,

        /// Print the rebuild report as JSON
        #[arg(long)]
        json: bool,
    },
    #[command(flatten)]
    Query(QueryCommand),
}

/// Read-only commands against an existing store
#[derive(Subcommand)]
enum QueryCommand {
    /// Print row count and content digest
    Verify,
    /// Rows for one parcel identifier
    Parcel { id: String },
    /// Rows with one classification label
    Class { label: String },
    /// Map-plottable rows as CSV
    Map,
    /// Counts per classification and per document
    Summary,
    /// Year-by-year presence of one parcel
    Timeline { id: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ReconcileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Rebuild { evidence_dir, json } => {
            let config = config.with_overrides(cli.database, evidence_dir);
            run_import(&config, json)
        }
        Command::Query(query) => {
            let config = config.with_overrides(cli.database, None);
            run_query(&config, query)
        }
    }
}

fn run_import(config: &ReconcileConfig, json: bool) -> Result<()> {
    info!(
        "Starting parcel-reconcile v{} rebuild into {}",
        env!("CARGO_PKG_VERSION"),
        config.database.display()
    );

    let report = run_rebuild(config).context("Rebuild failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", report.summary());
    for (label, count) in &report.classification_counts {
        println!("  {:<12} {}", label.as_str(), count);
    }
    for rejected in &report.documents_rejected {
        println!("  rejected {}: {}", rejected.path.display(), rejected.reason);
    }
    for excluded in &report.excluded_snapshots {
        println!("  excluded snapshot {}", excluded);
    }

    Ok(())
}

fn run_query(config: &ReconcileConfig, command: QueryCommand) -> Result<()> {
    let conn = open_readonly(&config.database)
        .with_context(|| format!("Failed to open store {}", config.database.display()))?;

    match command {
        QueryCommand::Verify => {
            let count = verify_count(&conn)?;
            let digest = store_digest(&conn)?;
            println!("rows:   {}", count);
            println!("digest: {}", digest);
        }
        QueryCommand::Parcel { id } => print_records(&get_records_by_parcel(&conn, &id)?),
        QueryCommand::Class { label } => {
            let classification: Classification = label.parse()?;
            print_records(&get_records_by_classification(&conn, classification)?);
        }
        QueryCommand::Map => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for point in get_map_points(&conn)? {
                writer.serialize(&point)?;
            }
            writer.flush()?;
        }
        QueryCommand::Summary => {
            for count in get_classification_counts(&conn)? {
                println!("{:<12} {}", count.classification.as_str(), count.count);
            }
            println!();
            for stat in get_document_stats(&conn)? {
                println!(
                    "{:<30} {:>5} rows  {:>5} with parcel  {:>5} with coordinates",
                    stat.document_id, stat.record_count, stat.with_parcel, stat.with_coordinates
                );
            }
        }
        QueryCommand::Timeline { id } => {
            for row in get_presence_timeline(&conn, &id)? {
                println!("{}  {}  {}", row.parcel_id, row.year, if row.present { "present" } else { "absent" });
            }
        }
    }

    Ok(())
}

fn print_records(records: &[ParcelRecord]) {
    for record in records {
        let coordinate = match (record.latitude, record.longitude) {
            (Some(lat), Some(lon)) => format!("{:.6},{:.6}", lat, lon),
            _ => "-".to_string(),
        };
        println!(
            "#{:<5} {:<14} {:<12} {} -> {}  amount={}  coord={}  doc={}",
            record.id,
            record.parcel_id.as_deref().unwrap_or("-"),
            record.classification.as_str(),
            record.grantor,
            record.grantee,
            record.amount.as_deref().unwrap_or("-"),
            coordinate,
            record.document_id
        );
    }
    println!("{} row(s)", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rebuild_and_queries_parse_to_separate_commands() {
        let cli = Cli::try_parse_from(["parcel-reconcile", "rebuild", "--json", "--evidence-dir", "ev"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Rebuild { json: true, evidence_dir: Some(_) }
        ));

        let cli = Cli::try_parse_from(["parcel-reconcile", "--database", "x.db", "timeline", "TMK 1-2-3"]).unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
        assert!(matches!(
            cli.command,
            Command::Query(QueryCommand::Timeline { ref id }) if id == "TMK 1-2-3"
        ));

        let cli = Cli::try_parse_from(["parcel-reconcile", "verify"]).unwrap();
        assert!(matches!(cli.command, Command::Query(QueryCommand::Verify)));
    }
}
