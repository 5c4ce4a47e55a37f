use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use sellerdw::storage::repository::{self, FactTable};
use sellerdw::sync::planner::backfill_progress;

#[derive(Parser)]
#[command(name = "sellerdw", about = "Marketplace seller data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.sellerdw/sellerdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON file overriding the built-in dataset policies
    #[arg(long)]
    policies: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl sellerdw::SyncProgress for StderrProgress {
    fn on_plan(&self, plan: &sellerdw::Plan) {
        eprintln!("Syncing {plan}...");
    }

    fn on_page_fetched(&self, dataset: sellerdw::DatasetKey, page: u32, rows: usize) {
        eprintln!("  {dataset}: page {page}, {rows} rows");
    }

    fn on_report_status(&self, report: sellerdw::api::ReportKind, status: sellerdw::api::TaskStatus) {
        eprintln!("  {report} report: {status}");
    }

    fn on_dataset_complete(&self, report: &sellerdw::DatasetReport) {
        match &report.error {
            Some(error) => eprintln!("  {}: failed: {error}", report.dataset),
            None => eprintln!("  {}: {:?}, {} rows applied", report.dataset, report.status, report.applied),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync marketplace data to the local warehouse
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
        /// Print the result as JSON
        #[arg(long, global = true)]
        json: bool,
    },
    /// Show weekly backfill progress
    Progress,
    /// Show per-dataset freshness and warehouse counts
    Status,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Fast load of every dataset's priority window
    Priority,
    /// Re-validate trailing windows that are due
    Refresh,
    /// Advance datasets forward until they reach the watermark
    Catchup {
        /// Datasets advanced per tick
        #[arg(long, default_value = "11")]
        max_datasets: usize,
    },
    /// Move backfill cursors backward
    Backfill {
        /// Number of backward steps
        #[arg(long, default_value = "1")]
        ticks: u32,
    },
    /// Sweep history week by week back to a lower bound
    Weeks {
        /// Lower bound (YYYY-MM-DD); defaults to the sales backfill bound
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Windows processed in this run
        #[arg(long, default_value = "1000")]
        max_windows: usize,
    },
    /// Sync one dataset by one plan
    Dataset {
        /// Dataset key, e.g. sales or order_stats
        key: sellerdw::DatasetKey,
        /// Refresh this many trailing days instead of the next catch-up chunk
        #[arg(long)]
        overlap_days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => sellerdw::Database::open_at(path).await?,
        None => sellerdw::Database::open().await?,
    };
    let policies = match &cli.policies {
        Some(path) => sellerdw::PolicySet::from_json_file(path)?,
        None => sellerdw::PolicySet::default(),
    };

    match cli.command {
        Commands::Status => {
            print_status(&db).await?;
        }
        Commands::Progress => {
            print_progress(&db, &policies).await?;
        }
        Commands::Config { action } => {
            handle_config(&db, action).await?;
        }
        Commands::Sync { target, json } => {
            let api = sellerdw::HttpApi::from_env()?;
            let dw = sellerdw::SellerDW::new(db, Arc::new(api), policies, Arc::new(StderrProgress));
            handle_sync(&dw, target, json).await?;
        }
    }

    Ok(())
}

async fn handle_sync(dw: &sellerdw::SellerDW, target: SyncTarget, json: bool) -> anyhow::Result<()> {
    match target {
        SyncTarget::Priority => print_wave(&dw.sync_priority().await?, json)?,
        SyncTarget::Refresh => print_wave(&dw.sync_refresh().await?, json)?,
        SyncTarget::Catchup { max_datasets } => {
            let reports = dw.sync_catchup(max_datasets).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                let applied: u64 = reports.iter().map(|r| r.total_applied()).sum();
                let failed: usize = reports.iter().map(|r| r.failures().len()).sum();
                println!("Catch-up: {} ticks, {applied} rows applied, {failed} failures", reports.len());
            }
        }
        SyncTarget::Backfill { ticks } => {
            for _ in 0..ticks.max(1) {
                let tick = dw.sync_backfill().await?;
                if !json {
                    print_wave(&tick.report, false)?;
                }
                let progress = &tick.progress;
                if json {
                    println!("{}", serde_json::to_string_pretty(progress)?);
                } else {
                    println!(
                        "Backfill: {:.1}% ({} weeks done, {} remaining)",
                        progress.percent, progress.weeks_done, progress.weeks_remaining
                    );
                }
                if progress.completed {
                    break;
                }
            }
        }
        SyncTarget::Weeks { since, max_windows } => {
            let report = dw.sync_weeks(since, max_windows).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Week sync: {} windows, {} processed, {} skipped, {} failed{}",
                    report.windows_total,
                    report.processed,
                    report.skipped,
                    report.failed,
                    if report.completed { ", complete" } else { "" }
                );
            }
        }
        SyncTarget::Dataset { key, overlap_days } => match dw.sync_dataset(key, overlap_days).await? {
            Some(outcome) if json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            Some(outcome) => println!(
                "{}: {} fetched, {} applied, cursor at {}",
                outcome.plan, outcome.fetched, outcome.applied, outcome.checkpoint.cursor_time
            ),
            None => println!("{key}: nothing to sync"),
        },
    }
    Ok(())
}

fn print_wave(report: &sellerdw::WaveReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{} wave: {:?}", report.wave, report.status());
    for entry in &report.datasets {
        let range = entry
            .range
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &entry.error {
            Some(error) => println!("  {:<18} {:<24} FAILED: {error}", entry.dataset.as_str(), range),
            None => println!(
                "  {:<18} {:<24} {:?}: {} fetched, {} applied",
                entry.dataset.as_str(),
                range,
                entry.status,
                entry.fetched,
                entry.applied
            ),
        }
    }
    Ok(())
}

async fn print_status(db: &sellerdw::Database) -> anyhow::Result<()> {
    let (checkpoints, runs, counts) = db
        .reader()
        .call(|conn| {
            let checkpoints = repository::list_checkpoints(conn)?;
            let runs = repository::latest_sync_runs(conn)?;
            let mut counts = Vec::new();
            for table in FactTable::ALL {
                counts.push((table, repository::count_rows(conn, table)?));
            }
            Ok::<_, rusqlite::Error>((checkpoints, runs, counts))
        })
        .await?;

    println!("Warehouse Status");
    for (table, count) in counts {
        println!("  {:<24} {count}", table.name());
    }
    println!();
    println!("  {:<18} {:<12} {:<12} Last run", "Dataset", "Cursor", "Backfill");
    for dataset in sellerdw::DatasetKey::ALL {
        let cursor = |variant: sellerdw::CheckpointVariant| {
            checkpoints
                .iter()
                .find(|cp| cp.key == sellerdw::CheckpointKey::new(dataset, variant))
                .map(|cp| cp.cursor_time.to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        let last_run = runs
            .iter()
            .find(|r| r.dataset == dataset.as_str())
            .map(|r| match &r.error_message {
                Some(error) => format!("{} {} ({error})", r.started_at, r.status),
                None => format!("{} {}, {} applied", r.started_at, r.status, r.applied_rows),
            })
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<18} {:<12} {:<12} {last_run}",
            dataset.as_str(),
            cursor(sellerdw::CheckpointVariant::Forward),
            cursor(sellerdw::CheckpointVariant::Backfill),
        );
    }
    Ok(())
}

async fn print_progress(db: &sellerdw::Database, policies: &sellerdw::PolicySet) -> anyhow::Result<()> {
    let checkpoint = db
        .reader()
        .call(|conn| {
            repository::get_checkpoint(conn, sellerdw::CheckpointKey::backfill(sellerdw::DatasetKey::Sales))
        })
        .await?;
    let today = chrono::Local::now().date_naive();
    let progress = backfill_progress(policies.get(sellerdw::DatasetKey::Sales), checkpoint.as_ref(), today);
    println!("Sales backfill to {}", progress.lower_bound);
    println!("  Weeks done:      {}", progress.weeks_done);
    println!("  Weeks remaining: {}", progress.weeks_remaining);
    println!(
        "  Progress:        {:.1}%{}",
        progress.percent,
        if progress.completed { " (complete)" } else { "" }
    );
    Ok(())
}

async fn handle_config(db: &sellerdw::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            db.writer()
                .call(move |conn| repository::set_config(conn, &key, &value))
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> = db
                .reader()
                .call(|conn| repository::list_config(conn))
                .await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
