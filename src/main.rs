use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grist_geocode_sync::{
    init_tracing, AppConfig, DryRunStore, GeocodeSync, GeocodingService, GristClient, HostStore,
    Interaction, SyncJournal, SyncOptions, WidgetSession,
};
use serde_json::Value;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "grist-geocode-sync")]
#[command(about = "Fill in coordinates for addresses in a Grist table")]
#[command(version)]
struct Cli {
    /// Table to geocode (overrides GRIST_TABLE_ID)
    #[arg(short, long, global = true)]
    table: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log updates instead of writing them to Grist
    #[arg(long, global = true)]
    dry_run: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single pass over the table and print its report
    Once,

    /// Poll the table and run a pass whenever none is in flight
    Watch {
        /// Poll interval in milliseconds (overrides POLL_INTERVAL_MS)
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Print the effective configuration without secrets
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "info,grist_geocode_sync=debug",
        (false, _) => "debug,grist_geocode_sync=trace",
    };
    init_tracing(filter, cli.json_logs);

    let mut config = AppConfig::from_env();
    if let Some(table) = &cli.table {
        config.grist_table_id = Some(table.clone());
    }

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
        Commands::Once => run_once(&config, cli.dry_run).await,
        Commands::Watch { interval_ms } => {
            if let Some(ms) = interval_ms {
                config.poll_interval_ms = ms.max(100);
            }
            run_watch(&config, cli.dry_run).await
        }
    }
}

struct Runtime {
    grist: GristClient,
    session: WidgetSession,
    journal: Option<SyncJournal>,
}

fn build_runtime(config: &AppConfig, dry_run: bool) -> Result<Runtime> {
    let Some(table_id) = config.grist_table_id.clone() else {
        bail!("no table configured; set GRIST_TABLE_ID or pass --table");
    };
    let grist = GristClient::new(config).context("failed to configure Grist client")?;
    let geocoder = GeocodingService::new(config)
        .context("failed to configure geocoder")?
        .into_inner();
    let store: Arc<dyn HostStore> = if dry_run {
        Arc::new(DryRunStore)
    } else {
        Arc::new(grist.clone())
    };

    let journal = if config.telemetry_enabled {
        let dir = config
            .telemetry_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Some(SyncJournal::open(&dir, config).context("failed to open sync journal")?)
    } else {
        None
    };

    let mut options = SyncOptions::from_config(config);
    if let Some(journal) = &journal {
        options = options.with_journal(journal.clone());
    }

    let mut session = WidgetSession::new(GeocodeSync::new(geocoder, store, options));
    session.set_table_id(table_id);
    session.on_options(Value::Null, &Interaction::full_access());
    Ok(Runtime {
        grist,
        session,
        journal,
    })
}

async fn run_once(config: &AppConfig, dry_run: bool) -> Result<()> {
    let Runtime {
        grist,
        mut session,
        journal,
    } = build_runtime(config, dry_run)?;
    let table_id = session.table_id().unwrap_or_default().to_string();

    let records = grist
        .fetch_records(&table_id)
        .await
        .with_context(|| format!("failed to fetch records from {table_id}"))?;
    session.on_records(records, config.field_mapping.clone());
    let report = session.sync().wait_idle().await;

    flush_journal(journal.as_ref());
    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn run_watch(config: &AppConfig, dry_run: bool) -> Result<()> {
    let Runtime {
        grist,
        mut session,
        journal,
    } = build_runtime(config, dry_run)?;
    let table_id = session.table_id().unwrap_or_default().to_string();
    info!(
        %table_id,
        poll_interval_ms = config.poll_interval_ms,
        dry_run,
        "watching table"
    );

    let mut ticker = interval(Duration::from_millis(config.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match grist.fetch_records(&table_id).await {
                    Ok(records) => {
                        session.on_records(records, config.field_mapping.clone());
                    }
                    Err(err) => warn!(?err, %table_id, "failed to fetch records"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down; waiting for in-flight pass");
                break;
            }
        }
    }

    session.sync().wait_idle().await;
    flush_journal(journal.as_ref());
    Ok(())
}

fn flush_journal(journal: Option<&SyncJournal>) {
    if let Some(journal) = journal {
        if let Err(err) = journal.flush() {
            error!(?err, "failed to flush sync journal");
        }
    }
}
