use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cylsnap_core::{HiddenTypeMarker, Language, TypeKey};
use cylsnap_inventory::{InventoryQuery, InventoryService, RiskThresholds};
use cylsnap_storage::{BackoffPolicy, PgStore};
use cylsnap_sync::{BatchSummary, RefreshEngine, RefreshMode, SyncConfig, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cylsnap")]
#[command(about = "Cylinder state snapshot and inventory grouping")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the snapshot table from the source mirror.
    Sync {
        /// Truncate and rebuild every snapshot row.
        #[arg(long, conflicts_with_all = ["id", "batch_size"])]
        full: bool,
        /// Refresh one cylinder; deletes its snapshot if the source no longer has it.
        #[arg(long, conflicts_with = "batch_size")]
        id: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    Migrate,
    Inventory {
        #[command(flatten)]
        filter: FilterArgs,
        /// One row per type and status instead of per type.
        #[arg(long)]
        rows: bool,
        #[arg(long)]
        json: bool,
    },
    Alerts {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "en")]
        lang: String,
        #[arg(long)]
        json: bool,
    },
    Hide {
        type_key: String,
        #[arg(long)]
        note: Option<String>,
    },
    Unhide {
        type_key: String,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    type_key: Option<String>,
    /// Canonical status name or status family.
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    enduser: Option<String>,
    #[arg(long)]
    include_hidden: bool,
    /// Skip snapshot rows whose cylinder is gone from the source.
    #[arg(long)]
    orphan_guard: bool,
}

impl FilterArgs {
    fn into_query(self) -> InventoryQuery {
        InventoryQuery {
            type_key: self.type_key.map(TypeKey::new),
            status: self.status,
            enduser_code: self.enduser,
            include_hidden: self.include_hidden,
            orphan_guard: self.orphan_guard,
        }
    }
}

fn init_logging(config: &SyncConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect_with_retry(&config.database_url, BackoffPolicy::default())
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn inventory_service(config: &SyncConfig) -> Result<InventoryService> {
    let store = connect(config).await?;
    let thresholds = RiskThresholds::load(&config.rules_dir)?;
    Ok(InventoryService::new(store.clone(), thresholds).with_mirror(store))
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "sync complete: run_id={} mode={} attempted={} succeeded={} deleted={} skipped={}{}",
        summary.run_id,
        summary.mode,
        summary.attempted,
        summary.succeeded,
        summary.deleted,
        summary.skipped_count(),
        if summary.interrupted { " (interrupted)" } else { "" },
    );
    for skipped in &summary.skipped {
        eprintln!("  skipped {}: {}", skipped.cylinder_id, skipped.reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Sync {
        full: false,
        id: None,
        batch_size: None,
    }) {
        Commands::Sync {
            full,
            id,
            batch_size,
        } => {
            let mode = match (full, id) {
                (true, _) => RefreshMode::Full,
                (false, Some(cylinder_id)) => RefreshMode::Single { cylinder_id },
                (false, None) => RefreshMode::Incremental {
                    batch_size: batch_size.unwrap_or(config.batch_size),
                },
            };
            let store = connect(&config).await?;
            let engine = RefreshEngine::new(store.clone(), store)
                .with_clock(Arc::new(SystemClock))
                .with_options(config.engine_options());

            let stop = engine.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current record");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            let summary = engine.run(&mode).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Inventory { filter, rows, json } => {
            let service = inventory_service(&config).await?;
            let query = filter.into_query();
            if rows {
                let rows = service.rows(&query).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else {
                    for row in rows {
                        println!(
                            "{:<32}  {:<20}  count={:<5} available={}",
                            row.type_key, row.status, row.count, row.available
                        );
                    }
                }
            } else {
                let groups = service.groups(&query).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&groups)?);
                } else {
                    for group in groups {
                        println!(
                            "{:<32}  {:<8} {} {} total={} available={}",
                            group.type_key,
                            group.risk,
                            group.gas_name,
                            group
                                .capacity
                                .map(|c| c.to_string())
                                .unwrap_or_default(),
                            group.total,
                            group.available
                        );
                    }
                }
            }
        }
        Commands::Alerts { filter, lang, json } => {
            let lang: Language = lang.parse().map_err(anyhow::Error::msg)?;
            let service = inventory_service(&config).await?;
            let entries = service.alerts(&filter.into_query(), lang).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("[{}] {} {}: {}", entry.risk, entry.type_key, entry.gas_name, entry.advisory);
                }
            }
        }
        Commands::Hide { type_key, note } => {
            let service = inventory_service(&config).await?;
            service
                .hide(&HiddenTypeMarker {
                    type_key: TypeKey::new(type_key),
                    hidden_at: Utc::now(),
                    note,
                })
                .await?;
        }
        Commands::Unhide { type_key } => {
            let service = inventory_service(&config).await?;
            if !service.unhide(&TypeKey::new(type_key.clone())).await? {
                eprintln!("type {type_key} was not hidden");
            }
        }
        Commands::Serve { port } => {
            let service = inventory_service(&config).await?;
            cylsnap_web::serve(
                cylsnap_web::AppState::new(service),
                port.unwrap_or(config.web_port),
            )
            .await?;
        }
    }

    Ok(())
}
