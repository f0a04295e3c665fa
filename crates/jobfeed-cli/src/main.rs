use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use jobfeed_core::{JobField, JobFilter, JobId};
use jobfeed_storage::ListingStore;
use jobfeed_sync::{report_markdown, SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Collect job listings from many boards into one deduplicated store")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the registered boards once.
    Sync(SyncArgs),
    /// Collapse listings that share a link.
    Dedup,
    /// Row counts per field value.
    Stats {
        #[arg(long, default_value = "source")]
        by: JobField,
    },
    List(ListArgs),
    Save {
        #[arg(long)]
        user: String,
        id: String,
    },
    Unsave {
        #[arg(long)]
        user: String,
        id: String,
    },
    Saved {
        #[arg(long)]
        user: String,
    },
    /// Summaries of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Run syncs on SYNC_CRON_1 / SYNC_CRON_2 until interrupted.
    Schedule,
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    max_pages: Option<u32>,
    /// Limit the run to these source ids (repeatable).
    #[arg(long = "source")]
    sources: Vec<String>,
    #[arg(long)]
    no_snapshots: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long = "source")]
    sources: Vec<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<ListingStore> {
    ListingStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if let Some(query) = args.query {
                config.query = query;
            }
            if let Some(max_pages) = args.max_pages {
                config.max_pages = max_pages;
            }
            config.only_sources = args.sources;
            if args.no_snapshots {
                config.export_snapshots = false;
            }

            let summary = SyncPipeline::open(config).await?.run_once().await?;
            println!(
                "sync complete: run_id={} jobs={} new={} reports={}",
                summary.run_id,
                summary.total_jobs,
                summary.net_new_total(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            for source in &summary.sources {
                println!("  {:<20} total={:<6} new={}", source.source, source.total, source.net_new);
            }
        }
        Commands::Dedup => {
            let store = open_store(&config).await?;
            let report = store.deduplicate().await?;
            println!(
                "removed {} rows across {} duplicate links",
                report.removed, report.duplicate_groups
            );
            for (source, n) in &report.removed_by_source {
                println!("  {source}: {n}");
            }
        }
        Commands::Stats { by } => {
            let store = open_store(&config).await?;
            println!("total jobs: {}", store.count().await?);
            println!("by {by}:");
            for (value, n) in store.count_by(by).await? {
                println!("  {value}: {n}");
            }
            println!("duplicate links: {}", store.duplicate_links().await?.len());
            for field in JobField::ALL {
                let missing = store.count_placeholder(field).await?;
                if missing > 0 {
                    println!("missing {field}: {missing}");
                }
            }
        }
        Commands::List(args) => {
            let store = open_store(&config).await?;
            let filter = JobFilter {
                title: args.title,
                company: args.company,
                location: args.location,
                sources: args.sources,
                since: args.since,
                ..JobFilter::default()
            };
            let jobs: Vec<_> = store.search(&filter).await?.into_iter().take(args.limit).collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in &jobs {
                    println!(
                        "{}  [{}] {} @ {} ({})\n    {}",
                        job.id, job.source, job.title, job.company, job.location, job.link
                    );
                }
            }
        }
        Commands::Save { user, id } => {
            let store = open_store(&config).await?;
            if store.save_job(&user, &JobId::from(id.as_str())).await? {
                println!("saved {id} for {user}");
            } else {
                println!("{id} is unknown or already saved");
            }
        }
        Commands::Unsave { user, id } => {
            let store = open_store(&config).await?;
            if store.unsave_job(&user, &JobId::from(id.as_str())).await? {
                println!("removed {id} from {user}'s saved jobs");
            } else {
                println!("{id} was not saved for {user}");
            }
        }
        Commands::Saved { user } => {
            let store = open_store(&config).await?;
            for job in store.saved_jobs(&user).await? {
                println!("{}  {} @ {}\n    {}", job.id, job.title, job.company, job.link);
            }
        }
        Commands::Report { runs, reports_dir } => {
            let root = reports_dir.unwrap_or(config.reports_dir);
            println!("{}", report_markdown(runs, &root)?);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::open(config).await?);
            pipeline.run_scheduler().await?;
        }
        Commands::Migrate => {
            open_store(&config).await?.close().await;
            tracing::info!(database_url = %config.database_url, "migrations applied");
        }
    }

    Ok(())
}
