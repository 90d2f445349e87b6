use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use leadflow_core::{DeathRegistryJob, ListingFeedJob};
use leadflow_sync::{DEATH_REGISTRY_QUEUE, LISTING_FEED_QUEUE};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadflow")]
#[command(about = "leadflow ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process queued jobs until interrupted.
    Work,
    /// Put a job on a queue.
    Enqueue {
        #[command(subcommand)]
        job: EnqueueCommand,
    },
    /// Serve the HTTP job trigger.
    Serve,
}

#[derive(Debug, Subcommand)]
enum EnqueueCommand {
    DeathRegistry(DeathRegistryArgs),
    ListingFeed(ListingFeedArgs),
}

#[derive(Debug, Args)]
struct DeathRegistryArgs {
    /// Object path of an uploaded registry file.
    #[arg(long, conflicts_with_all = ["year", "month"])]
    path: Option<String>,
    #[arg(long, requires = "month")]
    year: Option<i32>,
    #[arg(long, requires = "year")]
    month: Option<u32>,
}

#[derive(Debug, Args)]
struct ListingFeedArgs {
    #[arg(long)]
    since: NaiveDate,
    #[arg(long)]
    until: NaiveDate,
}

impl DeathRegistryArgs {
    fn into_job(self) -> Result<DeathRegistryJob> {
        match (self.path, self.year, self.month) {
            (Some(path), None, None) => {
                let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
                Ok(DeathRegistryJob::ManualPath { path, file_name })
            }
            (None, Some(year), Some(month)) => Ok(DeathRegistryJob::ScheduledWindow { year, month }),
            _ => bail!("pass either --path or both --year and --month"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Work => {
            let (stop, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing in-flight jobs");
                    let _ = stop.send(true);
                }
            });
            leadflow_sync::run_worker_from_env(shutdown).await?;
        }
        Commands::Enqueue { job } => {
            let (queue, payload) = match job {
                EnqueueCommand::DeathRegistry(args) => {
                    let job = args.into_job()?;
                    job.validate()?;
                    (DEATH_REGISTRY_QUEUE, serde_json::to_value(&job)?)
                }
                EnqueueCommand::ListingFeed(args) => {
                    let job = ListingFeedJob {
                        since: args.since,
                        until: args.until,
                    };
                    job.validate()?;
                    (LISTING_FEED_QUEUE, serde_json::to_value(&job)?)
                }
            };
            let response = leadflow_sync::enqueue_from_env(queue, payload).await?;
            println!(
                "{}",
                serde_json::to_string(&response).context("encoding trigger response")?
            );
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            leadflow_web::serve_from_env().await?;
        }
    }

    Ok(())
}
