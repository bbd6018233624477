use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gofr_core::{OfferDraft, TemplateAdCopy};
use gofr_notify::{DeliveryTracker, WebhookConfig};
use gofr_recon::{AppConfig, CleanupScheduler, ReconcileEngine};
use gofr_store::StoreClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gofr-cli")]
#[command(about = "GOFR command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the store schema if absent.
    Migrate,
    /// Reconcile a JSON batch of offer drafts against the store.
    Ingest { batch: PathBuf },
    /// Run purge passes (both by default).
    Cleanup {
        #[arg(long)]
        aged: bool,
        #[arg(long)]
        duplicates: bool,
    },
    /// Send pending webhook notifications.
    Notify,
    /// Full cron body: ingest, then cleanup, then notify.
    Run { batch: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("GOFR_LOG")
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    // Configuration errors abort here, before any store or network activity.
    let config = AppConfig::from_env().context("loading configuration")?;
    let store = StoreClient::new(config.database_url.clone());

    let result = run_command(cli.command, &config, &store).await;
    store.close().await;
    result
}

async fn run_command(command: Commands, config: &AppConfig, store: &StoreClient) -> Result<()> {
    match command {
        Commands::Migrate => {
            store.migrate().await.context("creating store schema")?;
            println!("schema ready at {}", store.url());
        }
        Commands::Ingest { batch } => {
            ingest(config, store, &batch).await?;
        }
        Commands::Cleanup { aged, duplicates } => {
            cleanup(config, store, aged, duplicates).await?;
        }
        Commands::Notify => {
            notify(config, store).await?;
        }
        Commands::Run { batch } => {
            ingest(config, store, &batch).await?;
            cleanup(config, store, false, false).await?;
            notify(config, store).await?;
        }
    }
    Ok(())
}

async fn ingest(config: &AppConfig, store: &StoreClient, batch: &Path) -> Result<()> {
    let text = std::fs::read_to_string(batch)
        .with_context(|| format!("reading batch file {}", batch.display()))?;
    let drafts: Vec<OfferDraft> = serde_json::from_str(&text)
        .with_context(|| format!("parsing batch file {}", batch.display()))?;

    let ad_copy = TemplateAdCopy;
    let engine = ReconcileEngine::new(store, &ad_copy, config.freshness_window());
    let summary = engine.ingest_batch(drafts).await?;
    println!(
        "ingest complete: inserted={} refreshed={} skipped={} failed={}",
        summary.inserted, summary.refreshed, summary.skipped, summary.failed
    );
    Ok(())
}

async fn cleanup(config: &AppConfig, store: &StoreClient, aged: bool, duplicates: bool) -> Result<()> {
    // No flags means both passes.
    let (run_aged, run_duplicates) = if aged || duplicates {
        (aged, duplicates)
    } else {
        (true, true)
    };

    let cleaner = CleanupScheduler::new(store, config.retention_horizon());
    if run_aged {
        let removed = cleaner.purge_aged().await?;
        println!("age-based purge removed {removed} entries");
    }
    if run_duplicates {
        let removed = cleaner.purge_duplicates().await?;
        println!("duplicate purge removed {removed} entries");
    }
    Ok(())
}

async fn notify(config: &AppConfig, store: &StoreClient) -> Result<()> {
    let webhooks = WebhookConfig::from_env(
        config.redirect_base.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )
    .context("loading webhook configuration")?;
    let tracker = DeliveryTracker::new(store, webhooks).context("building delivery tracker")?;
    let summary = tracker.dispatch_pending().await?;
    println!(
        "notify complete: sent={} skipped={} failed={}",
        summary.sent, summary.skipped, summary.failed
    );
    Ok(())
}
