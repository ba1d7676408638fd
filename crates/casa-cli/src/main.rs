use std::path::PathBuf;

use anyhow::{bail, Result};
use casa_sync::{validate_platform, MergeConfig, MergePipeline, PlatformRegistry};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "casa")]
#[command(about = "Merge scraped listing snapshots into the persisted store")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Overrides {
    /// Directory holding the persisted `<platform>Results.json` files.
    #[arg(long, global = true)]
    old_dir: Option<PathBuf>,
    /// Directory holding the scraper's `<platform>Results.json` files.
    #[arg(long, global = true)]
    new_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    miss_threshold: Option<u32>,
    #[arg(long, global = true)]
    retention_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile each platform's fresh scrape into the persisted store.
    Merge {
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },
    /// Check scraper output and write per-platform validation reports.
    Validate {
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn apply_overrides(mut config: MergeConfig, overrides: Overrides) -> MergeConfig {
    if let Some(dir) = overrides.old_dir {
        config.old_results_dir = dir;
    }
    if let Some(dir) = overrides.new_dir {
        config.new_results_dir = dir;
    }
    if let Some(threshold) = overrides.miss_threshold {
        config.miss_threshold = threshold;
    }
    if let Some(days) = overrides.retention_days {
        config.retention_days = days;
    }
    config
}

fn selected_platforms(registry: &PlatformRegistry, requested: Vec<String>) -> Vec<String> {
    if requested.is_empty() {
        registry.enabled().map(|p| p.platform_id.clone()).collect()
    } else {
        requested
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = apply_overrides(MergeConfig::from_env(), cli.overrides);
    let registry = PlatformRegistry::load(&config.workspace_root).await?;

    match cli.command.unwrap_or(Commands::Merge { platforms: Vec::new() }) {
        Commands::Merge { platforms } => {
            let platforms = selected_platforms(&registry, platforms);
            let pipeline = MergePipeline::new(config, registry)?;
            let summary = pipeline.run_platforms(&platforms).await?;
            println!("merge complete: run_id={}", summary.run_id);
            for p in &summary.platforms {
                println!(
                    "  {}: added={} updated={} removed={} reactivated={} purged={} total={}",
                    p.platform,
                    p.stats.added,
                    p.stats.updated,
                    p.stats.removed,
                    p.stats.reactivated,
                    p.stats.purged,
                    p.total
                );
            }
        }
        Commands::Validate { platforms } => {
            let now = Utc::now();
            let mut critical = Vec::new();
            for platform_id in selected_platforms(&registry, platforms) {
                let platform = registry.resolve(&platform_id);
                let summary = validate_platform(&config, &platform, now).await?;
                println!(
                    "  {}: total={} valid={} invalid={} report={}",
                    summary.platform, summary.total, summary.valid, summary.invalid, summary.report_path
                );
                if summary.is_critical() {
                    error!(platform = %summary.platform, ratio = summary.invalid_ratio(), "too many invalid listings");
                    critical.push(summary.platform);
                }
            }
            if !critical.is_empty() {
                bail!("validation failed for: {}", critical.join(", "));
            }
            println!("validation complete");
        }
    }

    Ok(())
}
