use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use terra_core::{AlertLevel, Tier};
use terra_drift::{recalibration, DriftMonitor, RecommendationSet, TierSelection};
use terra_sync::{build_scheduler, SyncPipeline, TerraConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "terra-cli")]
#[command(about = "Land-price acquisition and benchmark drift monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the weekly batch once, or keep running it on the configured cron.
    Sync {
        #[arg(long)]
        schedule: bool,
    },
    /// Resolve one region's price per m² and print it as JSON.
    Price {
        region: String,
        #[arg(long)]
        max_listings: Option<usize>,
    },
    /// Show persistent drift alerts and tier summaries.
    Review,
    /// Compute benchmark recommendations and save them for approval.
    Propose,
    /// Apply the latest saved proposal to the benchmark file.
    Apply {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        tier: Option<Tier>,
        #[arg(long)]
        all: bool,
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Restore the most recent benchmark backup.
    Rollback,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync { schedule: false });
    match run(command, TerraConfig::from_env()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: TerraConfig) -> Result<ExitCode> {
    match command {
        Commands::Sync { schedule: false } => {
            let summary = SyncPipeline::new(config).await?.run_once().await?;
            println!(
                "sync complete: run_id={} regions={} live={} cached={} benchmark={} \
                 snapshots={} failures={} reports={}",
                summary.run_id,
                summary.regions,
                summary.live_prices,
                summary.cached_prices,
                summary.benchmark_prices,
                summary.snapshots_recorded,
                summary.region_failures,
                summary.reports_dir
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync { schedule: true } => {
            let pipeline = Arc::new(SyncPipeline::new(config).await?);
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Price { region, max_listings } => {
            let max_listings = max_listings.unwrap_or(config.max_listings);
            let pipeline = SyncPipeline::new(config).await?;
            let result = pipeline.acquirer().get_price(&region, max_listings).await;
            let out = serde_json::json!({
                "region": result.region,
                "price": result.price(),
                "mean_price": result.mean_price_per_m2,
                "provenance": result.provenance.tag(),
                "source_id": result.provenance.source_id(),
                "confidence": result.confidence,
                "listing_count": result.listing_count,
                "cache_age_hours": result.cache_age_hours,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Review => {
            if let Err(err) = review(&config).await {
                eprintln!("review unavailable: {err:#}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Propose => {
            let monitor = DriftMonitor::open(config.drift_paths()).await?;
            let (set, paths) = monitor.propose(Utc::now()).await?;
            print!("{}", recalibration::render_markdown(&set));
            println!("\nsaved {}", paths.markdown.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply { tier, all, yes } => {
            let monitor = DriftMonitor::open(config.drift_paths()).await?;
            let Some(set) = monitor.latest_proposal().await? else {
                eprintln!("no saved proposal; run `terra-cli propose` first");
                return Ok(ExitCode::FAILURE);
            };
            let selection = match (tier, all) {
                (Some(tier), false) => TierSelection::One(tier),
                (None, true) => TierSelection::All,
                _ => anyhow::bail!("pass exactly one of --tier or --all"),
            };
            print_plan(&set, selection);
            if !yes && !confirm("apply these benchmark changes? [y/N] ")? {
                eprintln!("declined; benchmarks unchanged");
                return Ok(ExitCode::FAILURE);
            }
            let outcome = monitor.apply(&set, selection, Utc::now()).await?;
            for change in &outcome.applied {
                println!("{}: {:.0} -> {:.0}", change.tier, change.previous, change.new);
            }
            println!("backup saved to {}", outcome.backup.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback => {
            let monitor = DriftMonitor::open(config.drift_paths()).await?;
            match monitor.rollback().await? {
                Some(outcome) => {
                    println!(
                        "restored benchmarks from {} (sha256 {})",
                        outcome.restored_from.display(),
                        outcome.restored_sha256
                    );
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no benchmark backup to roll back to");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Informational only; callers report failures without failing the command.
async fn review(config: &TerraConfig) -> Result<()> {
    let monitor = DriftMonitor::open(config.drift_paths()).await?;
    let now = Utc::now();
    let alerts = monitor.scan_all_regions(now).await?;
    let tiers = monitor.review(now).await?;

    println!("## Alerts");
    let mut quiet = true;
    for alert in alerts.iter().filter(|a| a.level != AlertLevel::None) {
        quiet = false;
        println!(
            "{:<8} {:<24} {:<9} {:+7.1}%  x{}  since {}",
            alert.level.to_string(),
            alert.region,
            alert.tier.as_str(),
            alert.current_drift_pct,
            alert.consecutive_periods,
            alert.first_detected.format("%Y-%m-%d")
        );
        println!("         {}", alert.recommendation);
    }
    if quiet {
        println!("no persistent drift");
    }

    println!("\n## Tiers ({} days)", monitor.config().review_window_days);
    for status in &tiers {
        match status.summary() {
            Some(s) => println!(
                "{:<9} weighted {:+7.1}%  30d {}  regions {}  snapshots {}",
                s.tier.as_str(),
                s.weighted_avg_drift_pct,
                s.smoothed_drift_30d_pct
                    .map(|d| format!("{d:+.1}%"))
                    .unwrap_or_else(|| "n/a".to_string()),
                s.region_count,
                s.snapshot_count
            ),
            None => println!("{:<9} no data", status.tier().as_str()),
        }
    }
    Ok(())
}

fn print_plan(set: &RecommendationSet, selection: TierSelection) {
    println!("proposal generated {}", set.generated_at.format("%Y-%m-%d %H:%M UTC"));
    for rec in &set.recommendations {
        let selected = match selection {
            TierSelection::One(tier) => rec.tier == tier,
            TierSelection::All => true,
        };
        if selected {
            println!(
                "  [{}] {}: {:.0} -> {:.0} {} ({:+.1}%)",
                rec.urgency,
                rec.tier,
                rec.current_benchmark,
                rec.proposed_benchmark,
                set.currency,
                rec.smoothed_drift_pct
            );
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush().context("flushing stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
