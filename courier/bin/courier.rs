//! Command-line entry point for courier
//!
//! `courier run` delivers until interrupted. The other commands operate on
//! the configured queue and message stores directly, so they can be used
//! alongside a running instance that shares a file-backed queue.

#![allow(clippy::print_stdout)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use clap::{Parser, Subcommand};
use courier::{Controller, Courier};
use courier_common::logging;
use courier_queue::{QueueItem, QueueItemId, QueueStatus};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outbound mail delivery with DKIM signing and retries
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
struct Cli {
    /// Configuration file, used when `COURIER_CONFIG` is not set
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver queued mail until interrupted
    Run,
    /// Sign, store and queue a composed message
    Submit {
        /// RFC 5322 message file
        file: PathBuf,

        /// Higher is delivered sooner
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },
    /// Re-queue failed and dead-lettered items
    Retry {
        /// Only this queue item
        #[arg(long)]
        id: Option<QueueItemId>,
    },
    /// Delete finished items older than the given ages
    Purge {
        #[arg(long, default_value_t = 7)]
        completed_days: u64,

        #[arg(long, default_value_t = 30)]
        failed_days: u64,
    },
    /// List queue items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<QueueStatus>,
    },
    /// Show item counts per status
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let controller = Courier::load(cli.config.as_deref())?.init()?;

    match cli.command {
        Commands::Run => controller.run().await,
        Commands::Submit { file, priority } => cmd_submit(&controller, &file, priority).await,
        Commands::Retry { id } => {
            let requeued = controller.manager().retry_failed(id.as_ref()).await?;
            println!("Re-queued {requeued} item(s)");
            Ok(())
        }
        Commands::Purge {
            completed_days,
            failed_days,
        } => {
            let now = SystemTime::now();
            let purged = controller
                .manager()
                .purge_old(days_before(now, completed_days), days_before(now, failed_days))
                .await?;
            println!("Purged {purged} item(s)");
            Ok(())
        }
        Commands::List { status } => cmd_list(&controller, status).await,
        Commands::Stats => cmd_stats(&controller).await,
    }
}

fn days_before(now: SystemTime, days: u64) -> SystemTime {
    DAY.checked_mul(u32::try_from(days).unwrap_or(u32::MAX))
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

async fn cmd_submit(controller: &Controller, file: &Path, priority: i32) -> anyhow::Result<()> {
    let raw = tokio::fs::read(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;

    let (message_id, items) = controller.submit(&raw, priority).await?;

    println!("Message {message_id} queued for {} recipient(s)", items.len());
    for item in &items {
        println!("  {}  {}", item.id, item.recipient);
    }

    Ok(())
}

async fn cmd_list(controller: &Controller, status: Option<QueueStatus>) -> anyhow::Result<()> {
    let items = controller.manager().list(status).await?;

    if items.is_empty() {
        println!("No queue items");
        return Ok(());
    }

    println!(
        "{:<26}  {:<11}  {:>8}  {:<20}  {:<30}  {}",
        "ID", "STATUS", "ATTEMPTS", "NEXT ATTEMPT", "RECIPIENT", "ERROR"
    );
    for item in &items {
        print_item(item);
    }
    println!("\n{} item(s)", items.len());

    Ok(())
}

fn print_item(item: &QueueItem) {
    let next = item.next_attempt_at.map_or_else(|| "-".to_string(), format_time);

    println!(
        "{:<26}  {:<11}  {:>8}  {:<20}  {:<30}  {}",
        item.id.to_string(),
        item.status.as_str(),
        format!("{}/{}", item.attempts, item.max_attempts),
        next,
        item.recipient,
        item.error_message.as_deref().unwrap_or("")
    );
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

async fn cmd_stats(controller: &Controller) -> anyhow::Result<()> {
    let stats = controller.manager().stats().await?;

    println!("=== Queue Statistics ===\n");
    for status in QueueStatus::ALL {
        println!("  {:<12} {}", format!("{status}:"), stats.count(status));
    }
    println!("\n  {:<12} {}", "total:", stats.total());

    Ok(())
}
