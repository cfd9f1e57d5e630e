use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ftsync")]
#[command(about = "Friendly-title metafield sync for a storefront catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One linear pass over the catalog, writing changed titles.
    Sync {
        /// Read and compare only; log what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ftsync_pipeline=info".parse().unwrap())
                .add_directive("ftsync_shopify=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let summary = ftsync_pipeline::run_sync_once_from_env(dry_run).await?;
            println!(
                "sync complete: run_id={} scanned={} updated={} skipped={} failed={}",
                summary.run_id, summary.scanned, summary.updated, summary.skipped, summary.failed
            );
        }
    }

    Ok(())
}
