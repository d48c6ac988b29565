use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oppwatch")]
#[command(about = "Opportunity Watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one foreground ingest across all enabled sources.
    Sync,
    /// Serve the JSON API (and the scheduler, when enabled).
    Serve,
    /// Generate alert-queue entries for a user.
    Alerts {
        #[arg(long)]
        user: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List configured sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = oppwatch_sync::run_ingest_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} failed={} inserted={}",
                summary.run_id, summary.sources, summary.failed_sources, summary.inserted
            );
        }
        Commands::Serve => {
            oppwatch_web::serve_from_env().await?;
        }
        Commands::Alerts { user, limit } => {
            let ctx = oppwatch_sync::bootstrap(oppwatch_sync::IngestConfig::from_env()).await?;
            let generated = oppwatch_sync::generate_alerts(&ctx, user, limit).await?;
            println!("alerts generated for user {user}: {generated}");
        }
        Commands::Sources => {
            let ctx = oppwatch_sync::bootstrap(oppwatch_sync::IngestConfig::from_env()).await?;
            for source in ctx.store.all_sources().await? {
                let last = source
                    .last_fetched
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>3}  {:<24} {:<5} enabled={} last_fetched={} {}",
                    source.id, source.name, source.format, source.enabled, last, source.endpoint
                );
            }
        }
    }

    Ok(())
}
