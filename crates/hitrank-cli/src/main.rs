use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "hitrank")]
#[command(about = "Season hits ranker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API (default)
    Serve,
    /// Fetch the upstream batch once and insert unseen records
    Reconcile,
    /// Recompute competition ranks for one season
    Recalculate { year: i32 },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            hitrank_web::serve_from_env().await?;
        }
        Commands::Reconcile => {
            let summary = hitrank_sync::run_reconcile_once_from_env().await?;
            info!(run_id = %summary.run_id, "reconcile finished");
            println!(
                "reconcile complete: run_id={} fetched={} inserted={} skipped={} description_failures={} years={:?}",
                summary.run_id,
                summary.fetched,
                summary.inserted,
                summary.skipped,
                summary.description_failures,
                summary.years
            );
        }
        Commands::Recalculate { year } => {
            let update = hitrank_sync::run_recalculate_from_env(year).await?;
            println!(
                "recalculate complete: year={} examined={} changed={}",
                update.year, update.examined, update.changed
            );
        }
        Commands::Migrate => {
            hitrank_sync::run_migrations_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
