use anyhow::Result;
use clap::{Parser, Subcommand};
use sigstack_ingest::IngestConfig;
use sigstack_store::Store;

#[derive(Debug, Parser)]
#[command(name = "signalstack")]
#[command(about = "SignalStack ingestion worker and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion worker (default). Loops until interrupted.
    Ingest {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
    /// Serve the read API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Create the item schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { once: false }) {
        Commands::Ingest { once: true } => {
            let summary = sigstack_ingest::run_once_from_env().await?;
            println!(
                "ingest complete: run_id={} upserted={} rejected={} sources_failed={}",
                summary.run_id, summary.upserted, summary.rejected, summary.sources_failed
            );
        }
        Commands::Ingest { once: false } => {
            tokio::select! {
                result = sigstack_ingest::run_from_env() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
        }
        Commands::Serve { port } => {
            let config = IngestConfig::from_env()?;
            let store = Store::connect(&config.database_url).await?;
            sigstack_web::serve(store, port).await?;
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env()?;
            let store = Store::connect(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("schema ready");
        }
    }

    Ok(())
}
