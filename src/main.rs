mod aggregate;
mod cli;
mod engine;
mod model;
mod orchestrator;
mod preflight;
mod registry;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use model::OverallStatus;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for --json output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,optisim=info")),
        )
        .init();

    let args = cli::Cli::parse();
    let is_silent = args.silent;

    match cli::run(args).await {
        Ok(OverallStatus::Completed | OverallStatus::InvisibleSolution) => Ok(()),
        Ok(_) => std::process::exit(2),
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
