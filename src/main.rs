mod approval;
mod assistant;
mod cli;
mod commands;
mod config;
mod csv_io;
mod dashboard;
mod documents;
mod error;
mod extraction;
mod gateway;
mod heuristics;
mod matching;
mod models;
mod ocr;
mod payments;
mod pdf_text;
mod store;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // .env is optional
    dotenvy::dotenv().ok();

    // init tracing; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    if let Err(e) = commands::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
