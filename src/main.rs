mod cmd;
mod config;
mod dockerfile;
mod error;
mod procmanager;
mod progress;
mod scan;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use tracing_subscriber::EnvFilter;

use crate::error::ScanError;

#[derive(Parser)]
#[command(name = "stagescan")]
#[command(about = "Find the container images a Dockerfile build depends on")]
#[command(version)]
struct Cli {
    /// Output as JSON (optionally to a file, as --json=FILE)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "-", require_equals = true)]
    json: Option<String>,

    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a build context and list its build-time and runtime images
    Scan(cmd::scan::ScanArgs),
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "stagescan=debug,warn" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match &cli.command {
        Commands::Scan(args) => cmd::scan::run(args, cli.json.as_deref(), cli.debug).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let code = e
                .downcast_ref::<ScanError>()
                .map_or(1, |scan_error| scan_error.kind().exit_code());
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
