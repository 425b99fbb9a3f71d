use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use crossterm::style::Stylize;
use tracing::warn;

use crate::config::ScanConfig;
use crate::procmanager;
use crate::progress::Spinner;
use crate::scan::{Deadline, ImageDependencies, Scanner};

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Dockerfile path, relative to the context root
    #[arg(short = 'f', long, default_value = "Dockerfile")]
    pub file: PathBuf,

    /// Image tag the build would produce (repeatable)
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Build argument as KEY=VALUE, or KEY to read it from the environment
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Stage to scan for (defaults to the last stage)
    #[arg(long)]
    pub target: Option<String>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Directory the context is materialized in
    #[arg(long, default_value = "temp")]
    pub destination: PathBuf,

    /// Clear the destination if it is not empty
    #[arg(long)]
    pub overwrite: bool,

    /// Log external commands instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Remove the destination afterwards
    #[arg(long)]
    pub cleanup: bool,

    /// Have the builder check the Dockerfile after scanning
    #[arg(long)]
    pub validate: bool,

    /// Builder binary used by --validate
    #[arg(long, default_value = "docker")]
    pub builder: String,

    /// List images used by the target stage as build-time too
    #[arg(long)]
    pub report_overlap: bool,

    /// Local directory, tar archive, git URL (with optional #ref:subdir) or archive URL
    pub context: String,
}

pub async fn run(args: &ScanArgs, json: Option<&str>, debug: bool) -> Result<()> {
    let config = ScanConfig::from_args(args)?;
    let scanner = Scanner::new(procmanager::new(config.dry_run), config.settings.clone());

    let destination = config.destination().to_path_buf();
    let removable = config.cleanup && is_absent_or_empty(&destination);
    if config.cleanup && !removable {
        warn!(dest = %destination.display(), "Destination already has content, it will not be cleaned up");
    }

    let spinner = Spinner::new(format!("Scanning {}...", config.request.context), debug);
    let result = scanner
        .scan(&config.request, Deadline::after(config.timeout))
        .await;

    if removable {
        cleanup(&destination);
    }

    let deps = match result {
        Ok(deps) => {
            spinner.finish(format!(
                "Found {} runtime and {} build-time images",
                deps.runtime_images.len(),
                deps.build_time_images.len()
            ));
            deps
        }
        Err(e) => {
            spinner.fail(format!("Scan of {} failed", config.request.context));
            return Err(e.into());
        }
    };

    print(&deps, json)
}

fn print(deps: &ImageDependencies, json: Option<&str>) -> Result<()> {
    if let Some(dest) = json {
        let output = serde_json::to_string_pretty(deps)?;
        if dest == "-" {
            println!("{output}");
        } else {
            fs::write(dest, &output).with_context(|| format!("Failed to write JSON to {dest}"))?;
            eprintln!("{} Wrote {dest}", "✔".green());
        }
        return Ok(());
    }

    println!("{} ({})", deps.context_source, deps.definition_path);
    for tag in &deps.output_images {
        println!("  tag: {tag}");
    }
    println!();
    println!("Runtime images:");
    for image in &deps.runtime_images {
        println!("  {image}");
    }
    println!();
    println!("Build-time images:");
    if deps.build_time_images.is_empty() {
        println!("  {}", "(none)".dim());
    }
    for image in &deps.build_time_images {
        println!("  {image}");
    }
    Ok(())
}

fn is_absent_or_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => !path.exists(),
    }
}

fn cleanup(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(path) {
        warn!(dest = %path.display(), error = %e, "Failed to clean up destination");
    }
}
