use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cmd::scan::ScanArgs;
use crate::dockerfile::OverlapPolicy;
use crate::dockerfile::parser::is_valid_arg_name;
use crate::scan::{DestinationPolicy, ScanRequest, ScannerSettings};

/// Validated settings for one `scan` invocation.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub request: ScanRequest,
    pub settings: ScannerSettings,
    pub timeout: Duration,
    pub dry_run: bool,
    pub cleanup: bool,
}

impl ScanConfig {
    pub fn from_args(args: &ScanArgs) -> Result<Self> {
        Self::from_args_with_env(args, |key| std::env::var(key).ok())
    }

    fn from_args_with_env(args: &ScanArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if args.timeout == 0 {
            bail!("--timeout must be at least 1 second");
        }
        if args.file.as_os_str().is_empty() {
            bail!("--file must not be empty");
        }

        let tags = args
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(Self {
            request: ScanRequest {
                context: args.context.clone(),
                definition: args.file.clone(),
                build_args: parse_build_args(&args.build_args, env)?,
                target: args.target.clone(),
                tags,
            },
            settings: ScannerSettings {
                destination: args.destination.clone(),
                destination_policy: if args.overwrite {
                    DestinationPolicy::Overwrite
                } else {
                    DestinationPolicy::Fail
                },
                validate: args.validate,
                builder: args.builder.clone(),
                overlap: if args.report_overlap {
                    OverlapPolicy::ReportBoth
                } else {
                    OverlapPolicy::RuntimeWins
                },
            },
            timeout: Duration::from_secs(args.timeout),
            dry_run: args.dry_run,
            cleanup: args.cleanup,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.settings.destination
    }
}

/// Parses `KEY=VALUE` pairs. A bare `KEY` takes its value from the
/// environment and is dropped when the variable is unset. Later pairs win.
fn parse_build_args(raw: &[String], env: impl Fn(&str) -> Option<String>) -> Result<BTreeMap<String, String>> {
    let mut args = BTreeMap::new();
    for pair in raw {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.to_string())),
            None => (pair.trim(), None),
        };
        if key.is_empty() {
            bail!("invalid --build-arg '{pair}': empty name");
        }
        if !is_valid_arg_name(key) {
            bail!("invalid --build-arg '{pair}': bad name '{key}'");
        }
        match value.or_else(|| env(key)) {
            Some(value) => {
                args.insert(key.to_string(), value);
            }
            None => tracing::debug!(key, "Build argument not set in the environment, ignoring"),
        }
    }
    Ok(args)
}
