//! The scan pipeline: acquire the context, locate and parse the Dockerfile,
//! resolve build arguments and stages, then classify every external image.

pub mod archive;
pub mod context;
pub mod deadline;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dockerfile::{self, ArgTable, ImageReference, OverlapPolicy, StageGraph};
use crate::error::{Result, ScanError};
use crate::procmanager::{ProcessExecutor, command_line};

pub use context::{ContextSource, DestinationPolicy};
pub use deadline::Deadline;

/// What to scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Local path, archive or git URL
    pub context: String,
    /// Dockerfile path relative to the context root
    pub definition: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
    /// Tags the build would produce; echoed back in the result
    pub tags: Vec<String>,
}

/// How the scanner behaves, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub destination: PathBuf,
    pub destination_policy: DestinationPolicy,
    /// Ask the builder to check the Dockerfile after a successful scan
    pub validate: bool,
    pub builder: String,
    pub overlap: OverlapPolicy,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("temp"),
            destination_policy: DestinationPolicy::Fail,
            validate: false,
            builder: "docker".to_string(),
            overlap: OverlapPolicy::RuntimeWins,
        }
    }
}

/// Result of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDependencies {
    pub build_time_images: Vec<ImageReference>,
    pub runtime_images: Vec<ImageReference>,
    pub context_source: String,
    pub definition_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_images: Vec<String>,
}

pub struct Scanner {
    executor: Arc<dyn ProcessExecutor>,
    http: reqwest::Client,
    settings: ScannerSettings,
}

impl Scanner {
    pub fn new(executor: Arc<dyn ProcessExecutor>, settings: ScannerSettings) -> Self {
        Self {
            executor,
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Uses `client` to download remote archive contexts.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Runs one scan to completion or to the first error.
    ///
    /// Everything happens before `deadline`. Files already written to the
    /// destination are left behind on failure.
    pub async fn scan(&self, request: &ScanRequest, deadline: Deadline) -> Result<ImageDependencies> {
        deadline.check("starting the scan")?;
        debug!(remaining = ?deadline.remaining(), "Starting scan");

        let source = ContextSource::parse(&request.context)?;
        let root = context::ContextAcquirer::new(
            self.executor.as_ref(),
            &self.settings.destination,
            self.settings.destination_policy,
        )
        .with_http_client(self.http.clone())
        .acquire(&source, deadline)
        .await?;

        deadline.check("reading the build definition")?;
        if !context::stays_inside(&request.definition) {
            return Err(ScanError::DefinitionNotFound {
                path: request.definition.clone(),
            });
        }
        let definition_path = root.join(&request.definition);
        if !definition_path.is_file() {
            return Err(ScanError::DefinitionNotFound {
                path: definition_path,
            });
        }
        let content = deadline
            .run("reading the build definition", async {
                tokio::fs::read_to_string(&definition_path)
                    .await
                    .map_err(|e| ScanError::ContextInvalid {
                        context: source.to_string(),
                        message: format!("cannot read {}: {e}", definition_path.display()),
                    })
            })
            .await?;

        deadline.check("parsing the build definition")?;
        let definition = dockerfile::parse(&content)?;
        let args = ArgTable::resolve(&definition.instructions, &request.build_args);
        let unused = args.unused_overrides();
        if !unused.is_empty() {
            warn!(args = ?unused, "Build arguments were not consumed by any ARG");
        }
        debug!(args = ?args.effective(), "Resolved build arguments");

        deadline.check("resolving stages")?;
        let graph = StageGraph::build(&definition, &args)?;
        let dependencies = graph.dependencies(request.target.as_deref(), self.settings.overlap)?;
        info!(
            stages = graph.stages.len(),
            build_time = dependencies.build_time.len(),
            runtime = dependencies.runtime.len(),
            "Scanned build definition"
        );

        if self.settings.validate {
            self.validate(&root, &definition_path, request, deadline).await?;
        }

        Ok(ImageDependencies {
            build_time_images: dependencies.build_time,
            runtime_images: dependencies.runtime,
            context_source: source.to_string(),
            definition_path: request.definition.to_string_lossy().into_owned(),
            output_images: request.tags.clone(),
        })
    }

    /// Has the builder lint the Dockerfile without building it.
    async fn validate(
        &self,
        root: &Path,
        definition: &Path,
        request: &ScanRequest,
        deadline: Deadline,
    ) -> Result<()> {
        let args = validation_args(root, definition, request);
        let output = deadline
            .run(
                "validating the build definition",
                self.executor.run(&self.settings.builder, &args, Some(root)),
            )
            .await?;

        if !output.success() {
            return Err(ScanError::ProcessExecutionFailed {
                command: command_line(&self.settings.builder, &args),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

fn validation_args(root: &Path, definition: &Path, request: &ScanRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "buildx".into(),
        "build".into(),
        "--check".into(),
        "-f".into(),
        definition.to_string_lossy().into_owned(),
    ];
    if let Some(target) = &request.target {
        args.push("--target".into());
        args.push(target.clone());
    }
    for (key, value) in &request.build_args {
        args.push("--build-arg".into());
        args.push(format!("{key}={value}"));
    }
    args.push(root.to_string_lossy().into_owned());
    args
}
