//! Build context acquisition.
//!
//! A context descriptor is a local directory, a local tar archive, a git
//! repository or a remote archive URL. Whatever the kind, the context ends up
//! materialized under the destination directory and the source itself is
//! never written to.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use super::archive;
use super::deadline::Deadline;
use crate::error::{Result, ScanError};
use crate::procmanager::ProcessExecutor;

/// Where a build context comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    Local(PathBuf),
    LocalArchive(PathBuf),
    Git {
        url: String,
        reference: Option<String>,
        subdir: Option<String>,
    },
    RemoteArchive(String),
}

impl ContextSource {
    /// Classifies a context descriptor.
    ///
    /// Git URLs may carry a `#ref:subdir` fragment. Local paths must exist.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(unavailable(descriptor, "no context given"));
        }

        if is_git_url(descriptor) {
            let (url, fragment) = match descriptor.split_once('#') {
                Some((url, fragment)) => (url, Some(fragment)),
                None => (descriptor, None),
            };
            let url = if url.starts_with("github.com/") {
                format!("https://{url}")
            } else {
                url.to_string()
            };
            let (reference, subdir) = match fragment {
                Some(fragment) => match fragment.split_once(':') {
                    Some((r, dir)) => (non_empty(r), non_empty(dir)),
                    None => (non_empty(fragment), None),
                },
                None => (None, None),
            };
            return Ok(ContextSource::Git {
                url,
                reference,
                subdir,
            });
        }

        if descriptor.starts_with("http://") || descriptor.starts_with("https://") {
            return Ok(ContextSource::RemoteArchive(descriptor.to_string()));
        }

        let path = PathBuf::from(descriptor);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(ContextSource::Local(path)),
            Ok(meta) if meta.is_file() && archive::looks_like_archive(descriptor) => {
                Ok(ContextSource::LocalArchive(path))
            }
            Ok(_) => Err(unavailable(descriptor, "not a directory or tar archive")),
            Err(e) => Err(unavailable(descriptor, e.to_string())),
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextSource::Local(path) | ContextSource::LocalArchive(path) => {
                write!(f, "{}", path.display())
            }
            ContextSource::Git {
                url,
                reference,
                subdir,
            } => {
                write!(f, "{url}")?;
                match (reference, subdir) {
                    (None, None) => Ok(()),
                    (r, None) => write!(f, "#{}", r.as_deref().unwrap_or_default()),
                    (r, Some(dir)) => write!(f, "#{}:{dir}", r.as_deref().unwrap_or_default()),
                }
            }
            ContextSource::RemoteArchive(url) => write!(f, "{url}"),
        }
    }
}

fn is_git_url(descriptor: &str) -> bool {
    if descriptor.starts_with("git://")
        || descriptor.starts_with("git@")
        || descriptor.starts_with("github.com/")
    {
        return true;
    }
    let url = descriptor.split('#').next().unwrap_or(descriptor);
    (url.starts_with("http://") || url.starts_with("https://")) && url.ends_with(".git")
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// What to do when the destination already has content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DestinationPolicy {
    /// Refuse to touch a non-empty destination
    #[default]
    Fail,
    /// Clear the destination first
    Overwrite,
}

/// Materializes a [`ContextSource`] under a destination directory.
pub struct ContextAcquirer<'a> {
    executor: &'a dyn ProcessExecutor,
    http: reqwest::Client,
    destination: &'a Path,
    policy: DestinationPolicy,
}

impl<'a> ContextAcquirer<'a> {
    pub fn new(executor: &'a dyn ProcessExecutor, destination: &'a Path, policy: DestinationPolicy) -> Self {
        Self {
            executor,
            http: reqwest::Client::new(),
            destination,
            policy,
        }
    }

    /// Uses `client` for remote archives instead of a default one.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Fetches or copies the context and returns its root directory.
    pub async fn acquire(&self, source: &ContextSource, deadline: Deadline) -> Result<PathBuf> {
        let context = source.to_string();
        info!(context = %context, dest = %self.destination.display(), "Acquiring build context");

        if let ContextSource::Git {
            reference, subdir, ..
        } = source
        {
            if let Some(reference) = reference {
                check_reference(&context, reference)?;
            }
            if let Some(dir) = subdir {
                check_subdir(&context, dir)?;
            }
        }

        {
            let source = source.clone();
            let dest = self.destination.to_path_buf();
            let policy = self.policy;
            let context = context.clone();
            deadline
                .blocking("preparing the destination", move || {
                    prepare_destination(&source, &dest, policy, &context)
                })
                .await?;
        }

        match source {
            ContextSource::Local(path) => {
                let src = path.clone();
                let dest = self.destination.to_path_buf();
                let context = context.clone();
                let copied = deadline
                    .blocking("copying the build context", move || {
                        copy_context(&src, &dest).map_err(|e| invalid(&context, e.to_string()))
                    })
                    .await?;
                debug!(files = copied, "Copied local context");
                Ok(self.destination.to_path_buf())
            }
            ContextSource::LocalArchive(path) => {
                let src = path.clone();
                let dest = self.destination.to_path_buf();
                let context = context.clone();
                deadline
                    .blocking("extracting the build context", move || {
                        archive::extract_file(&src, &dest).map_err(|e| invalid(&context, format!("{e:#}")))
                    })
                    .await?;
                Ok(self.destination.to_path_buf())
            }
            ContextSource::RemoteArchive(url) => {
                let bytes = deadline
                    .run("downloading the build context", download(&self.http, url))
                    .await?;
                let dest = self.destination.to_path_buf();
                deadline
                    .blocking("extracting the build context", move || {
                        archive::extract_bytes(&bytes, &dest).map_err(|e| invalid(&context, format!("{e:#}")))
                    })
                    .await?;
                Ok(self.destination.to_path_buf())
            }
            ContextSource::Git {
                url,
                reference,
                subdir,
            } => {
                let dest = self.destination.to_string_lossy().into_owned();
                let clone_args = vec![
                    "clone".to_string(),
                    "--recurse-submodules".to_string(),
                    url.clone(),
                    dest,
                ];
                self.git(&context, clone_args, None, deadline).await?;

                if let Some(reference) = reference {
                    let checkout_args = vec!["checkout".to_string(), reference.clone()];
                    self.git(&context, checkout_args, Some(self.destination), deadline)
                        .await?;
                }

                Ok(match subdir {
                    Some(dir) => self.destination.join(dir),
                    None => self.destination.to_path_buf(),
                })
            }
        }
    }

    async fn git(&self, context: &str, args: Vec<String>, cwd: Option<&Path>, deadline: Deadline) -> Result<()> {
        let output = deadline
            .run("fetching the git context", self.executor.run("git", &args, cwd))
            .await
            .map_err(|e| match e {
                ScanError::ProcessExecutionFailed { stderr, .. } => unavailable(context, stderr),
                other => other,
            })?;

        if !output.success() {
            return Err(unavailable(
                context,
                format!(
                    "git {} exited with code {}: {}",
                    args[0],
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    debug!(url, "Downloading context archive");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| unavailable(url, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(unavailable(url, format!("HTTP {status}")));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| unavailable(url, e.to_string()))?;
    Ok(bytes.to_vec())
}

/// A subdirectory fragment must stay inside the checkout.
fn check_subdir(context: &str, dir: &str) -> Result<()> {
    if !stays_inside(Path::new(dir)) {
        return Err(invalid(context, format!("subdirectory '{dir}' escapes the repository")));
    }
    Ok(())
}

/// A ref is passed to `git checkout` as an argument, so it must not look
/// like an option.
fn check_reference(context: &str, reference: &str) -> Result<()> {
    if reference.starts_with('-') {
        return Err(invalid(context, format!("git ref '{reference}' must not start with '-'")));
    }
    Ok(())
}

/// True for a relative path with no `..`, root or prefix components.
pub(crate) fn stays_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Ensures `dest` exists and is empty, applying `policy` when it is not.
fn prepare_destination(source: &ContextSource, dest: &Path, policy: DestinationPolicy, context: &str) -> Result<()> {
    if let ContextSource::Local(src) | ContextSource::LocalArchive(src) = source
        && let (Ok(src), Ok(dst)) = (src.canonicalize(), dest.canonicalize())
        && src.starts_with(&dst)
    {
        return Err(invalid(
            context,
            format!("destination {} contains the context itself", dest.display()),
        ));
    }

    let io_err = |e: io::Error| unavailable(context, format!("destination {}: {e}", dest.display()));

    match fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                return Ok(());
            }
            match policy {
                DestinationPolicy::Fail => Err(invalid(
                    context,
                    format!("destination {} is not empty", dest.display()),
                )),
                DestinationPolicy::Overwrite => {
                    debug!(dest = %dest.display(), "Clearing destination");
                    fs::remove_dir_all(dest).map_err(io_err)?;
                    fs::create_dir_all(dest).map_err(io_err)
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dest).map_err(io_err),
        Err(e) => Err(io_err(e)),
    }
}

/// Copies a local context into `dest`, skipping `dest` if it lives inside
/// the context.
fn copy_context(src: &Path, dest: &Path) -> io::Result<usize> {
    let src = src.canonicalize()?;
    let dest = dest.canonicalize()?;
    copy_tree(&src, &dest, &dest)
}

fn copy_tree(src: &Path, dst: &Path, skip: &Path) -> io::Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        if from == skip {
            continue;
        }
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            fs::create_dir_all(&to)?;
            copied += copy_tree(&from, &to, skip)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
            copied += 1;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

fn unavailable(context: &str, message: impl Into<String>) -> ScanError {
    ScanError::ContextUnavailable {
        context: context.to_string(),
        message: message.into(),
    }
}

fn invalid(context: &str, message: impl Into<String>) -> ScanError {
    ScanError::ContextInvalid {
        context: context.to_string(),
        message: message.into(),
    }
}
