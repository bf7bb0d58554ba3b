//! Package installer abstraction
//!
//! The cache manager installs one locked record at a time through this
//! trait. `PipInstaller` shells out to `python -m pip`; tests plug in fakes.

use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::{DependencyRecord, Source};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Max number of output lines to include in install error messages.
const INSTALL_ERROR_TAIL_LINES: usize = 50;

/// Installs a single locked dependency into a target directory
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install `record` (and only it) into `target`
    async fn install(&self, record: &DependencyRecord, target: &Path) -> SatchelResult<()>;

    /// Human-readable installer name for display
    fn installer_name(&self) -> &'static str;
}

/// Installs records with `python -m pip install --target`
#[derive(Debug, Clone)]
pub struct PipInstaller {
    python: String,
}

impl PipInstaller {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Interpreter used to run pip
    pub fn python(&self) -> &str {
        &self.python
    }

    fn pip_args(record: &DependencyRecord, requirements: &Path, target: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-m",
            "pip",
            "install",
            "--no-deps",
            "--no-input",
            "--disable-pip-version-check",
            "--no-warn-script-location",
            "--target",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(target.display().to_string());

        if !record.files.is_empty() {
            args.push("--require-hashes".to_string());
        }
        if let Source::Legacy { url, .. } = &record.source {
            args.push("--index-url".to_string());
            args.push(url.clone());
        }

        args.push("--requirement".to_string());
        args.push(requirements.display().to_string());
        args
    }
}

/// The requirements-file line pinning `record`
pub fn requirement_line(record: &DependencyRecord) -> String {
    let mut line = match &record.source {
        Source::Pypi | Source::Legacy { .. } => format!("{}=={}", record.name, record.version),
        Source::Url { url } => format!("{} @ {}", record.name, url),
        Source::Git {
            url,
            reference,
            resolved,
        } => match resolved.as_deref().or(reference.as_deref()) {
            Some(rev) => format!("{} @ git+{}@{}", record.name, url, rev),
            None => format!("{} @ git+{}", record.name, url),
        },
        Source::File { path } | Source::Directory { path } => path.clone(),
    };

    if matches!(record.source, Source::Pypi | Source::Legacy { .. } | Source::Url { .. }) {
        for file in &record.files {
            line.push_str(&format!(" --hash={}", file.hash));
        }
    }
    line
}

#[async_trait]
impl Installer for PipInstaller {
    async fn install(&self, record: &DependencyRecord, target: &Path) -> SatchelResult<()> {
        let failure = |reason: String| SatchelError::InstallerFailure {
            package: record.to_string(),
            reason,
        };

        let mut requirements = tempfile::Builder::new()
            .prefix("satchel-req-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| SatchelError::io("creating requirements file", e))?;
        writeln!(requirements, "{}", requirement_line(record))
            .and_then(|()| requirements.flush())
            .map_err(|e| SatchelError::io("writing requirements file", e))?;

        let args = Self::pip_args(record, requirements.path(), target);
        debug!("Running {} {}", self.python, args.join(" "));

        let output = Command::new(&self.python)
            .args(&args)
            .stdin(Stdio::null())
            .env("PIP_NO_INPUT", "1")
            .output()
            .await
            .map_err(|e| failure(format!("could not run {}: {}", self.python, e)))?;

        if !output.status.success() {
            let detail = build_error_output(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            );
            return Err(failure(format!(
                "pip exited with {}\n{}",
                output.status, detail
            )));
        }

        debug!("Installed {} into {}", record, target.display());
        Ok(())
    }

    fn installer_name(&self) -> &'static str {
        "pip"
    }
}

/// Extract the useful tail of installer output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `INSTALL_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > INSTALL_ERROR_TAIL_LINES {
        lines[total - INSTALL_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}
