//! `poetry.lock` parsing
//!
//! Turns the `[[package]]` tables of a Poetry lockfile into
//! [`DependencyRecord`]s. Only this one file is read.

use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::record::{
    check_unique, normalize_name, DependencyRecord, LockSet, LockedFile, PlatformTag, Source,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Default lockfile name inside a project
pub const LOCKFILE_NAME: &str = "poetry.lock";

/// Options controlling which packages are read
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Keep packages that only belong to non-main groups
    pub include_dev: bool,
}

#[derive(Debug, Deserialize)]
struct RawLockfile {
    #[serde(default)]
    package: Vec<RawPackage>,
    #[serde(default)]
    metadata: RawMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    /// Pre-1.1 lockfiles keep artifact hashes here, keyed by package name
    #[serde(default)]
    files: BTreeMap<String, Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    source: Option<RawSource>,
    category: Option<String>,
    groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFile {
    file: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    reference: Option<String>,
    resolved_reference: Option<String>,
}

/// Read a lockfile and bind it to `platform`
pub fn read_lockset(
    path: &Path,
    platform: PlatformTag,
    options: &ReadOptions,
) -> SatchelResult<LockSet> {
    let records = read_lockfile(path, options)?;
    LockSet::new(records, platform)
}

/// Read the dependency records of a lockfile
pub fn read_lockfile(path: &Path, options: &ReadOptions) -> SatchelResult<Vec<DependencyRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SatchelError::MissingLockfile(path.to_path_buf()))
        }
        Err(e) => {
            return Err(SatchelError::io(
                format!("reading lockfile {}", path.display()),
                e,
            ))
        }
    };

    parse_lockfile(&content, path, options)
}

/// Parse lockfile content; `path` is only used in error messages
pub fn parse_lockfile(
    content: &str,
    path: &Path,
    options: &ReadOptions,
) -> SatchelResult<Vec<DependencyRecord>> {
    let raw: RawLockfile =
        toml::from_str(content).map_err(|e| SatchelError::malformed(path, e.to_string()))?;

    let mut records = Vec::with_capacity(raw.package.len());
    for (index, package) in raw.package.into_iter().enumerate() {
        let name = package
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| SatchelError::malformed(path, format!("package #{}: missing 'name'", index + 1)))?;
        let name = normalize_name(name);

        let version = package
            .version
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SatchelError::malformed(path, format!("package '{}': missing 'version'", name)))?;

        if !options.include_dev && !is_main_group(&package) {
            debug!("Skipping non-main package {}=={}", name, version);
            continue;
        }

        let source = match package.source {
            Some(ref raw_source) => parse_source(raw_source)
                .map_err(|reason| SatchelError::malformed(path, format!("package '{}': {}", name, reason)))?,
            None => Source::Pypi,
        };

        let raw_files = if package.files.is_empty() {
            raw.metadata
                .files
                .iter()
                .find(|(key, _)| normalize_name(key) == name)
                .map(|(_, files)| files.clone())
                .unwrap_or_default()
        } else {
            package.files.clone()
        };

        let mut files = Vec::with_capacity(raw_files.len());
        for file in raw_files {
            if !file.hash.contains(':') {
                return Err(SatchelError::malformed(
                    path,
                    format!("package '{}': file '{}' has hash without algorithm", name, file.file),
                ));
            }
            files.push(LockedFile {
                file: file.file,
                hash: file.hash,
            });
        }

        let content_hash = content_hash(&source, &files).ok_or_else(|| {
            SatchelError::malformed(path, format!("package '{}': no integrity hash ('files' is empty)", name))
        })?;

        records.push(DependencyRecord {
            name,
            version,
            source,
            content_hash,
            files,
        });
    }

    check_unique(&records, &path.display().to_string())?;
    debug!("Read {} locked packages from {}", records.len(), path.display());
    Ok(records)
}

fn is_main_group(package: &RawPackage) -> bool {
    match (&package.groups, &package.category) {
        (Some(groups), _) => groups.iter().any(|g| g == "main"),
        (None, Some(category)) => category == "main",
        (None, None) => true,
    }
}

fn parse_source(raw: &RawSource) -> Result<Source, String> {
    let source = match raw.kind.as_str() {
        "legacy" => Source::Legacy {
            url: raw.url.clone(),
            reference: raw.reference.clone(),
        },
        "url" => Source::Url {
            url: raw.url.clone(),
        },
        "git" => Source::Git {
            url: raw.url.clone(),
            reference: raw.reference.clone(),
            resolved: raw.resolved_reference.clone(),
        },
        "file" => Source::File {
            path: raw.url.clone(),
        },
        "directory" => Source::Directory {
            path: raw.url.clone(),
        },
        other => return Err(format!("unsupported source type '{}'", other)),
    };
    Ok(source)
}

/// Derive a single digest for a package
///
/// One artifact keeps its own hash; several are folded into a SHA-256 over
/// the sorted `file hash` lines. Git checkouts fall back to the commit.
fn content_hash(source: &Source, files: &[LockedFile]) -> Option<String> {
    match files {
        [] => match source {
            Source::Git {
                resolved: Some(commit),
                ..
            } => Some(format!("git:{}", commit)),
            _ => None,
        },
        [single] => Some(single.hash.clone()),
        many => {
            let mut lines: Vec<String> = many
                .iter()
                .map(|f| format!("{} {}\n", f.file, f.hash))
                .collect();
            lines.sort();
            let mut hasher = Sha256::new();
            for line in &lines {
                hasher.update(line.as_bytes());
            }
            Some(format!("sha256:{}", hex::encode(hasher.finalize())))
        }
    }
}
