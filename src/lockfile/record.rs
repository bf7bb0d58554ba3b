//! Locked dependency records and the lockset fingerprint

use crate::error::{SatchelError, SatchelResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Normalize a distribution name (PEP 503)
///
/// Lowercases and collapses runs of `-`, `_` and `.` into a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.extend(ch.to_lowercase());
            in_separator = false;
        }
    }
    normalized
}

/// Where a locked package is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    /// The default package index
    Pypi,
    /// A secondary package index
    Legacy {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// A direct archive URL
    Url { url: String },
    /// A git repository pinned to a commit
    Git {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved: Option<String>,
    },
    /// A local archive
    File { path: String },
    /// A local source directory
    Directory { path: String },
}

impl Source {
    /// Short source type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pypi => "pypi",
            Self::Legacy { .. } => "legacy",
            Self::Url { .. } => "url",
            Self::Git { .. } => "git",
            Self::File { .. } => "file",
            Self::Directory { .. } => "directory",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pypi => write!(f, "pypi"),
            Self::Legacy { url, .. } => write!(f, "index+{}", url),
            Self::Url { url } => write!(f, "url+{}", url),
            Self::Git {
                url,
                reference,
                resolved,
            } => {
                let rev = resolved.as_deref().or(reference.as_deref()).unwrap_or("HEAD");
                write!(f, "git+{}@{}", url, rev)
            }
            Self::File { path } => write!(f, "file+{}", path),
            Self::Directory { path } => write!(f, "dir+{}", path),
        }
    }
}

/// One artifact listed for a package, with its integrity hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedFile {
    /// Artifact file name (wheel or sdist)
    pub file: String,
    /// Hash in `algorithm:hex` form
    pub hash: String,
}

/// A single resolved dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Normalized distribution name
    pub name: String,
    /// Exact locked version
    pub version: String,
    /// Where the package comes from
    pub source: Source,
    /// Integrity digest covering every locked artifact
    pub content_hash: String,
    /// Individual artifacts and hashes, passed on to the installer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<LockedFile>,
}

impl DependencyRecord {
    /// Create a record for a package from the default index
    pub fn new(name: &str, version: &str, content_hash: &str) -> Self {
        Self {
            name: normalize_name(name),
            version: version.to_string(),
            source: Source::Pypi,
            content_hash: content_hash.to_string(),
            files: vec![],
        }
    }

    /// Directory name this record is installed under
    pub fn dir_name(&self) -> &str {
        &self.name
    }

    /// Canonical serialization used for fingerprinting
    fn canonical_line(&self) -> String {
        format!(
            "{}\0{}\0{}\0{}\n",
            self.name, self.version, self.source, self.content_hash
        )
    }
}

impl fmt::Display for DependencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

/// Target interpreter identifier (implementation, version, machine, OS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformTag(String);

impl PlatformTag {
    /// Wrap a platform string
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable digest of a dependency set and its target platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of `records` for `platform`
    ///
    /// Records are sorted by name first, so input order never matters.
    pub fn compute(records: &[DependencyRecord], platform: &PlatformTag) -> Self {
        let mut sorted: Vec<&DependencyRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = Sha256::new();
        for record in sorted {
            hasher.update(record.canonical_line().as_bytes());
        }
        hasher.update(b"platform\0");
        hasher.update(platform.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Full hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, duplicate-free dependency set bound to one platform
#[derive(Debug, Clone)]
pub struct LockSet {
    records: Vec<DependencyRecord>,
    platform: PlatformTag,
    fingerprint: Fingerprint,
}

impl LockSet {
    /// Build a lockset, rejecting duplicate names
    pub fn new(records: Vec<DependencyRecord>, platform: PlatformTag) -> SatchelResult<Self> {
        check_unique(&records, "lockset")?;
        let fingerprint = Fingerprint::compute(&records, &platform);
        Ok(Self {
            records,
            platform,
            fingerprint,
        })
    }

    /// Records in lockfile order
    pub fn records(&self) -> &[DependencyRecord] {
        &self.records
    }

    /// Target platform
    pub fn platform(&self) -> &PlatformTag {
        &self.platform
    }

    /// Aggregate fingerprint
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the lockset has no dependencies
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Fail with `DuplicateDependency` if two records share a name
pub(crate) fn check_unique(records: &[DependencyRecord], origin: &str) -> SatchelResult<()> {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.name.as_str()) {
            return Err(SatchelError::DuplicateDependency {
                name: record.name.clone(),
                origin: origin.to_string(),
            });
        }
    }
    Ok(())
}
