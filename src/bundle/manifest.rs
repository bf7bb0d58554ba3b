//! Bundle manifest
//!
//! Stored uncompressed as the last archive entry so the bootstrap reads
//! the fingerprint without inflating the payload.

use crate::lockfile::{DependencyRecord, Fingerprint, LockSet, PlatformTag};
use crate::project::EntryPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest format version
pub const BUNDLE_FORMAT: u32 = 2;

/// Timestamp layout; fixed width so rebuilds only differ inside this field
const BUILT_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Everything the bootstrap needs to know about a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Manifest format version
    pub format: u32,
    /// Bundle name (the wrapped script)
    pub name: String,
    /// Project distribution name
    pub project: String,
    /// Wrapped entry point
    pub entry_point: EntryPoint,
    /// Directory inside the payload that goes on `sys.path`
    pub source_root: String,
    /// Target platform
    pub platform: PlatformTag,
    /// Fingerprint of `records` + `platform`
    pub fingerprint: Fingerprint,
    /// Digest of the archived project entries (see `PayloadDigest`)
    pub source_digest: String,
    /// Interpreter constraint from the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    /// Locked dependencies, in lockfile order
    pub records: Vec<DependencyRecord>,
    /// Version of satchel that built the bundle
    pub satchel_version: String,
    /// Build time (UTC)
    pub built_at: String,
}

impl BundleManifest {
    /// Render a build timestamp
    pub fn format_built_at(ts: DateTime<Utc>) -> String {
        ts.format(BUILT_AT_FORMAT).to_string()
    }

    /// Rebuild the lockset and check it against the stored fingerprint
    pub fn lockset(&self) -> Result<LockSet, String> {
        let lockset = LockSet::new(self.records.clone(), self.platform.clone())
            .map_err(|e| e.to_string())?;
        if lockset.fingerprint() != &self.fingerprint {
            return Err(format!(
                "fingerprint mismatch (manifest {}, records {})",
                self.fingerprint.short(),
                lockset.fingerprint().short()
            ));
        }
        Ok(lockset)
    }
}
