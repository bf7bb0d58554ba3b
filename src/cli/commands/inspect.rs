//! Inspect command - show what a bundle carries

use crate::bundle::{BundleManifest, BundleReader};
use crate::cache::{format_bytes, CacheManager, EntryState, EnvironmentKey, IndexState};
use crate::cli::args::{InspectArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::SatchelResult;
use crate::ui::{self, UiContext};
use serde::Serialize;
use std::path::PathBuf;

/// Cache state of a bundle's environment on this machine
#[derive(Debug, Clone, Serialize)]
struct CacheState {
    key: EnvironmentKey,
    path: PathBuf,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl CacheState {
    fn is_ready(&self) -> bool {
        self.state == "ready"
    }
}

#[derive(Serialize)]
struct InspectJson<'a> {
    path: &'a std::path::Path,
    stub_bytes: u64,
    manifest: &'a BundleManifest,
    cache: &'a CacheState,
}

/// Execute the inspect command
pub async fn execute(args: InspectArgs, config: &Config) -> SatchelResult<()> {
    let reader = BundleReader::open(&args.bundle)?;
    let manager = CacheManager::new(ConfigManager::cache_dir(config));
    let cache = cache_state(&manager, reader.manifest());

    if let Some(ref dest) = args.extract {
        reader.extract_payload(dest)?;
    }

    match args.format {
        OutputFormat::Json => {
            let json = InspectJson {
                path: reader.path(),
                stub_bytes: reader.stub_len(),
                manifest: reader.manifest(),
                cache: &cache,
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            println!("{}", reader.manifest().fingerprint);
        }
        OutputFormat::Table => print_summary(&reader, &cache, args.extract.as_ref()),
    }
    Ok(())
}

fn cache_state(manager: &CacheManager, manifest: &BundleManifest) -> CacheState {
    let key = EnvironmentKey::derive(&manifest.fingerprint, &manifest.source_digest);
    let path = manager.layout().entry_dir(&key);

    let (state, detail) = match manager.read_marker(&key) {
        EntryState::Ready(marker) if marker.fingerprint == manifest.fingerprint.as_str() => (
            "ready",
            Some(format!("published {}", marker.completed_at.format("%Y-%m-%d %H:%M"))),
        ),
        EntryState::Ready(_) => ("corrupt", Some("marker does not match bundle".to_string())),
        EntryState::Corrupt(reason) => ("corrupt", Some(reason)),
        EntryState::Absent => match manager.index().get(&key) {
            Ok(Some(record)) if record.state == IndexState::Failed => ("failed", record.error),
            _ => ("absent", Some("built on first run".to_string())),
        },
    };

    CacheState {
        key,
        path,
        state: state.to_string(),
        detail,
    }
}

fn print_summary(reader: &BundleReader, cache: &CacheState, extracted: Option<&PathBuf>) {
    let ctx = UiContext::detect();
    let manifest = reader.manifest();

    ui::section(&ctx, &format!("Bundle {}", reader.path().display()));
    ui::key_value(&ctx, "Name", &manifest.name);
    ui::key_value(&ctx, "Project", &manifest.project);
    ui::key_value(&ctx, "Entry point", &manifest.entry_point.to_string());
    if !manifest.source_root.is_empty() {
        ui::key_value(&ctx, "Source root", &manifest.source_root);
    }
    ui::key_value(&ctx, "Platform", manifest.platform.as_str());
    if let Some(ref requires) = manifest.requires_python {
        ui::key_value(&ctx, "Requires Python", requires);
    }
    ui::key_value(&ctx, "Fingerprint", manifest.fingerprint.as_str());
    ui::key_value(&ctx, "Source digest", &manifest.source_digest);
    ui::key_value(&ctx, "Stub", &format_bytes(reader.stub_len()));
    ui::key_value(
        &ctx,
        "Built",
        &format!("{} by satchel {}", manifest.built_at, manifest.satchel_version),
    );

    ui::section(&ctx, &format!("Dependencies ({})", manifest.records.len()));
    for record in &manifest.records {
        println!("  {:<32} {:<16} {}", record.name, record.version, record.source);
    }

    ui::section(&ctx, "Environment");
    ui::key_value(&ctx, "Key", cache.key.as_str());
    let state = match cache.detail {
        Some(ref detail) => format!("{} ({})", cache.state, detail),
        None => cache.state.clone(),
    };
    ui::key_value_status(&ctx, "State", &state, cache.is_ready());
    ui::key_value(&ctx, "Path", &cache.path.display().to_string());

    if let Some(dest) = extracted {
        println!();
        ui::step_ok_detail(&ctx, "Payload extracted", &dest.display().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BUNDLE_FORMAT;
    use crate::lockfile::{DependencyRecord, Fingerprint, PlatformTag};
    use crate::project::EntryPoint;
    use chrono::Utc;
    use tempfile::TempDir;

    fn manifest() -> BundleManifest {
        let records = vec![DependencyRecord::new("alpha", "1.0", "sha256:aa")];
        let platform = PlatformTag::new("cpython-3.11-x86_64-linux");
        BundleManifest {
            format: BUNDLE_FORMAT,
            name: "acme".to_string(),
            project: "acme".to_string(),
            entry_point: EntryPoint::parse("acme", "pkg.main:run").unwrap(),
            source_root: String::new(),
            fingerprint: Fingerprint::compute(&records, &platform),
            platform,
            source_digest: "d".repeat(64),
            requires_python: None,
            records,
            satchel_version: "0.0.0".to_string(),
            built_at: BundleManifest::format_built_at(Utc::now()),
        }
    }

    #[test]
    fn unbuilt_environment_is_absent() {
        let dir = TempDir::new().unwrap();
        let manager = CacheManager::new(dir.path());
        let state = cache_state(&manager, &manifest());
        assert_eq!(state.state, "absent");
        assert!(!state.is_ready());
        assert!(state.path.starts_with(dir.path()));
    }

    #[test]
    fn failed_build_is_reported() {
        let dir = TempDir::new().unwrap();
        let manager = CacheManager::new(dir.path());
        let manifest = manifest();
        let key = EnvironmentKey::derive(&manifest.fingerprint, &manifest.source_digest);
        manager
            .index()
            .mark_failed(&key, manifest.fingerprint.as_str(), &manager.layout().entry_dir(&key), "pip exploded")
            .unwrap();

        let state = cache_state(&manager, &manifest);
        assert_eq!(state.state, "failed");
        assert_eq!(state.detail.as_deref(), Some("pip exploded"));
    }
}
