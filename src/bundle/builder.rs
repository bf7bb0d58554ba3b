//! Bundle assembly
//!
//! Writes the stub followed by a ZIP holding the project payload and the
//! manifest. Dependencies are not downloaded here; the bundle only
//! carries their locked records.

use crate::bundle::format::{self, MANIFEST_ENTRY};
use crate::bundle::manifest::{BundleManifest, BUNDLE_FORMAT};
use crate::bundle::payload::{archive_project, Excludes};
use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::LockSet;
use crate::project::{EntryPoint, Project};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// A bundle written to disk
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    /// Output file
    pub path: PathBuf,
    /// Embedded manifest
    pub manifest: BundleManifest,
    /// Total size in bytes
    pub size: u64,
}

/// Builds a bundle for one entry point
pub struct BundleBuilder<'a> {
    project: &'a Project,
    lockset: &'a LockSet,
    entry_point: EntryPoint,
    stub: Option<Vec<u8>>,
    extra_excludes: Vec<String>,
    built_at: DateTime<Utc>,
}

impl<'a> BundleBuilder<'a> {
    /// Create a builder; the stub defaults to the running executable
    pub fn new(project: &'a Project, lockset: &'a LockSet, entry_point: EntryPoint) -> Self {
        Self {
            project,
            lockset,
            entry_point,
            stub: None,
            extra_excludes: vec![],
            built_at: Utc::now(),
        }
    }

    /// Use explicit stub bytes
    pub fn stub(mut self, stub: Vec<u8>) -> Self {
        self.stub = Some(stub);
        self
    }

    /// Additional payload exclusions (names or `*.ext`)
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_excludes.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Override the recorded build time
    pub fn built_at(mut self, built_at: DateTime<Utc>) -> Self {
        self.built_at = built_at;
        self
    }

    /// Write the bundle to `output`
    ///
    /// The file appears atomically: it is assembled under a temporary name
    /// in the same directory and renamed into place.
    pub fn build(&self, output: &Path) -> SatchelResult<BuiltBundle> {
        let excludes = Excludes::new(&self.extra_excludes).path(output.to_path_buf());
        let (bytes, manifest) = self.render_with(&excludes)?;

        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| SatchelError::io(format!("creating output directory {}", dir.display()), e))?;

        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.name.clone());
        let tmp = dir.join(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4().simple()));

        let result = write_executable(&tmp, &bytes).and_then(|()| {
            fs::rename(&tmp, output).map_err(|e| {
                SatchelError::io(
                    format!("moving bundle into place ({} -> {})", tmp.display(), output.display()),
                    e,
                )
            })
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        info!(
            "Built {} ({} dependencies, fingerprint {})",
            output.display(),
            manifest.records.len(),
            manifest.fingerprint.short()
        );

        Ok(BuiltBundle {
            path: output.to_path_buf(),
            manifest,
            size: bytes.len() as u64,
        })
    }

    /// Assemble the bundle bytes in memory
    pub fn render(&self) -> SatchelResult<(Vec<u8>, BundleManifest)> {
        self.render_with(&Excludes::new(&self.extra_excludes))
    }

    fn render_with(&self, excludes: &Excludes) -> SatchelResult<(Vec<u8>, BundleManifest)> {
        let resolved = self.project.resolve_entry_point(&self.entry_point)?;

        let stub = match self.stub {
            Some(ref stub) => stub.clone(),
            None => current_stub()?,
        };

        let zip_err = |context: &str| {
            let context = context.to_string();
            move |e: zip::result::ZipError| SatchelError::io(context, io::Error::other(e))
        };

        // Entries record absolute offsets, so the archive is written in
        // place after the stub rather than concatenated afterwards
        let stub_len = stub.len() as u64;
        let mut cursor = Cursor::new(stub);
        cursor.set_position(stub_len);
        let mut zip = ZipWriter::new(cursor);

        let source_digest = archive_project(&mut zip, &self.project.root, excludes)?;

        let manifest = BundleManifest {
            format: BUNDLE_FORMAT,
            name: self.entry_point.script.clone(),
            project: self.project.name.clone(),
            entry_point: self.entry_point.clone(),
            source_root: resolved.source_root,
            platform: self.lockset.platform().clone(),
            fingerprint: self.lockset.fingerprint().clone(),
            source_digest,
            requires_python: self.project.requires_python.clone(),
            records: self.lockset.records().to_vec(),
            satchel_version: env!("CARGO_PKG_VERSION").to_string(),
            built_at: BundleManifest::format_built_at(self.built_at),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

        // Stored, so the timestamp stays a plain field inside the file
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);
        zip.start_file(MANIFEST_ENTRY, options)
            .map_err(zip_err("writing bundle manifest"))?;
        zip.write_all(&manifest_bytes)
            .map_err(|e| SatchelError::io("writing bundle manifest", e))?;
        let bytes = zip
            .finish()
            .map_err(zip_err("finishing bundle archive"))?
            .into_inner();

        debug!(
            "Rendered bundle: stub {} B, archive {} B, manifest {} B",
            stub_len,
            bytes.len() as u64 - stub_len,
            manifest_bytes.len()
        );
        Ok((bytes, manifest))
    }
}

/// Stub bytes taken from the running executable
///
/// If the executable is itself a bundle, only its stub prefix is used.
pub fn current_stub() -> SatchelResult<Vec<u8>> {
    let exe = std::env::current_exe()
        .map_err(|e| SatchelError::io("locating the running executable", e))?;
    stub_from_file(&exe)
}

/// Stub bytes from an executable on disk, stripping any embedded bundle
pub fn stub_from_file(path: &Path) -> SatchelResult<Vec<u8>> {
    let io_err = |e| SatchelError::io(format!("reading stub {}", path.display()), e);
    let mut file = File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();

    match format::locate(&mut file) {
        Ok(Some(layout)) => format::read_prefix(&mut file, layout.stub_len).map_err(io_err),
        _ => format::read_prefix(&mut file, len).map_err(io_err),
    }
}

fn write_executable(path: &Path, bytes: &[u8]) -> SatchelResult<()> {
    let io_err = |e| SatchelError::io(format!("writing {}", path.display()), e);
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_err)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleReader;
    use crate::lockfile::{DependencyRecord, PlatformTag};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const STUB: &[u8] = b"#!/bin/sh\necho stub\nexit 0\n";

    fn project() -> (TempDir, Project) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(
            root.join("pyproject.toml"),
            "[tool.poetry]\nname = \"acme\"\n\n[tool.poetry.scripts]\nacme = \"pkg.main:run\"\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/__init__.py"), "").unwrap();
        fs::write(root.join("pkg/main.py"), "def run():\n    return 0\n").unwrap();
        let project = Project::load(root).unwrap();
        (dir, project)
    }

    fn lockset() -> LockSet {
        LockSet::new(
            vec![DependencyRecord::new("alpha", "1.0", "sha256:aa")],
            PlatformTag::new("cpython-3.11-x86_64-linux"),
        )
        .unwrap()
    }

    fn entry() -> EntryPoint {
        EntryPoint::parse("acme", "pkg.main:run").unwrap()
    }

    #[test]
    fn stub_comes_first() {
        let (_dir, project) = project();
        let lockset = lockset();
        let (bytes, manifest) = BundleBuilder::new(&project, &lockset, entry())
            .stub(STUB.to_vec())
            .render()
            .unwrap();

        assert!(bytes.starts_with(STUB));
        assert_eq!(&bytes[bytes.len() - 22..bytes.len() - 18], format::EOCD_SIGNATURE);
        assert_eq!(manifest.fingerprint, *lockset.fingerprint());
        assert_eq!(manifest.source_root, "");
    }

    #[test]
    fn builds_differ_only_in_timestamp() {
        let (_dir, project) = project();
        let lockset = lockset();
        let first_time = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let second_time = Utc.with_ymd_and_hms(2025, 11, 30, 17, 45, 12).unwrap();

        let (first, first_manifest) = BundleBuilder::new(&project, &lockset, entry())
            .stub(STUB.to_vec())
            .built_at(first_time)
            .render()
            .unwrap();
        let (second, _) = BundleBuilder::new(&project, &lockset, entry())
            .stub(STUB.to_vec())
            .built_at(second_time)
            .render()
            .unwrap();

        assert_eq!(first.len(), second.len());

        // Everything before the manifest's local header (30 fixed bytes
        // ahead of its name) is byte-identical
        let needle = MANIFEST_ENTRY.as_bytes();
        let name_at = first[STUB.len()..]
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("manifest entry present")
            + STUB.len();
        let header = name_at - 30;
        assert_eq!(&first[header..header + 4], b"PK\x03\x04");
        assert_eq!(first[..header], second[..header]);

        // The manifests differ only in their timestamp
        let dir = TempDir::new().unwrap();
        let read = |name: &str, bytes: &[u8]| {
            let path = dir.path().join(name);
            fs::write(&path, bytes).unwrap();
            BundleReader::open(&path).unwrap().manifest().clone()
        };
        let mut second_manifest = read("second", &second);
        assert_ne!(second_manifest.built_at, first_manifest.built_at);
        second_manifest.built_at = first_manifest.built_at.clone();
        assert_eq!(second_manifest, first_manifest);
        assert_eq!(read("first", &first), first_manifest);
    }

    #[test]
    fn missing_entry_point_fails_build() {
        let (dir, project) = project();
        let lockset = lockset();
        let missing = EntryPoint::parse("acme", "pkg.main:serve").unwrap();

        let err = BundleBuilder::new(&project, &lockset, missing)
            .stub(STUB.to_vec())
            .build(&dir.path().join("dist/acme"))
            .unwrap_err();

        assert!(matches!(err, SatchelError::EntryPointNotFound { .. }));
        assert!(!dir.path().join("dist/acme").exists());
    }

    #[test]
    fn build_writes_one_executable_file() {
        let (dir, project) = project();
        let lockset = lockset();
        let output = dir.path().join("dist/acme");

        let built = BundleBuilder::new(&project, &lockset, entry())
            .stub(STUB.to_vec())
            .build(&output)
            .unwrap();

        assert_eq!(built.size, fs::metadata(&output).unwrap().len());
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("dist"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        let reader = BundleReader::open(&output).unwrap();
        assert_eq!(reader.manifest().name, "acme");
    }

    #[test]
    fn stub_from_bundle_strips_payload() {
        let (dir, project) = project();
        let lockset = lockset();
        let output = dir.path().join("acme.bundle");
        BundleBuilder::new(&project, &lockset, entry())
            .stub(STUB.to_vec())
            .build(&output)
            .unwrap();

        assert_eq!(stub_from_file(&output).unwrap(), STUB);
    }
}
