//! Reading bundles back
//!
//! Used by the bootstrap (on its own executable) and by `satchel inspect`.

use crate::bundle::format::{self, Layout, MANIFEST_ENTRY};
use crate::bundle::manifest::{BundleManifest, BUNDLE_FORMAT};
use crate::bundle::payload::unpack_payload;
use crate::error::{SatchelError, SatchelResult};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

/// An opened bundle; only the archive directory and manifest are read eagerly
#[derive(Debug)]
pub struct BundleReader {
    path: PathBuf,
    layout: Layout,
    manifest: BundleManifest,
}

impl BundleReader {
    /// Open a bundle, failing with `NotABundle` if it carries none
    pub fn open(path: &Path) -> SatchelResult<Self> {
        Self::probe(path)?.ok_or_else(|| SatchelError::NotABundle {
            path: path.to_path_buf(),
            reason: "no satchel archive at the end of the file".to_string(),
        })
    }

    /// Open `path` if it carries a bundle; `None` for plain executables
    /// and for archives without a satchel manifest
    pub fn probe(path: &Path) -> SatchelResult<Option<Self>> {
        let io_err = |e| SatchelError::io(format!("reading {}", path.display()), e);
        let corrupt = |reason: String| SatchelError::CorruptBundle {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = File::open(path).map_err(io_err)?;
        let layout = match format::locate(&mut file) {
            Ok(Some(layout)) => layout,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => return Err(corrupt(e.to_string())),
            Err(e) => return Err(io_err(e)),
        };

        let mut archive = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
        let bytes = match archive.by_name(MANIFEST_ENTRY) {
            Ok(mut entry) => {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| corrupt(format!("reading manifest: {}", e)))?;
                bytes
            }
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(corrupt(format!("reading manifest: {}", e))),
        };

        let manifest: BundleManifest = serde_json::from_slice(&bytes)
            .map_err(|e| corrupt(format!("manifest is not valid JSON: {}", e)))?;

        if manifest.format != BUNDLE_FORMAT {
            return Err(corrupt(format!(
                "unsupported bundle format {} (expected {})",
                manifest.format, BUNDLE_FORMAT
            )));
        }
        manifest.lockset().map_err(corrupt)?;

        debug!(
            "Opened bundle {} ({}, fingerprint {})",
            path.display(),
            manifest.name,
            manifest.fingerprint.short()
        );

        Ok(Some(Self {
            path: path.to_path_buf(),
            layout,
            manifest,
        }))
    }

    /// Bundle file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed manifest
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Position of the archive inside the file
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Unpack the project payload into `dest`
    ///
    /// Fails with `CorruptBundle` when what was unpacked does not match the
    /// manifest's source digest.
    pub fn extract_payload(&self, dest: &Path) -> SatchelResult<()> {
        let corrupt = |reason: String| SatchelError::CorruptBundle {
            path: self.path.clone(),
            reason,
        };
        let file = File::open(&self.path)
            .map_err(|e| SatchelError::io(format!("reading {}", self.path.display()), e))?;
        let mut archive = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

        let digest = unpack_payload(&mut archive, dest, &self.path)?;
        if digest != self.manifest.source_digest {
            return Err(corrupt(format!(
                "payload digest {} does not match manifest {}",
                &digest[..16],
                self.manifest.source_digest.get(..16).unwrap_or(&self.manifest.source_digest)
            )));
        }
        Ok(())
    }

    /// Stub length in bytes
    pub fn stub_len(&self) -> u64 {
        self.layout.stub_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleBuilder;
    use crate::lockfile::{DependencyRecord, LockSet, PlatformTag};
    use crate::project::{EntryPoint, Project};
    use std::fs;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("proj");
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(
            root.join("pyproject.toml"),
            "[tool.poetry]\nname = \"acme\"\n\n[tool.poetry.scripts]\nacme = \"pkg.main:run\"\n",
        )
        .unwrap();
        fs::write(root.join("pkg/__init__.py"), "").unwrap();
        fs::write(root.join("pkg/main.py"), "def run():\n    print('hi')\n").unwrap();

        let project = Project::load(&root).unwrap();
        let lockset = LockSet::new(
            vec![DependencyRecord::new("alpha", "1.0", "sha256:aa")],
            PlatformTag::new("cpython-3.11-x86_64-linux"),
        )
        .unwrap();
        let output = dir.path().join("acme");
        BundleBuilder::new(&project, &lockset, EntryPoint::parse("acme", "pkg.main:run").unwrap())
            .stub(b"STUB".to_vec())
            .build(&output)
            .unwrap();
        output
    }

    #[test]
    fn plain_file_is_not_a_bundle() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, vec![7u8; 100]).unwrap();

        assert!(BundleReader::probe(&plain).unwrap().is_none());
        assert!(matches!(
            BundleReader::open(&plain).unwrap_err(),
            SatchelError::NotABundle { .. }
        ));
    }

    #[test]
    fn foreign_zip_is_not_a_bundle() {
        let dir = TempDir::new().unwrap();
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("README.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"just a zip").unwrap();
        let path = dir.path().join("plain.zip");
        fs::write(&path, zip.finish().unwrap().into_inner()).unwrap();

        assert!(BundleReader::probe(&path).unwrap().is_none());
    }

    #[test]
    fn reads_manifest_and_payload() {
        let dir = TempDir::new().unwrap();
        let bundle = build(&dir);

        let reader = BundleReader::open(&bundle).unwrap();
        assert_eq!(reader.stub_len(), 4);
        assert_eq!(reader.manifest().records.len(), 1);
        assert_eq!(reader.manifest().entry_point.to_string(), "pkg.main:run");

        let dest = dir.path().join("out");
        reader.extract_payload(&dest).unwrap();
        assert!(dest.join("pkg/main.py").exists());
        assert!(!dest.join("__satchel__").exists());
    }

    #[test]
    fn bundle_is_a_plain_zip_to_other_readers() {
        let dir = TempDir::new().unwrap();
        let bundle = build(&dir);

        let mut archive = ZipArchive::new(File::open(&bundle).unwrap()).unwrap();
        let mut main = String::new();
        archive
            .by_name("pkg/main.py")
            .unwrap()
            .read_to_string(&mut main)
            .unwrap();
        assert!(main.contains("print('hi')"));
        assert!(archive.by_name(MANIFEST_ENTRY).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bundle = build(&dir);

        // main.py's compressed data ends where the next local header starts
        let mut bytes = fs::read(&bundle).unwrap();
        let needle = b"pkg/main.py";
        let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap();
        let next = at
            + bytes[at..]
                .windows(4)
                .position(|w| w == b"PK\x03\x04")
                .unwrap();
        for b in &mut bytes[next - 3..next] {
            *b ^= 0xff;
        }
        fs::write(&bundle, &bytes).unwrap();

        let reader = BundleReader::open(&bundle).unwrap();
        assert!(matches!(
            reader.extract_payload(&dir.path().join("out")).unwrap_err(),
            SatchelError::CorruptBundle { .. }
        ));
    }

    #[test]
    fn truncated_bundle_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let bundle = build(&dir);
        let bytes = fs::read(&bundle).unwrap();

        // Drop one stub byte: offsets no longer add up
        fs::write(&bundle, &bytes[1..]).unwrap();
        assert!(matches!(
            BundleReader::open(&bundle).unwrap_err(),
            SatchelError::CorruptBundle { .. }
        ));
    }
}
