//! Deterministic project payload
//!
//! The project tree is stored as ZIP entries with normalized metadata
//! (ZIP-epoch timestamps, fixed modes) in sorted order, so the same tree
//! always produces the same bytes.

use crate::bundle::format::META_DIR;
use crate::error::{SatchelError, SatchelResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;
const LINK_MODE: u32 = 0o777;
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Names never copied into a payload
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".venv",
    "venv",
    "dist",
    "build",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".tox",
    "node_modules",
    META_DIR,
    "*.pyc",
    "*.pyo",
];

/// Files and directories left out of a payload
#[derive(Debug, Clone)]
pub struct Excludes {
    names: Vec<String>,
    suffixes: Vec<String>,
    paths: Vec<PathBuf>,
}

impl Excludes {
    /// Defaults plus extra name or `*.ext` patterns
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut excludes = Self {
            names: vec![],
            suffixes: vec![],
            paths: vec![],
        };
        for pattern in DEFAULT_EXCLUDES.iter().copied() {
            excludes.add_pattern(pattern);
        }
        for pattern in extra {
            excludes.add_pattern(pattern.as_ref());
        }
        excludes
    }

    fn add_pattern(&mut self, pattern: &str) {
        match pattern.strip_prefix('*') {
            Some(suffix) => self.suffixes.push(suffix.to_string()),
            None => self.names.push(pattern.to_string()),
        }
    }

    /// Exclude one specific path (e.g. the bundle being written)
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    fn matches(&self, path: &Path) -> bool {
        if self.paths.iter().any(|p| p == path) {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.names.iter().any(|n| n == name) || self.suffixes.iter().any(|s| name.ends_with(s))
    }
}

impl Default for Excludes {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

/// Entry options shared by every payload entry
///
/// Timestamps are pinned to the ZIP epoch so only content and mode
/// reach the archive.
fn entry_options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(mode)
}

/// Running digest over archived entries
///
/// The builder and the extractor feed it the same sequence, so a payload
/// that unpacks to a different tree than was built is detected.
#[derive(Default)]
pub struct PayloadDigest(Sha256);

impl PayloadDigest {
    fn entry(&mut self, kind: &str, name: &str, mode: u32, content: &[u8]) {
        self.0.update(kind.as_bytes());
        self.0.update(b"\0");
        self.0.update(name.as_bytes());
        self.0.update(b"\0");
        self.0.update(format!("{:o}", mode).as_bytes());
        self.0.update(b"\0");
        self.0.update((content.len() as u64).to_le_bytes());
        self.0.update(content);
    }

    /// Hex digest of everything fed so far
    pub fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Write the tree under `root` into `zip`, returning the payload digest
pub fn archive_project<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    excludes: &Excludes,
) -> SatchelResult<String> {
    let io_err = |context: String| move |e: io::Error| SatchelError::io(context, e);
    let zip_err = |context: String| move |e: ZipError| SatchelError::io(context, io::Error::other(e));

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !excludes.matches(entry.path()));

    let mut digest = PayloadDigest::default();
    let mut count = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| {
            SatchelError::io(
                format!("walking {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::new(ErrorKind::Other, "filesystem loop")),
            )
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|_| SatchelError::Internal(format!("{} escaped project root", path.display())))?;
        let rel = archive_path(rel);

        let metadata = fs::symlink_metadata(path)
            .map_err(io_err(format!("reading metadata of {}", path.display())))?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            digest.entry("d", &rel, DIR_MODE, &[]);
            zip.add_directory(rel.as_str(), entry_options(DIR_MODE))
                .map_err(zip_err(format!("archiving {}", rel)))?;
        } else if file_type.is_file() {
            let mode = if is_executable(&metadata) { EXEC_MODE } else { FILE_MODE };
            let content = fs::read(path).map_err(io_err(format!("reading {}", path.display())))?;
            digest.entry("f", &rel, mode, &content);
            zip.start_file(rel.as_str(), entry_options(mode))
                .map_err(zip_err(format!("archiving {}", rel)))?;
            zip.write_all(&content)
                .map_err(io_err(format!("archiving {}", rel)))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)
                .map_err(io_err(format!("reading symlink {}", path.display())))?;
            let target = target.to_string_lossy().into_owned();
            digest.entry("l", &rel, LINK_MODE, target.as_bytes());
            zip.add_symlink(rel.as_str(), target.as_str(), entry_options(LINK_MODE))
                .map_err(zip_err(format!("archiving symlink {}", rel)))?;
        } else {
            debug!("Skipping special file {}", path.display());
            continue;
        }
        count += 1;
    }

    debug!("Archived {} entries from {}", count, root.display());
    Ok(digest.finish())
}

/// Unpack the project entries of `archive` into `dest`
///
/// Entries under the metadata directory are skipped. Returns the payload
/// digest of what was unpacked; damaged entries (bad CRC, unsafe names)
/// are reported as a corrupt `bundle`.
pub fn unpack_payload<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    dest: &Path,
    bundle: &Path,
) -> SatchelResult<String> {
    let io_err = |context: String| move |e: io::Error| SatchelError::io(context, e);
    let corrupt = |reason: String| SatchelError::CorruptBundle {
        path: bundle.to_path_buf(),
        reason,
    };
    fs::create_dir_all(dest).map_err(io_err(format!("creating {}", dest.display())))?;

    let mut digest = PayloadDigest::default();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => return Err(corrupt(format!("entry {}: {}", index, e))),
        };
        let name = entry.name().to_string();
        if name == META_DIR || name.starts_with(&format!("{}/", META_DIR)) {
            continue;
        }
        let Some(rel) = entry.enclosed_name() else {
            return Err(corrupt(format!("entry '{}' escapes the archive", name)));
        };
        let target = dest.join(&rel);
        let mode = entry.unix_mode().unwrap_or(FILE_MODE);
        let rel = archive_path(&rel);

        let mut content = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut content) {
            return Err(corrupt(format!("entry '{}': {}", name, e)));
        }

        if entry.is_dir() {
            digest.entry("d", &rel, DIR_MODE, &[]);
            fs::create_dir_all(&target).map_err(io_err(format!("creating {}", target.display())))?;
        } else if mode & S_IFMT == S_IFLNK {
            digest.entry("l", &rel, LINK_MODE, &content);
            let link = String::from_utf8_lossy(&content).into_owned();
            create_parent(&target)?;
            make_symlink(&link, &target)?;
        } else {
            let mode = if mode & 0o111 != 0 { EXEC_MODE } else { FILE_MODE };
            digest.entry("f", &rel, mode, &content);
            create_parent(&target)?;
            fs::write(&target, &content).map_err(io_err(format!("writing {}", target.display())))?;
            set_mode(&target, mode)?;
        }
    }
    Ok(digest.finish())
}

fn create_parent(path: &Path) -> SatchelResult<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent)
            .map_err(|e| SatchelError::io(format!("creating {}", parent.display()), e)),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn make_symlink(link: &str, target: &Path) -> SatchelResult<()> {
    std::os::unix::fs::symlink(link, target)
        .map_err(|e| SatchelError::io(format!("creating symlink {}", target.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(link: &str, target: &Path) -> SatchelResult<()> {
    debug!("Skipping symlink {} -> {}", target.display(), link);
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> SatchelResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| SatchelError::io(format!("setting mode of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> SatchelResult<()> {
    Ok(())
}

/// Forward-slash relative path for an archive entry
fn archive_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
