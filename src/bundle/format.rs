//! Byte layout of a bundle file
//!
//! ```text
//! +-----------------+--------------------------------------------------+
//! | stub executable | ZIP archive                                      |
//! |                 |  project files ... | __satchel__/manifest.json   |
//! |                 |  central directory | end of central directory    |
//! +-----------------+--------------------------------------------------+
//! 0                 stub_len                                         len
//! ```
//!
//! The stub is what the program loader sees. The ZIP is located from its
//! end-of-central-directory record, and its offsets are absolute file
//! offsets, so standard tools (`unzip`, Python's `zipfile`) open a bundle
//! as-is. Bundles never carry a ZIP comment, which keeps the record at a
//! fixed distance from the end.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Directory inside the archive reserved for satchel metadata
pub const META_DIR: &str = "__satchel__";

/// Archive entry holding the manifest
pub const MANIFEST_ENTRY: &str = "__satchel__/manifest.json";

/// End-of-central-directory signature
pub const EOCD_SIGNATURE: &[u8; 4] = b"PK\x05\x06";

/// End-of-central-directory record size (no comment)
pub const EOCD_LEN: u64 = 22;

const CENTRAL_HEADER_SIGNATURE: &[u8; 4] = b"PK\x01\x02";
const CENTRAL_HEADER_LEN: usize = 46;
const ZIP64_MARKER: u32 = u32::MAX;

/// Where the archive sits inside a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Bytes before the first archive entry
    pub stub_len: u64,
    /// Start of the central directory
    pub central_offset: u64,
    /// Number of archive entries
    pub entries: u16,
}

/// Fields of the end-of-central-directory record satchel relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndRecord {
    entries: u16,
    central_size: u32,
    central_offset: u32,
}

impl EndRecord {
    fn decode(bytes: &[u8; EOCD_LEN as usize]) -> Option<Self> {
        if &bytes[0..4] != EOCD_SIGNATURE {
            return None;
        }
        // Comment length must be zero for the record to sit at len - 22
        if u16_at(bytes, 20) != 0 {
            return None;
        }
        Some(Self {
            entries: u16_at(bytes, 10),
            central_size: u32_at(bytes, 12),
            central_offset: u32_at(bytes, 16),
        })
    }
}

/// Locate the archive of an open file
///
/// `Ok(None)` means the file does not end in an archive at all (a plain
/// executable). `Err` with `InvalidData` means it ends in something that
/// looks like an archive but does not add up.
pub fn locate(file: &mut File) -> io::Result<Option<Layout>> {
    let len = file.metadata()?.len();
    if len < EOCD_LEN {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(len - EOCD_LEN))?;
    let mut buf = [0u8; EOCD_LEN as usize];
    file.read_exact(&mut buf)?;
    let Some(end) = EndRecord::decode(&buf) else {
        return Ok(None);
    };

    if end.central_offset == ZIP64_MARKER || end.central_size == ZIP64_MARKER {
        return Err(invalid("ZIP64 archives are not supported"));
    }
    let central_offset = u64::from(end.central_offset);
    if central_offset + u64::from(end.central_size) != len - EOCD_LEN {
        return Err(invalid(format!(
            "central directory ({} bytes at {}) does not end at the end record ({})",
            end.central_size,
            central_offset,
            len - EOCD_LEN
        )));
    }
    if end.entries == 0 {
        return Err(invalid("archive has no entries"));
    }

    // The first central header names the first local header, which is
    // where the stub ends
    file.seek(SeekFrom::Start(central_offset))?;
    let mut header = [0u8; CENTRAL_HEADER_LEN];
    file.read_exact(&mut header)?;
    if &header[0..4] != CENTRAL_HEADER_SIGNATURE {
        return Err(invalid("central directory does not start with a file header"));
    }
    let stub_len = u64::from(u32_at(&header, 42));
    if stub_len >= central_offset {
        return Err(invalid("first entry starts after the central directory"));
    }

    Ok(Some(Layout {
        stub_len,
        central_offset,
        entries: end.entries,
    }))
}

/// Read the first `len` bytes of a file
pub fn read_prefix(file: &mut File, len: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "bundle stub truncated",
        ));
    }
    Ok(buf)
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn archive_after(prefix: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(prefix.to_vec());
        cursor.set_position(prefix.len() as u64);
        let mut zip = ZipWriter::new(cursor);
        zip.start_file("hello.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"hello").unwrap();
        zip.finish().unwrap().into_inner()
    }

    fn temp_with(bytes: &[u8]) -> (NamedTempFile, File) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        let handle = file.reopen().unwrap();
        (file, handle)
    }

    #[test]
    fn locates_archive_after_prefix() {
        let bytes = archive_after(b"#!/bin/sh\nexit 0\n");
        let (_tmp, mut file) = temp_with(&bytes);

        let layout = locate(&mut file).unwrap().unwrap();
        assert_eq!(layout.stub_len, 17);
        assert_eq!(layout.entries, 1);
        assert_eq!(read_prefix(&mut file, layout.stub_len).unwrap(), b"#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn plain_file_has_no_archive() {
        let (_tmp, mut file) = temp_with(b"#!/bin/sh\necho not a bundle\n");
        assert_eq!(locate(&mut file).unwrap(), None);
    }

    #[test]
    fn shifted_archive_is_invalid() {
        let bytes = archive_after(b"STUB");
        // Dropping a stub byte moves every entry away from its recorded offset
        let (_tmp, mut file) = temp_with(&bytes[1..]);
        let err = locate(&mut file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
