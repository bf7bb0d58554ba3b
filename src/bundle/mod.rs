//! Self-executing bundles
//!
//! A bundle is a stub executable followed by a ZIP archive holding the
//! project payload and a manifest. See [`format`] for the byte layout.

pub mod builder;
pub mod format;
pub mod manifest;
pub mod payload;
pub mod reader;

pub use builder::{current_stub, stub_from_file, BuiltBundle, BundleBuilder};
pub use manifest::{BundleManifest, BUNDLE_FORMAT};
pub use payload::{archive_project, unpack_payload, Excludes, PayloadDigest};
pub use reader::BundleReader;
