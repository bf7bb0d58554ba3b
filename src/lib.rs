//! Satchel - self-executing bundles for Poetry projects
//!
//! Packs a project and its locked dependency set into one executable.
//! On first run the bundle installs its environment into a machine-local
//! cache; every later run reuses it without locking or writing.

pub mod bootstrap;
pub mod bundle;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod installer;
pub mod lockfile;
pub mod project;
pub mod python;
pub mod ui;

pub use error::{SatchelError, SatchelResult};
