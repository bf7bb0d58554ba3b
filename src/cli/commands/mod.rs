//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod inspect;
pub mod lock;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use inspect::execute as inspect;
pub use lock::execute as lock;
