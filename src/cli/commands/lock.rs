//! Lock command - show the locked dependency set

use crate::cli::args::{LockArgs, OutputFormat};
use crate::config::Config;
use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::{read_lockset, DependencyRecord, LockSet, PlatformTag, ReadOptions, LOCKFILE_NAME};
use crate::python::Interpreter;
use serde::Serialize;
use std::path::Path;

/// Execute the lock command
pub async fn execute(args: LockArgs, config: &Config) -> SatchelResult<()> {
    let root = match args.project {
        Some(p) => p,
        None => std::env::current_dir()
            .map_err(|e| SatchelError::io("getting current directory", e))?,
    };
    let lockfile = args.lockfile.unwrap_or_else(|| root.join(LOCKFILE_NAME));

    let platform = match args.platform {
        Some(tag) => PlatformTag::new(tag),
        None => Interpreter::probe(&config.build.python).await?.platform_tag(),
    };
    let options = ReadOptions {
        include_dev: args.include_dev || config.build.include_dev,
    };
    let lockset = read_lockset(&lockfile, platform, &options)?;

    match args.format {
        OutputFormat::Table => print_table(&lockfile, &lockset),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&LockJson::new(&lockset))?),
        OutputFormat::Plain => {
            for record in lockset.records() {
                println!("{}=={}", record.name, record.version);
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct LockJson<'a> {
    platform: &'a str,
    fingerprint: &'a str,
    records: &'a [DependencyRecord],
}

impl<'a> LockJson<'a> {
    fn new(lockset: &'a LockSet) -> Self {
        Self {
            platform: lockset.platform().as_str(),
            fingerprint: lockset.fingerprint().as_str(),
            records: lockset.records(),
        }
    }
}

fn print_table(lockfile: &Path, lockset: &LockSet) {
    println!("{:<32} {:<16} {:<12} {}", "PACKAGE", "VERSION", "SOURCE", "HASH");
    println!("{}", "-".repeat(80));

    for record in lockset.records() {
        let hash = record.content_hash.get(..23).unwrap_or(&record.content_hash);
        println!(
            "{:<32} {:<16} {:<12} {}",
            record.name,
            record.version,
            record.source.kind(),
            hash
        );
    }

    println!();
    println!("Lockfile:    {}", lockfile.display());
    println!("Platform:    {}", lockset.platform());
    println!("Packages:    {}", lockset.len());
    println!("Fingerprint: {}", lockset.fingerprint());
}
