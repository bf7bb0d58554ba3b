//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Satchel - self-executing bundles for Poetry projects
///
/// Packs a project and its locked dependency set into one executable.
/// The bundle installs its environment once per machine and reuses it on
/// every later run.
#[derive(Parser, Debug)]
#[command(name = "satchel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SATCHEL_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a bundle from a Poetry project
    Build(BuildArgs),

    /// Show a bundle's manifest and cache state
    Inspect(InspectArgs),

    /// Print the locked dependency set and its fingerprint
    Lock(LockArgs),

    /// Manage the environment cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Project directory (defaults to current directory)
    pub project: Option<PathBuf>,

    /// Script name or `module:callable` (defaults to every declared script)
    pub entry_point: Option<String>,

    /// Lockfile path (defaults to <project>/poetry.lock)
    #[arg(short, long)]
    pub lockfile: Option<PathBuf>,

    /// Output file, or directory when building several scripts
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Executable to use as the bundle stub (defaults to this binary)
    #[arg(long)]
    pub stub: Option<PathBuf>,

    /// Interpreter probed for the target platform
    #[arg(long, conflicts_with = "platform")]
    pub python: Option<String>,

    /// Target platform tag, e.g. cpython-3.11-x86_64-linux
    #[arg(long)]
    pub platform: Option<String>,

    /// Include packages from non-main dependency groups
    #[arg(long)]
    pub include_dev: bool,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Bundle to inspect
    pub bundle: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,

    /// Extract the payload into this directory
    #[arg(long)]
    pub extract: Option<PathBuf>,
}

/// Arguments for the lock command
#[derive(Parser, Debug)]
pub struct LockArgs {
    /// Project directory (defaults to current directory)
    pub project: Option<PathBuf>,

    /// Lockfile path (defaults to <project>/poetry.lock)
    #[arg(short, long)]
    pub lockfile: Option<PathBuf>,

    /// Target platform tag (defaults to the build interpreter's)
    #[arg(long)]
    pub platform: Option<String>,

    /// Include packages from non-main dependency groups
    #[arg(long)]
    pub include_dev: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.max_entries)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached environments
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Evict old and excess environments
    Gc {
        /// Evict environments published more than N days ago (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every environment not in use
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the cache directory
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build_defaults() {
        let cli = Cli::parse_from(["satchel", "build"]);
        match cli.command {
            Commands::Build(args) => {
                assert!(args.project.is_none());
                assert!(args.entry_point.is_none());
                assert!(!args.include_dev);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_parses_build_with_flags() {
        let cli = Cli::parse_from([
            "satchel",
            "build",
            "proj",
            "acme",
            "--platform",
            "cpython-3.11-x86_64-linux",
            "-o",
            "out/acme",
            "--include-dev",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.project, Some(PathBuf::from("proj")));
                assert_eq!(args.entry_point.as_deref(), Some("acme"));
                assert_eq!(args.platform.as_deref(), Some("cpython-3.11-x86_64-linux"));
                assert_eq!(args.output, Some(PathBuf::from("out/acme")));
                assert!(args.include_dev);
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_rejects_python_with_platform() {
        let result = Cli::try_parse_from([
            "satchel",
            "build",
            "--python",
            "python3.12",
            "--platform",
            "cpython-3.11-x86_64-linux",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_inspect() {
        let cli = Cli::parse_from(["satchel", "inspect", "dist/acme", "--format", "json"]);
        match cli.command {
            Commands::Inspect(args) => {
                assert_eq!(args.bundle, PathBuf::from("dist/acme"));
                assert_eq!(args.format, OutputFormat::Json);
                assert!(args.extract.is_none());
            }
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["satchel", "cache", "gc", "--days", "7", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
            }) => {
                assert_eq!(days, Some(7));
                assert!(dry_run);
            }
            _ => panic!("expected cache gc"),
        }
    }

    #[test]
    fn cli_parses_global_verbose() {
        let cli = Cli::parse_from(["satchel", "cache", "path", "-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheArgs {
                action: CacheAction::Path
            })
        ));
    }

    #[test]
    fn cli_parses_config_default_action() {
        let cli = Cli::parse_from(["satchel", "config"]);
        match cli.command {
            Commands::Config(args) => assert!(args.action.is_none()),
            _ => panic!("expected Config command"),
        }
    }
}
