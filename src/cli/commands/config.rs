//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{SatchelError, SatchelResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Keys accepted by `config set`
const VALID_KEYS: &[&str] = &[
    "general.verbose",
    "build.python",
    "build.output_dir",
    "build.exclude",
    "build.include_dev",
    "cache.dir",
    "cache.gc_days",
    "cache.max_entries",
    "runtime.python",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> SatchelResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => show_path(manager),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> SatchelResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn show_path(manager: &ConfigManager) {
    println!("{}", manager.path().display());
}

async fn init_config(manager: &ConfigManager, force: bool) -> SatchelResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;

    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &path.display().to_string(),
    );

    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> SatchelResult<()> {
    let ctx = UiContext::detect();
    let mut config = config.clone();
    apply_value(&mut config, key, value)?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));

    Ok(())
}

/// Apply one dot-separated `key = value` assignment
fn apply_value(config: &mut Config, key: &str, value: &str) -> SatchelResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "verbose"] => config.general.verbose = parse_bool(value)?,

        ["build", "python"] => config.build.python = value.to_string(),
        ["build", "output_dir"] => config.build.output_dir = PathBuf::from(value),
        ["build", "exclude"] => {
            config.build.exclude = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        ["build", "include_dev"] => config.build.include_dev = parse_bool(value)?,

        ["cache", "dir"] => {
            config.cache.dir = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        ["cache", "gc_days"] => config.cache.gc_days = parse_u32(value)?,
        ["cache", "max_entries"] => config.cache.max_entries = parse_u32(value)?,

        ["runtime", "python"] => config.runtime.python = value.to_string(),

        _ => {
            return Err(SatchelError::User(format!(
                "Unknown config key: {} (valid keys: {})",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> SatchelResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(SatchelError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_u32(value: &str) -> SatchelResult<u32> {
    value
        .parse()
        .map_err(|_| SatchelError::User(format!("Invalid number: {}", value)))
}
