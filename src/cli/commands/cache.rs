//! Cache command - manage cached environments

use crate::cache::{format_bytes, CacheEntryInfo, CacheManager, EntryStatus, EvictionPolicy, EvictionReport};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::SatchelResult;
use crate::ui::{self, UiContext};
use chrono::Utc;
use console::style;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> SatchelResult<()> {
    let manager = CacheManager::new(ConfigManager::cache_dir(config))
        .with_policy(EvictionPolicy::from(&config.cache));

    match args.action {
        CacheAction::List { format } => list_entries(&manager, format),
        CacheAction::Gc { days, dry_run } => gc_entries(&manager, days, dry_run),
        CacheAction::Clear { yes } => clear_entries(&manager, yes),
        CacheAction::Path => {
            println!("{}", manager.layout().root().display());
            Ok(())
        }
    }
}

/// List cached environments
fn list_entries(manager: &CacheManager, format: OutputFormat) -> SatchelResult<()> {
    let entries = manager.entries()?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.key);
            }
            return Ok(());
        }
        OutputFormat::Table => {}
    }

    if entries.is_empty() {
        println!("No cached environments.");
        return Ok(());
    }
    print_entry_table(&entries);
    Ok(())
}

fn print_entry_table(entries: &[CacheEntryInfo]) {
    println!(
        "{:<18} {:<10} {:<28} {:>5} {:>10} {:<17}",
        "KEY", "STATUS", "PLATFORM", "PKGS", "SIZE", "PUBLISHED"
    );
    println!("{}", "-".repeat(93));

    for entry in entries {
        let status = match entry.status {
            EntryStatus::Ready => style("ready").green().to_string(),
            EntryStatus::Building => style("building").yellow().to_string(),
            EntryStatus::Failed => style("failed").red().to_string(),
            EntryStatus::Corrupt => style("corrupt").red().to_string(),
        };
        let published = entry
            .published_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let records = entry
            .records
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());

        // Escape codes would throw off width-based padding
        println!(
            "{:<18} {:<10} {:<28} {:>5} {:>10} {:<17}",
            entry.key,
            pad_styled(&status, entry.status.to_string().len(), 10),
            entry.platform.as_deref().unwrap_or("-"),
            records,
            format_bytes(entry.size_bytes),
            published
        );
        if let Some(ref error) = entry.error {
            println!("  {} {}", style("└").dim(), style(error).dim());
        }
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!();
    println!("Total: {} environment(s), {}", entries.len(), format_bytes(total));
}

fn pad_styled(styled: &str, visible: usize, width: usize) -> String {
    format!("{}{}", styled, " ".repeat(width.saturating_sub(visible)))
}

/// Evict environments per the configured policy (or `--days`)
fn gc_entries(manager: &CacheManager, days: Option<u32>, dry_run: bool) -> SatchelResult<()> {
    let ctx = UiContext::detect();
    let mut policy = *manager.policy();
    if let Some(days) = days {
        policy.max_age_days = days;
    }

    let report = manager.evict_with(&policy, None, dry_run)?;
    if report.is_empty() {
        let limits = match (policy.max_entries, policy.max_age_days) {
            (0, 0) => "no limits configured".to_string(),
            (0, days) => format!("none older than {} days", days),
            (n, 0) => format!("at most {} kept", n),
            (n, days) => format!("at most {} kept, none older than {} days", n, days),
        };
        ui::step_ok_detail(&ctx, "Nothing to evict", &limits);
        print_busy(&ctx, &report);
        return Ok(());
    }

    print_report(&ctx, &report, dry_run);
    Ok(())
}

/// Remove every environment whose lock is free
fn clear_entries(manager: &CacheManager, yes: bool) -> SatchelResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let plan = manager.clear(true)?;

    if plan.is_empty() {
        // Still drops failed index records
        let report = manager.clear(false)?;
        println!("No cached environments to clear.");
        print_busy(&ctx, &report);
        return Ok(());
    }

    println!(
        "This will remove {} environment(s) ({}):",
        plan.evicted.len(),
        format_bytes(plan.bytes_freed())
    );
    for candidate in &plan.evicted {
        println!("  {} {}", style("•").red(), candidate.key);
    }
    println!();

    if !ui::confirm_inline(&ctx, "Are you sure?") {
        println!("Aborted.");
        return Ok(());
    }

    let report = manager.clear(false)?;
    print_report(&ctx, &report, false);
    Ok(())
}

fn print_report(ctx: &UiContext, report: &EvictionReport, dry_run: bool) {
    let now = Utc::now();
    for candidate in &report.evicted {
        let age = candidate
            .published_at
            .map(|t| format!(", {} days old", (now - t).num_days()))
            .unwrap_or_default();
        println!(
            "  {} {} ({}{}, {})",
            style("•").red(),
            candidate.key,
            candidate.reason,
            age,
            format_bytes(candidate.size_bytes)
        );
    }
    for orphan in &report.orphans {
        println!(
            "  {} {} (abandoned staging)",
            style("•").red(),
            orphan.display()
        );
    }
    println!();

    if dry_run {
        ui::remark(ctx, "Dry run - nothing removed.");
    } else {
        ui::step_ok_detail(
            ctx,
            &format!("Removed {} environment(s)", report.evicted.len()),
            &format!("{} freed", format_bytes(report.bytes_freed())),
        );
    }
    print_busy(ctx, report);
}

fn print_busy(ctx: &UiContext, report: &EvictionReport) {
    if !report.busy.is_empty() {
        ui::step_warn_hint(
            ctx,
            &format!("{} environment(s) in use", report.busy.len()),
            "skipped while running or being built",
        );
    }
}
