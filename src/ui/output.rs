//! Output functions for consistent CLI formatting

use super::context::UiContext;
use console::{style, Style};

/// Display a section header
pub fn section(_ctx: &UiContext, title: &str) {
    println!();
    println!("{}", style(title).bold());
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("✓").green(), message);
    } else {
        println!("  {} {}", style("[OK]").green(), message);
    }
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} ({})", style("✓").green(), message, style(detail).dim());
    } else {
        println!("  {} {} ({})", style("[OK]").green(), message, detail);
    }
}

/// Display a warning step with hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} - {}", style("!").yellow(), message, style(hint).dim());
    } else {
        println!("  {} {} - {}", style("[WARN]").yellow(), message, hint);
    }
}

/// Display a remark/hint
pub fn remark(_ctx: &UiContext, message: &str) {
    println!("  {}", style(message).dim());
}

/// Print styled key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Print styled key-value with status color
pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    let value_style = if ok {
        Style::new().green()
    } else {
        Style::new().yellow()
    };

    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value_style.apply_to(value));
    } else {
        let prefix = if ok { "[OK]" } else { "[WARN]" };
        println!("  {} {}: {}", prefix, key, value);
    }
}
