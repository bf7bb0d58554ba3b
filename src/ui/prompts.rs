//! Confirmation prompts with non-interactive fallback

use super::context::UiContext;
use std::io::{self, Write};

/// Ask a y/N question on the terminal
///
/// Auto-yes approves; a non-interactive session declines.
pub fn confirm_inline(ctx: &UiContext, prompt: &str) -> bool {
    if ctx.auto_yes() {
        println!("  {} (auto-approved)", prompt);
        return true;
    }
    if !ctx.is_interactive() {
        return false;
    }

    print!("  {} [y/N] ", prompt);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}
