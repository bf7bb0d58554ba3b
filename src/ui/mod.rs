//! Terminal output helpers
//!
//! Styled with `console`; spinners come from `indicatif`. Everything falls
//! back to plain text in CI and non-interactive sessions.

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{key_value, key_value_status, remark, section, step_ok, step_ok_detail, step_warn_hint};
pub use progress::TaskSpinner;
pub use prompts::confirm_inline;
