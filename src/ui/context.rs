//! UI context for detecting interactive vs CI environments

use std::io::IsTerminal;

/// Environment variables that mark a CI run
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "TRAVIS",
    "JENKINS_URL",
    "BUILDKITE",
    "TEAMCITY_VERSION",
    "TF_BUILD",
];

/// UI context that determines output behavior
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Whether running in an interactive terminal
    interactive: bool,
    /// Whether --yes flag was passed (auto-approve prompts)
    auto_yes: bool,
}

impl UiContext {
    /// Detect the current environment (CLI: stdout and stdin are terminals)
    pub fn detect() -> Self {
        let interactive = std::io::stdout().is_terminal()
            && std::io::stdin().is_terminal()
            && !Self::in_ci();
        Self {
            interactive,
            auto_yes: false,
        }
    }

    /// Detect for output that goes to stderr only
    ///
    /// A bundle's stdout belongs to the application, so bootstrap progress
    /// is drawn on stderr and only when stderr is a terminal.
    pub fn detect_stderr() -> Self {
        Self {
            interactive: std::io::stderr().is_terminal() && !Self::in_ci(),
            auto_yes: false,
        }
    }

    /// Create a non-interactive context (for testing or explicit CI mode)
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    /// Set auto-yes mode (bypass prompts with defaults)
    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    /// Check if we're in an interactive terminal
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Check if prompts should be auto-approved
    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Check if we should use fancy output (spinners, colors)
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    fn in_ci() -> bool {
        CI_VARS.iter().any(|var| std::env::var_os(var).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_context() {
        let ctx = UiContext::non_interactive();
        assert!(!ctx.is_interactive());
        assert!(!ctx.auto_yes());
    }

    #[test]
    fn with_auto_yes() {
        let ctx = UiContext::non_interactive().with_auto_yes(true);
        assert!(ctx.auto_yes());
    }
}
