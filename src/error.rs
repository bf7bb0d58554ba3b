//! Error types for satchel
//!
//! All modules use `SatchelResult<T>` as their return type.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for satchel operations
pub type SatchelResult<T> = Result<T, SatchelError>;

/// Exit code used when a bundle fails before reaching the application
pub const EXIT_BUILD: u8 = 240;
/// Exit code for lock, install and cache failures during bootstrap
pub const EXIT_BOOTSTRAP: u8 = 241;
/// Exit code for failures handing control to the entry point
pub const EXIT_DISPATCH: u8 = 242;

/// Phase in which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Building a bundle (or reading one back)
    Build,
    /// Locating or constructing the cached environment
    Bootstrap,
    /// Handing off to the wrapped entry point
    Dispatch,
}

impl Phase {
    /// Process exit code reserved for this phase
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Build => EXIT_BUILD,
            Self::Bootstrap => EXIT_BOOTSTRAP,
            Self::Dispatch => EXIT_DISPATCH,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Bootstrap => write!(f, "bootstrap/cache"),
            Self::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// All errors that can occur in satchel
#[derive(Error, Debug)]
pub enum SatchelError {
    // Lockfile errors
    #[error("Lockfile not found: {0}")]
    MissingLockfile(PathBuf),

    #[error("Malformed lockfile {path}: {reason}")]
    MalformedLockfile { path: PathBuf, reason: String },

    #[error("Duplicate dependency '{name}' in {origin}")]
    DuplicateDependency { name: String, origin: String },

    // Project errors
    #[error("Invalid project at {path}: {reason}")]
    ProjectInvalid { path: PathBuf, reason: String },

    #[error("Entry point not found: {entry_point}: {reason}")]
    EntryPointNotFound { entry_point: String, reason: String },

    // Bundle errors
    #[error("Not a satchel bundle: {path}: {reason}")]
    NotABundle { path: PathBuf, reason: String },

    #[error("Corrupt bundle {path}: {reason}")]
    CorruptBundle { path: PathBuf, reason: String },

    // Bootstrap errors
    #[error("Failed to install {package}: {reason}")]
    InstallerFailure { package: String, reason: String },

    #[error("Environment {key} failed to build in another process: {reason}")]
    BuildFailed { key: String, reason: String },

    #[error("Build lock for {key} was abandoned by pid {pid}")]
    LockAbandoned { key: String, pid: u32 },

    #[error("Corrupt environment at {path}: {reason}")]
    CorruptEnvironment { path: PathBuf, reason: String },

    #[error("Python interpreter {program} is not compatible: {reason}")]
    InterpreterMismatch { program: String, reason: String },

    // Dispatch errors
    #[error("Failed to launch {program}")]
    Dispatch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl SatchelError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a malformed lockfile error
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedLockfile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if the bootstrap recovers from this error on its own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockAbandoned { .. } | Self::CorruptEnvironment { .. }
        )
    }

    /// Phase this error belongs to when reported by a bundle
    pub fn phase(&self) -> Phase {
        match self {
            Self::MissingLockfile(_)
            | Self::MalformedLockfile { .. }
            | Self::DuplicateDependency { .. }
            | Self::ProjectInvalid { .. }
            | Self::EntryPointNotFound { .. }
            | Self::NotABundle { .. }
            | Self::CorruptBundle { .. } => Phase::Build,
            Self::CorruptEnvironment { .. } | Self::Dispatch { .. } => Phase::Dispatch,
            _ => Phase::Bootstrap,
        }
    }

    /// Exit code a bundle reports for this error
    pub fn exit_code(&self) -> u8 {
        self.phase().exit_code()
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::MissingLockfile(_) => Some("Run: poetry lock"),
            Self::DuplicateDependency { .. } => {
                Some("Each package may appear once; re-lock for a single target platform")
            }
            Self::InterpreterMismatch { .. } => {
                Some("Point SATCHEL_PYTHON at the interpreter the bundle was built for")
            }
            Self::CorruptEnvironment { .. } => Some("Run: satchel cache clear"),
            Self::BuildFailed { .. } => Some("Run the bundle again to retry the build"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SatchelError::MissingLockfile(PathBuf::from("/p/poetry.lock"));
        assert!(err.to_string().contains("Lockfile not found"));
    }

    #[test]
    fn error_hint() {
        let err = SatchelError::MissingLockfile(PathBuf::from("poetry.lock"));
        assert_eq!(err.hint(), Some("Run: poetry lock"));
    }

    #[test]
    fn error_retryable() {
        let abandoned = SatchelError::LockAbandoned {
            key: "abc".to_string(),
            pid: 42,
        };
        assert!(abandoned.is_retryable());

        let install = SatchelError::InstallerFailure {
            package: "alpha".to_string(),
            reason: "boom".to_string(),
        };
        assert!(!install.is_retryable());
    }

    #[test]
    fn error_phases_map_to_reserved_exit_codes() {
        let build = SatchelError::EntryPointNotFound {
            entry_point: "pkg.main:run".to_string(),
            reason: "missing".to_string(),
        };
        assert_eq!(build.phase(), Phase::Build);
        assert_eq!(build.exit_code(), EXIT_BUILD);

        let cache = SatchelError::InstallerFailure {
            package: "alpha".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(cache.exit_code(), EXIT_BOOTSTRAP);

        let corrupt = SatchelError::CorruptEnvironment {
            path: PathBuf::from("/cache/envs/x"),
            reason: "launcher missing".to_string(),
        };
        assert_eq!(corrupt.exit_code(), EXIT_DISPATCH);
        assert_eq!(corrupt.phase().to_string(), "dispatch");
    }
}
