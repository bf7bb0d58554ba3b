//! Python interpreter probing and version constraints

use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::PlatformTag;
use semver::{Version, VersionReq};
use std::fmt;
use tokio::process::Command;
use tracing::debug;

const PROBE_SCRIPT: &str = "import platform, sys; \
print(sys.implementation.name, '%d.%d.%d' % sys.version_info[:3], \
platform.machine().lower(), sys.platform)";

/// A Python interpreter and the platform it targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Program used to launch it
    pub program: String,
    /// `sys.implementation.name` (e.g. `cpython`)
    pub implementation: String,
    /// Interpreter version
    pub version: Version,
    /// Lowercased machine architecture
    pub machine: String,
    /// `sys.platform`
    pub os: String,
}

impl Interpreter {
    /// Run `program` once to learn what it is
    pub async fn probe(program: &str) -> SatchelResult<Self> {
        debug!("Probing interpreter {}", program);
        let output = Command::new(program)
            .args(["-c", PROBE_SCRIPT])
            .output()
            .await
            .map_err(|e| SatchelError::command_failed(format!("{} -c <probe>", program), e))?;

        if !output.status.success() {
            return Err(SatchelError::command_exec(
                format!("{} -c <probe>", program),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Self::parse_probe(program, &String::from_utf8_lossy(&output.stdout))
    }

    /// Parse the probe script's single output line
    pub fn parse_probe(program: &str, output: &str) -> SatchelResult<Self> {
        let fields: Vec<&str> = output.split_whitespace().collect();
        let bad = || SatchelError::InterpreterMismatch {
            program: program.to_string(),
            reason: format!("unexpected probe output '{}'", output.trim()),
        };

        let [implementation, version, machine, os] = fields.as_slice() else {
            return Err(bad());
        };
        let version = Version::parse(version).map_err(|_| bad())?;

        Ok(Self {
            program: program.to_string(),
            implementation: implementation.to_string(),
            version,
            machine: machine.to_string(),
            os: os.to_string(),
        })
    }

    /// Platform tag identifying environments built with this interpreter
    pub fn platform_tag(&self) -> PlatformTag {
        PlatformTag::new(format!(
            "{}-{}.{}-{}-{}",
            self.implementation, self.version.major, self.version.minor, self.machine, self.os
        ))
    }

    /// Fail unless this interpreter can host a bundle built for `platform`
    pub fn ensure_compatible(
        &self,
        platform: &PlatformTag,
        requires_python: Option<&str>,
    ) -> SatchelResult<()> {
        let tag = self.platform_tag();
        if &tag != platform {
            return Err(SatchelError::InterpreterMismatch {
                program: self.program.clone(),
                reason: format!("bundle targets {}, interpreter is {}", platform, tag),
            });
        }

        if let Some(constraint) = requires_python {
            let req = RequiresPython::parse(constraint)?;
            if !req.matches(&self.version) {
                return Err(SatchelError::InterpreterMismatch {
                    program: self.program.clone(),
                    reason: format!("version {} does not satisfy '{}'", self.version, req),
                });
            }
        }
        Ok(())
    }
}

/// A `requires-python` constraint in Poetry or PEP 440 syntax
#[derive(Debug, Clone)]
pub struct RequiresPython {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl RequiresPython {
    /// Parse a constraint such as `^3.9`, `>=3.8,<4.0` or `~=3.10`
    ///
    /// `||` separates alternatives. `!=` clauses are ignored.
    pub fn parse(constraint: &str) -> SatchelResult<Self> {
        let invalid = |reason: String| SatchelError::ProjectInvalid {
            path: "requires-python".into(),
            reason,
        };

        let mut alternatives = Vec::new();
        for alternative in constraint.split("||") {
            let clauses: Vec<String> = alternative
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .filter_map(translate_clause)
                .collect();

            let req = if clauses.is_empty() {
                VersionReq::STAR
            } else {
                VersionReq::parse(&clauses.join(", "))
                    .map_err(|e| invalid(format!("'{}': {}", constraint, e)))?
            };
            alternatives.push(req);
        }

        Ok(Self {
            raw: constraint.trim().to_string(),
            alternatives,
        })
    }

    /// Whether `version` satisfies any alternative
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

impl fmt::Display for RequiresPython {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Translate one PEP 440 / Poetry clause into semver syntax
fn translate_clause(clause: &str) -> Option<String> {
    if clause == "*" {
        return None;
    }
    if clause.starts_with("!=") {
        debug!("Ignoring exclusion clause '{}'", clause);
        return None;
    }
    if let Some(version) = clause.strip_prefix("~=") {
        let version = version.trim();
        let parts: Vec<&str> = version.split('.').collect();
        return Some(match parts.as_slice() {
            [major, _minor] => format!(">={}, <{}", version, major.parse::<u64>().map(|m| m + 1).unwrap_or(u64::MAX)),
            _ => format!("~{}", version),
        });
    }
    if let Some(version) = clause.strip_prefix("==") {
        return Some(format!("={}", version.trim().trim_end_matches(".*")));
    }
    if clause.starts_with(['>', '<', '^', '~', '=']) {
        return Some(clause.to_string());
    }
    // A bare version pins exactly in Poetry
    Some(format!("={}", clause.trim_end_matches(".*")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parse_probe_output() {
        let interp =
            Interpreter::parse_probe("python3", "cpython 3.11.4 x86_64 linux\n").unwrap();
        assert_eq!(interp.version, v("3.11.4"));
        assert_eq!(interp.platform_tag().as_str(), "cpython-3.11-x86_64-linux");
    }

    #[test]
    fn parse_probe_rejects_noise() {
        assert!(Interpreter::parse_probe("python3", "Python 3.11").is_err());
    }

    #[test]
    fn caret_constraint() {
        let req = RequiresPython::parse("^3.9").unwrap();
        assert!(req.matches(&v("3.9.0")));
        assert!(req.matches(&v("3.12.1")));
        assert!(!req.matches(&v("3.8.18")));
        assert!(!req.matches(&v("4.0.0")));
    }

    #[test]
    fn range_constraint() {
        let req = RequiresPython::parse(">=3.8,<3.11").unwrap();
        assert!(req.matches(&v("3.10.2")));
        assert!(!req.matches(&v("3.11.0")));
    }

    #[test]
    fn compatible_release_constraint() {
        let req = RequiresPython::parse("~=3.10").unwrap();
        assert!(req.matches(&v("3.12.0")));
        assert!(!req.matches(&v("3.9.0")));
        assert!(!req.matches(&v("4.0.0")));
    }

    #[test]
    fn wildcard_and_alternatives() {
        let req = RequiresPython::parse("==3.11.*").unwrap();
        assert!(req.matches(&v("3.11.7")));
        assert!(!req.matches(&v("3.12.0")));

        let either = RequiresPython::parse(">=2.7,<2.8 || >=3.6").unwrap();
        assert!(either.matches(&v("2.7.18")));
        assert!(either.matches(&v("3.6.0")));
        assert!(!either.matches(&v("3.0.0")));

        assert!(RequiresPython::parse("*").unwrap().matches(&v("2.0.0")));
    }

    #[test]
    fn compatibility_checks_platform_then_version() {
        let interp =
            Interpreter::parse_probe("python3", "cpython 3.8.10 x86_64 linux").unwrap();

        let other = PlatformTag::new("cpython-3.11-x86_64-linux");
        assert!(interp.ensure_compatible(&other, None).is_err());

        let same = interp.platform_tag();
        assert!(interp.ensure_compatible(&same, Some("^3.8")).is_ok());
        let err = interp.ensure_compatible(&same, Some("^3.9")).unwrap_err();
        assert!(matches!(err, SatchelError::InterpreterMismatch { .. }));
    }
}
