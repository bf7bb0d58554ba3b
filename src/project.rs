//! Project metadata from `pyproject.toml`
//!
//! Supplies the console scripts a bundle can wrap and checks that a
//! declared `module:callable` entry point actually exists in the tree.

use crate::error::{SatchelError, SatchelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Project manifest file name
pub const PYPROJECT: &str = "pyproject.toml";

/// Directories searched for top-level packages, in order
const SOURCE_ROOTS: &[&str] = &["", "src"];

#[derive(Debug, Default, Deserialize)]
struct RawPyproject {
    project: Option<RawProjectTable>,
    tool: Option<RawTool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProjectTable {
    name: Option<String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTool {
    poetry: Option<RawPoetry>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPoetry {
    name: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, toml::Value>,
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
}

/// A console entry point: `script = "module:callable"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Script name (also the default bundle file name)
    pub script: String,
    /// Dotted module path
    pub module: String,
    /// Attribute path inside the module (may be dotted)
    pub callable: String,
}

impl EntryPoint {
    /// Parse a `module:callable` reference
    pub fn parse(script: &str, reference: &str) -> SatchelResult<Self> {
        let invalid = |reason: &str| SatchelError::EntryPointNotFound {
            entry_point: reference.to_string(),
            reason: reason.to_string(),
        };

        // Extras like `pkg.cli:main [color]` are irrelevant at runtime
        let reference_no_extras = reference.split('[').next().unwrap_or(reference).trim();
        let (module, callable) = reference_no_extras
            .split_once(':')
            .ok_or_else(|| invalid("expected 'module:callable'"))?;

        let module = module.trim();
        let callable = callable.trim();
        if !is_dotted_identifier(module) {
            return Err(invalid("module is not a dotted Python identifier"));
        }
        if !is_dotted_identifier(callable) {
            return Err(invalid("callable is not a dotted Python identifier"));
        }

        Ok(Self {
            script: script.to_string(),
            module: module.to_string(),
            callable: callable.to_string(),
        })
    }

    /// Candidate module files, relative to a source root
    pub fn module_paths(&self) -> [PathBuf; 2] {
        let base: PathBuf = self.module.split('.').collect();
        [base.with_extension("py"), base.join("__init__.py")]
    }

    /// First attribute looked up on the module
    pub fn top_level_name(&self) -> &str {
        self.callable.split('.').next().unwrap_or(&self.callable)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.callable)
    }
}

/// Where an entry point was found inside the project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntryPoint {
    /// Directory (relative to the project root) that goes on `sys.path`
    pub source_root: String,
    /// The module file defining the callable
    pub module_file: PathBuf,
}

/// A Python project on disk
#[derive(Debug, Clone)]
pub struct Project {
    /// Project root directory
    pub root: PathBuf,
    /// Distribution name
    pub name: String,
    /// Supported interpreter range, if declared
    pub requires_python: Option<String>,
    /// Declared console scripts, name -> `module:callable`
    pub scripts: BTreeMap<String, String>,
}

impl Project {
    /// Load `pyproject.toml` from `root`
    pub fn load(root: &Path) -> SatchelResult<Self> {
        let path = root.join(PYPROJECT);
        if !path.is_file() {
            return Err(SatchelError::ProjectInvalid {
                path: root.to_path_buf(),
                reason: format!("no {} found", PYPROJECT),
            });
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| SatchelError::io(format!("reading {}", path.display()), e))?;
        Self::parse(root, &content)
    }

    /// Parse pyproject content for a project rooted at `root`
    pub fn parse(root: &Path, content: &str) -> SatchelResult<Self> {
        let raw: RawPyproject = toml::from_str(content).map_err(|e| SatchelError::ProjectInvalid {
            path: root.join(PYPROJECT),
            reason: e.to_string(),
        })?;

        let project = raw.project.unwrap_or_default();
        let poetry = raw.tool.and_then(|t| t.poetry).unwrap_or_default();

        let name = project
            .name
            .or(poetry.name)
            .ok_or_else(|| SatchelError::ProjectInvalid {
                path: root.join(PYPROJECT),
                reason: "missing project name".to_string(),
            })?;

        let requires_python = project.requires_python.or_else(|| {
            poetry
                .dependencies
                .get("python")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

        let mut scripts = project.scripts;
        for (script, value) in poetry.scripts {
            let reference = match value {
                toml::Value::String(s) => Some(s),
                toml::Value::Table(table) => table
                    .get("reference")
                    .or_else(|| table.get("callable"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            };
            match reference {
                Some(reference) => {
                    scripts.entry(script).or_insert(reference);
                }
                None => debug!("Ignoring non-console script {}", script),
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            name,
            requires_python,
            scripts,
        })
    }

    /// Select entry points to bundle
    ///
    /// `None` selects every declared script. A selector containing `:` is
    /// used as a literal `module:callable`; anything else must name a script.
    pub fn entry_points(&self, selector: Option<&str>) -> SatchelResult<Vec<EntryPoint>> {
        match selector {
            None => {
                if self.scripts.is_empty() {
                    return Err(SatchelError::EntryPointNotFound {
                        entry_point: self.name.clone(),
                        reason: "no scripts in [tool.poetry.scripts] or [project.scripts]"
                            .to_string(),
                    });
                }
                self.scripts
                    .iter()
                    .map(|(script, reference)| EntryPoint::parse(script, reference))
                    .collect()
            }
            Some(spec) if spec.contains(':') => {
                let module = spec.split(':').next().unwrap_or(spec);
                let script = module.split('.').next().unwrap_or(module).trim();
                Ok(vec![EntryPoint::parse(script, spec)?])
            }
            Some(script) => match self.scripts.get(script) {
                Some(reference) => Ok(vec![EntryPoint::parse(script, reference)?]),
                None => {
                    let options: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
                    Err(SatchelError::EntryPointNotFound {
                        entry_point: script.to_string(),
                        reason: format!("not a declared script. Options: {:?}", options),
                    })
                }
            },
        }
    }

    /// Locate the module and callable of `entry` in the project tree
    pub fn resolve_entry_point(&self, entry: &EntryPoint) -> SatchelResult<ResolvedEntryPoint> {
        let module_file = SOURCE_ROOTS.iter().find_map(|root| {
            entry.module_paths().into_iter().find_map(|rel| {
                let candidate = self.root.join(root).join(&rel);
                candidate.is_file().then(|| (root.to_string(), candidate))
            })
        });

        let (source_root, module_file) = module_file.ok_or_else(|| SatchelError::EntryPointNotFound {
            entry_point: entry.to_string(),
            reason: format!("module '{}' not found under {}", entry.module, self.root.display()),
        })?;

        let source = fs::read_to_string(&module_file)
            .map_err(|e| SatchelError::io(format!("reading {}", module_file.display()), e))?;

        if !defines_name(&source, entry.top_level_name()) {
            return Err(SatchelError::EntryPointNotFound {
                entry_point: entry.to_string(),
                reason: format!(
                    "'{}' is not defined at top level of {}",
                    entry.top_level_name(),
                    module_file.display()
                ),
            });
        }

        debug!("Resolved {} to {}", entry, module_file.display());
        Ok(ResolvedEntryPoint {
            source_root,
            module_file,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn is_dotted_identifier(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

/// Whether module source binds `name` at top level
///
/// A line-based check: definitions, assignments and imports that start in
/// column zero. Imports continued over several lines are joined first.
fn defines_name(source: &str, name: &str) -> bool {
    logical_lines(source).iter().any(|line| {
        if line.starts_with(char::is_whitespace) {
            return false;
        }
        let line = line.trim_end();
        let binds = |rest: &str| {
            rest.strip_prefix(name)
                .is_some_and(|after| after.starts_with(['(', ':', ' ', '=']) || after.is_empty())
        };

        if let Some(rest) = line.strip_prefix("def ") {
            return binds(rest);
        }
        if let Some(rest) = line.strip_prefix("async def ") {
            return binds(rest);
        }
        if let Some(rest) = line.strip_prefix("class ") {
            return binds(rest);
        }
        if line.starts_with("from ") || line.starts_with("import ") {
            return line
                .split(|c: char| c == ',' || c == '(' || c == ')' || c.is_whitespace())
                .any(|token| token == name);
        }
        binds(line) && line[name.len()..].trim_start().starts_with(['=', ':'])
    })
}

/// Source lines with parenthesized or backslash-continued imports joined
fn logical_lines(source: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending: Option<String> = None;
    for line in source.lines() {
        let code = line.split('#').next().unwrap_or_default().trim_end();
        let stmt = match pending.take() {
            Some(mut stmt) => {
                stmt.push(' ');
                stmt.push_str(code.trim_start());
                stmt
            }
            None if line.starts_with("from ") || line.starts_with("import ") => code.to_string(),
            None => {
                lines.push(line.to_string());
                continue;
            }
        };
        if import_continues(&stmt) {
            pending = Some(stmt.trim_end_matches('\\').to_string());
        } else {
            lines.push(stmt);
        }
    }
    lines.extend(pending);
    lines
}

fn import_continues(stmt: &str) -> bool {
    stmt.ends_with('\\') || stmt.matches('(').count() > stmt.matches(')').count()
}
