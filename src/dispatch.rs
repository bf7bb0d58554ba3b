//! Entry-point dispatch
//!
//! A ready environment holds `packages/<name>/` (one per record), the
//! project tree under `app/` and a generated launcher. Dispatch runs the
//! interpreter on that launcher with the caller's arguments, working
//! directory and standard streams untouched.

use crate::bundle::BundleManifest;
use crate::cache::{ReadyEnvironment, PACKAGES_DIR};
use crate::error::{SatchelError, SatchelResult};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Launcher directory inside an environment
pub const LAUNCHER_DIR: &str = "__satchel__";

/// Launcher script name
pub const LAUNCHER_FILE: &str = "launch.py";

/// Project tree directory inside an environment
pub const APP_DIR: &str = "app";

/// Environment variable naming the running bundle (becomes `sys.argv[0]`)
pub const BUNDLE_ENV: &str = "SATCHEL_BUNDLE";

const LAUNCHER_TEMPLATE: &str = r#"# Generated by satchel. Do not edit.
import importlib
import os
import site
import sys

ENV = os.path.dirname(os.path.dirname(os.path.abspath(__file__)))
PACKAGES = @PACKAGES@
SOURCE_ROOT = @SOURCE_ROOT@
MODULE = @MODULE@
CALLABLE = @CALLABLE@


def main():
    # Started with -S: the interpreter's own site-packages never reach
    # sys.path, so only the locked packages resolve third-party imports
    for name in ("setquit", "setcopyright", "sethelper"):
        getattr(site, name, lambda: None)()
    sys.path[0] = os.path.join(ENV, "app", SOURCE_ROOT)
    for name in PACKAGES:
        site.addsitedir(os.path.join(ENV, "packages", name))
    sys.argv[0] = os.environ.get("SATCHEL_BUNDLE", sys.argv[0])

    target = importlib.import_module(MODULE)
    for attr in CALLABLE.split("."):
        target = getattr(target, attr)
    sys.exit(target())


if __name__ == "__main__":
    main()
"#;

/// Render the launcher for a bundle
pub fn launcher_script(manifest: &BundleManifest) -> SatchelResult<String> {
    let packages: Vec<&str> = manifest.records.iter().map(|r| r.dir_name()).collect();
    Ok(LAUNCHER_TEMPLATE
        .replace("@PACKAGES@", &serde_json::to_string(&packages)?)
        .replace("@SOURCE_ROOT@", &serde_json::to_string(&manifest.source_root)?)
        .replace("@MODULE@", &serde_json::to_string(&manifest.entry_point.module)?)
        .replace("@CALLABLE@", &serde_json::to_string(&manifest.entry_point.callable)?))
}

/// Write the launcher into an environment (or staging) directory
pub fn write_launcher(env_dir: &Path, manifest: &BundleManifest) -> SatchelResult<PathBuf> {
    let dir = env_dir.join(LAUNCHER_DIR);
    fs::create_dir_all(&dir)
        .map_err(|e| SatchelError::io(format!("creating {}", dir.display()), e))?;
    let path = dir.join(LAUNCHER_FILE);
    fs::write(&path, launcher_script(manifest)?)
        .map_err(|e| SatchelError::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}

/// A fully specified process launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, OsString)>,
}

impl Launch {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }

    /// Hand the process over to the application
    ///
    /// On unix this replaces the current process image and only returns on
    /// failure. Elsewhere the child is awaited and its exit code returned.
    #[cfg(unix)]
    pub fn exec(self) -> SatchelResult<i32> {
        use std::os::unix::process::CommandExt;
        debug!("exec {} {:?}", self.program, self.args);
        let source = self.command().exec();
        Err(SatchelError::Dispatch {
            program: self.program,
            source,
        })
    }

    #[cfg(not(unix))]
    pub fn exec(self) -> SatchelResult<i32> {
        debug!("spawn {} {:?}", self.program, self.args);
        let status = self.command().status().map_err(|source| SatchelError::Dispatch {
            program: self.program.clone(),
            source,
        })?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Turns a ready environment into a [`Launch`]
#[derive(Debug, Clone)]
pub struct Dispatcher {
    python: String,
}

impl Dispatcher {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Validate `env` and build the launch for `manifest`'s entry point
    ///
    /// A missing launcher, package directory or entry module means the
    /// environment is corrupt.
    pub fn prepare(
        &self,
        env: &ReadyEnvironment,
        manifest: &BundleManifest,
        bundle: &Path,
        args: Vec<OsString>,
    ) -> SatchelResult<Launch> {
        let corrupt = |reason: String| SatchelError::CorruptEnvironment {
            path: env.path.clone(),
            reason,
        };

        let launcher = env.path.join(LAUNCHER_DIR).join(LAUNCHER_FILE);
        if !launcher.is_file() {
            return Err(corrupt("launcher script missing".to_string()));
        }

        for record in &manifest.records {
            let dir = env.path.join(PACKAGES_DIR).join(record.dir_name());
            if !dir.is_dir() {
                return Err(corrupt(format!("package directory for {} missing", record)));
            }
        }

        let source_root = env.path.join(APP_DIR).join(&manifest.source_root);
        let found = manifest
            .entry_point
            .module_paths()
            .iter()
            .any(|rel| source_root.join(rel).is_file());
        if !found {
            return Err(corrupt(format!(
                "entry point {} not found under {}",
                manifest.entry_point,
                source_root.display()
            )));
        }

        let mut launch_args: Vec<OsString> =
            vec!["-s".into(), "-S".into(), "-B".into(), launcher.into()];
        launch_args.extend(args);

        Ok(Launch {
            program: self.python.clone(),
            args: launch_args,
            env: vec![(BUNDLE_ENV.to_string(), bundle.as_os_str().to_os_string())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BUNDLE_FORMAT;
    use crate::cache::{CompletionMarker, EnvironmentKey};
    use crate::lockfile::{DependencyRecord, Fingerprint, PlatformTag};
    use crate::project::EntryPoint;
    use chrono::Utc;
    use tempfile::TempDir;

    fn manifest(source_root: &str) -> BundleManifest {
        manifest_with(source_root, vec![DependencyRecord::new("alpha", "1.0", "sha256:aa")])
    }

    fn manifest_with(source_root: &str, records: Vec<DependencyRecord>) -> BundleManifest {
        let platform = PlatformTag::new("cpython-3.11-x86_64-linux");
        BundleManifest {
            format: BUNDLE_FORMAT,
            name: "acme".to_string(),
            project: "acme".to_string(),
            entry_point: EntryPoint::parse("acme", "pkg.main:run").unwrap(),
            source_root: source_root.to_string(),
            fingerprint: Fingerprint::compute(&records, &platform),
            platform,
            source_digest: "d".repeat(64),
            requires_python: None,
            records,
            satchel_version: "0.0.0".to_string(),
            built_at: BundleManifest::format_built_at(Utc::now()),
        }
    }

    fn environment(dir: &Path, manifest: &BundleManifest) -> ReadyEnvironment {
        for record in &manifest.records {
            fs::create_dir_all(dir.join(PACKAGES_DIR).join(record.dir_name())).unwrap();
        }
        let module = dir.join(APP_DIR).join(&manifest.source_root).join("pkg");
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("main.py"), "def run():\n    return 3\n").unwrap();
        write_launcher(dir, manifest).unwrap();

        ReadyEnvironment {
            key: EnvironmentKey::parse("0123456789abcdef").unwrap(),
            path: dir.to_path_buf(),
            marker: CompletionMarker {
                key: EnvironmentKey::parse("0123456789abcdef").unwrap(),
                fingerprint: manifest.fingerprint.as_str().to_string(),
                source_digest: manifest.source_digest.clone(),
                platform: manifest.platform.clone(),
                python: "python3".to_string(),
                records: 1,
                completed_at: Utc::now(),
            },
            built: false,
        }
    }

    #[test]
    fn launcher_embeds_entry_point() {
        let script = launcher_script(&manifest("src")).unwrap();
        assert!(script.contains(r#"PACKAGES = ["alpha"]"#));
        assert!(script.contains(r#"SOURCE_ROOT = "src""#));
        assert!(script.contains(r#"MODULE = "pkg.main""#));
        assert!(script.contains(r#"CALLABLE = "run""#));
        assert!(!script.contains('@'));
    }

    #[test]
    fn prepare_forwards_arguments_verbatim() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest("");
        let env = environment(dir.path(), &manifest);

        let args: Vec<OsString> = vec!["--flag".into(), "two words".into(), "-s".into()];
        let launch = Dispatcher::new("python3")
            .prepare(&env, &manifest, Path::new("/usr/local/bin/acme"), args.clone())
            .unwrap();

        assert_eq!(launch.program, "python3");
        assert_eq!(&launch.args[..3], ["-s", "-S", "-B"].map(OsString::from).as_slice());
        assert_eq!(&launch.args[4..], args.as_slice());
        assert_eq!(
            PathBuf::from(&launch.args[3]),
            dir.path().join(LAUNCHER_DIR).join(LAUNCHER_FILE)
        );
        assert_eq!(
            launch.env,
            vec![(BUNDLE_ENV.to_string(), OsString::from("/usr/local/bin/acme"))]
        );
    }

    #[test]
    fn missing_entry_module_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest("");
        let env = environment(dir.path(), &manifest);
        fs::remove_file(dir.path().join("app/pkg/main.py")).unwrap();

        let err = Dispatcher::new("python3")
            .prepare(&env, &manifest, Path::new("acme"), vec![])
            .unwrap_err();
        assert!(matches!(err, SatchelError::CorruptEnvironment { .. }));
    }

    #[test]
    fn missing_launcher_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest("");
        let env = environment(dir.path(), &manifest);
        fs::remove_dir_all(dir.path().join(LAUNCHER_DIR)).unwrap();

        let err = Dispatcher::new("python3")
            .prepare(&env, &manifest, Path::new("acme"), vec![])
            .unwrap_err();
        assert!(matches!(err, SatchelError::CorruptEnvironment { .. }));
    }

    fn python3() -> Option<&'static str> {
        let ok = Command::new("python3")
            .args(["-c", "pass"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        ok.then_some("python3")
    }

    #[test]
    fn locked_package_shadows_interpreter_site_packages() {
        let Some(python) = python3() else {
            eprintln!("python3 not available; skipping");
            return;
        };
        let dir = TempDir::new().unwrap();
        // pip ships with nearly every interpreter, so lock a copy of it
        let manifest = manifest_with("", vec![DependencyRecord::new("pip", "0.0", "sha256:aa")]);
        let env = environment(dir.path(), &manifest);
        let locked = dir.path().join("packages/pip/pip");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("__init__.py"), "__version__ = 'LOCKED-0.0'\n").unwrap();
        fs::write(
            dir.path().join("app/pkg/main.py"),
            "import sys\n\n\ndef run():\n    import pip\n    print(pip.__version__)\n    exit(5)\n",
        )
        .unwrap();

        let output = Dispatcher::new(python)
            .prepare(&env, &manifest, Path::new("acme"), vec![])
            .unwrap()
            .command()
            .output()
            .unwrap();

        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "LOCKED-0.0");
        assert_eq!(output.status.code(), Some(5));
    }

    #[cfg(unix)]
    #[test]
    fn exec_failure_is_dispatch_error() {
        let launch = Launch {
            program: "/nonexistent/satchel-test-python".to_string(),
            args: vec![],
            env: vec![],
        };
        assert!(matches!(launch.exec(), Err(SatchelError::Dispatch { .. })));
    }
}
