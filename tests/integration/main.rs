//! Integration tests for Satchel

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const PLATFORM: &str = "cpython-3.11-x86_64-linux";
    const STUB: &[u8] = b"#!/bin/sh\necho stub\n";

    const PYPROJECT: &str = r#"[tool.poetry]
name = "acme"
version = "0.1.0"
description = ""

[tool.poetry.dependencies]
python = "^3.9"
click = "^8.1"

[tool.poetry.group.dev.dependencies]
pytest = "^8.0"

[tool.poetry.scripts]
acme = "acme.cli:main"
"#;

    const POETRY_LOCK: &str = r#"# This file is automatically @generated by Poetry and should not be changed by hand.

[[package]]
name = "click"
version = "8.1.7"
description = "Composable command line interface toolkit"
optional = false
python-versions = ">=3.7"
groups = ["main"]
files = [
    {file = "click-8.1.7-py3-none-any.whl", hash = "sha256:ae74fb96c20a0277a1d615f1e4d73c8414f5a98db8b799a7931d1582f3390c28"},
    {file = "click-8.1.7.tar.gz", hash = "sha256:ca9853ad459e787e2192211578cc907e7594e294c7ccc834310722b41b9ca6de"},
]

[[package]]
name = "pytest"
version = "8.3.3"
description = "pytest: simple powerful testing with Python"
optional = false
python-versions = ">=3.8"
groups = ["dev"]
files = [
    {file = "pytest-8.3.3-py3-none-any.whl", hash = "sha256:a6853c7375b2663155079443d2e45de913a911a11d669df02a50814944db57b2"},
]

[metadata]
lock-version = "2.1"
python-versions = "^3.9"
content-hash = "4f2ab1c0b1b54b1c45d0e0dc27e3a3a5ed1f0a1a07e7f1c5b2f4b6e5d3c2a190"
"#;

    /// A command isolated from the user's config and cache
    fn satchel(home: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("satchel");
        cmd.env("SATCHEL_CONFIG", home.join("config.toml"))
            .env("SATCHEL_CACHE_DIR", home.join("cache"))
            .env_remove("SATCHEL_PYTHON");
        cmd
    }

    fn sample_project(dir: &Path) -> PathBuf {
        let root = dir.join("acme");
        fs::create_dir_all(root.join("acme")).unwrap();
        fs::write(root.join("pyproject.toml"), PYPROJECT).unwrap();
        fs::write(root.join("poetry.lock"), POETRY_LOCK).unwrap();
        fs::write(root.join("acme/__init__.py"), "").unwrap();
        fs::write(
            root.join("acme/cli.py"),
            "import sys\n\n\ndef main():\n    print('hello', *sys.argv[1:])\n    return 0\n",
        )
        .unwrap();
        root
    }

    fn build_bundle(home: &Path, project: &Path, output: &Path, stub: Option<&Path>) {
        let mut cmd = satchel(home);
        cmd.arg("build")
            .arg(project)
            .args(["--platform", PLATFORM])
            .arg("--output")
            .arg(output);
        if let Some(stub) = stub {
            cmd.arg("--stub").arg(stub);
        }
        cmd.assert().success();
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("self-executing bundles"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("satchel"));
    }

    #[test]
    fn config_path() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_set_persists() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .args(["config", "set", "cache.max_entries", "3"])
            .assert()
            .success();
        satchel(home.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_entries = 3"));
    }

    #[test]
    fn cache_path_honours_env() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                home.path().join("cache").to_string_lossy().into_owned(),
            ));
    }

    #[test]
    fn cache_list_empty() {
        let home = TempDir::new().unwrap();
        satchel(home.path())
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached environments"));
    }

    #[test]
    fn lock_prints_main_group_only() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        satchel(home.path())
            .arg("lock")
            .arg(&project)
            .args(["--platform", PLATFORM, "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("click==8.1.7"))
            .stdout(predicate::str::contains("pytest").not());
    }

    #[test]
    fn lock_include_dev() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        satchel(home.path())
            .arg("lock")
            .arg(&project)
            .args(["--platform", PLATFORM, "--format", "plain", "--include-dev"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pytest==8.3.3"));
    }

    #[test]
    fn lock_missing_lockfile() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        fs::remove_file(project.join("poetry.lock")).unwrap();
        satchel(home.path())
            .arg("lock")
            .arg(&project)
            .args(["--platform", PLATFORM])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Lockfile not found"))
            .stderr(predicate::str::contains("poetry lock"));
    }

    #[test]
    fn build_writes_bundle_with_stub() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        let stub = home.path().join("stub.sh");
        fs::write(&stub, STUB).unwrap();
        let output = home.path().join("out/acme");

        build_bundle(home.path(), &project, &output, Some(&stub));

        let bytes = fs::read(&output).unwrap();
        assert!(bytes.starts_with(STUB));
        // Ends in a ZIP end-of-central-directory record with no comment
        assert_eq!(&bytes[bytes.len() - 22..bytes.len() - 18], b"PK\x05\x06");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn build_unknown_script_fails() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        satchel(home.path())
            .arg("build")
            .arg(&project)
            .arg("nope")
            .args(["--platform", PLATFORM])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Entry point not found"));
    }

    #[test]
    fn inspect_reports_manifest() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        let stub = home.path().join("stub.sh");
        fs::write(&stub, STUB).unwrap();
        let output = home.path().join("acme-bundle");
        build_bundle(home.path(), &project, &output, Some(&stub));

        let assert = satchel(home.path())
            .arg("inspect")
            .arg(&output)
            .args(["--format", "json"])
            .assert()
            .success();
        let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

        assert_eq!(json["manifest"]["name"], "acme");
        assert_eq!(json["manifest"]["platform"], PLATFORM);
        assert_eq!(json["manifest"]["records"].as_array().unwrap().len(), 1);
        assert_eq!(json["cache"]["state"], "absent");
        assert_eq!(json["stub_bytes"], STUB.len());
    }

    #[test]
    fn inspect_extracts_payload() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        let stub = home.path().join("stub.sh");
        fs::write(&stub, STUB).unwrap();
        let output = home.path().join("acme-bundle");
        build_bundle(home.path(), &project, &output, Some(&stub));

        let extract = home.path().join("extracted");
        satchel(home.path())
            .arg("inspect")
            .arg(&output)
            .arg("--extract")
            .arg(&extract)
            .assert()
            .success();
        assert!(extract.join("acme/cli.py").is_file());
        assert!(extract.join("pyproject.toml").is_file());
    }

    #[test]
    fn inspect_rejects_plain_file() {
        let home = TempDir::new().unwrap();
        let plain = home.path().join("plain");
        fs::write(&plain, b"not a bundle at all, just some bytes").unwrap();
        satchel(home.path())
            .arg("inspect")
            .arg(&plain)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not a satchel bundle"));
    }

    /// A bundle built on the satchel binary runs its bootstrap, which
    /// fails in the bootstrap phase when the interpreter is missing
    #[test]
    fn bundle_reports_bootstrap_failure() {
        let home = TempDir::new().unwrap();
        let project = sample_project(home.path());
        let output = home.path().join("acme-bin");
        build_bundle(home.path(), &project, &output, None);

        Command::new(&output)
            .arg("--help")
            .env("SATCHEL_CACHE_DIR", home.path().join("cache"))
            .env("SATCHEL_CONFIG", home.path().join("config.toml"))
            .env("SATCHEL_PYTHON", home.path().join("no-such-python"))
            .assert()
            .code(241)
            .stderr(predicate::str::contains("satchel [bootstrap/cache] error"))
            .stdout(predicate::str::contains("Usage").not());
    }

    fn python3() -> Option<&'static str> {
        let found = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        found.then_some("python3")
    }

    fn envs_tree(cache: &Path) -> Vec<(PathBuf, u64, std::time::SystemTime)> {
        let mut entries: Vec<_> = walkdir::WalkDir::new(cache.join("envs"))
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let meta = e.metadata().unwrap();
                (e.path().to_path_buf(), meta.len(), meta.modified().unwrap())
            })
            .collect();
        entries.sort();
        entries
    }

    /// Build for the local interpreter and run the result twice: the first
    /// run prepares the environment, the second reuses it untouched
    #[test]
    fn bundle_runs_entry_point_with_real_python() {
        let Some(python) = python3() else {
            eprintln!("python3 not found; skipping");
            return;
        };
        let home = TempDir::new().unwrap();
        let root = home.path().join("hello");
        fs::create_dir_all(root.join("hello")).unwrap();
        fs::write(
            root.join("pyproject.toml"),
            "[tool.poetry]\nname = \"hello\"\nversion = \"0.1.0\"\n\n[tool.poetry.scripts]\nhello = \"hello.cli:main\"\n",
        )
        .unwrap();
        fs::write(root.join("poetry.lock"), "[metadata]\nlock-version = \"2.1\"\n").unwrap();
        fs::write(root.join("hello/__init__.py"), "").unwrap();
        fs::write(
            root.join("hello/cli.py"),
            "import sys\n\n\ndef main():\n    print('args:', ' '.join(sys.argv[1:]))\n    return 7\n",
        )
        .unwrap();

        let output = home.path().join("hello-bin");
        satchel(home.path())
            .arg("build")
            .arg(&root)
            .args(["--python", python])
            .arg("--output")
            .arg(&output)
            .assert()
            .success();

        // The payload is an ordinary ZIP to Python's own reader
        let listing = std::process::Command::new(python)
            .args(["-m", "zipfile", "-l"])
            .arg(&output)
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&listing.stdout).contains("hello/cli.py"));

        let cache = home.path().join("cache");
        let run = || {
            let mut cmd = Command::new(&output);
            cmd.args(["one", "--two"])
                .env("SATCHEL_CACHE_DIR", &cache)
                .env("SATCHEL_CONFIG", home.path().join("config.toml"))
                .env("SATCHEL_PYTHON", python);
            cmd
        };

        run()
            .assert()
            .code(7)
            .stdout(predicate::str::contains("args: one --two"));
        let before = envs_tree(&cache);
        assert!(!before.is_empty());

        run()
            .assert()
            .code(7)
            .stdout(predicate::str::contains("args: one --two"));
        assert_eq!(envs_tree(&cache), before);
    }
}
