//! Runtime bootstrap
//!
//! Runs first in every bundle. When the executable ends in a satchel
//! archive, the bootstrap makes the cached environment ready (building it
//! at most once per machine) and hands control to the wrapped entry
//! point. Other executables fall through to the CLI.

use crate::bundle::{BundleManifest, BundleReader};
use crate::cache::{
    CacheManager, EntryState, EnvironmentContent, EnvironmentSpec, ReadyEnvironment, UseLease,
};
use crate::config::ConfigManager;
use crate::dispatch::{write_launcher, Dispatcher, Launch, APP_DIR};
use crate::error::{SatchelError, SatchelResult};
use crate::installer::{Installer, PipInstaller};
use crate::python::Interpreter;
use crate::ui::{TaskSpinner, UiContext};
use std::ffi::OsString;
use std::path::Path;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the bootstrap's log filter
pub const LOG_ENV: &str = "SATCHEL_LOG";

/// The bundle appended to the running executable, if any
pub fn embedded_bundle() -> SatchelResult<Option<BundleReader>> {
    let exe = std::env::current_exe()
        .map_err(|e| SatchelError::io("locating the running executable", e))?;
    BundleReader::probe(&exe)
}

/// Unpacks a bundle's project tree and launcher into a staging directory
pub struct BundleContent<'a> {
    reader: &'a BundleReader,
}

impl<'a> BundleContent<'a> {
    pub fn new(reader: &'a BundleReader) -> Self {
        Self { reader }
    }
}

impl EnvironmentContent for BundleContent<'_> {
    fn materialize(&self, staging: &Path) -> SatchelResult<()> {
        self.reader.extract_payload(&staging.join(APP_DIR))?;
        write_launcher(staging, self.reader.manifest())?;
        Ok(())
    }
}

/// Turns an opened bundle into a launch
pub struct Bootstrap<'a> {
    reader: &'a BundleReader,
    manager: &'a CacheManager,
    installer: &'a dyn Installer,
    python: String,
    verify_interpreter: bool,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        reader: &'a BundleReader,
        manager: &'a CacheManager,
        installer: &'a dyn Installer,
        python: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            manager,
            installer,
            python: python.into(),
            verify_interpreter: true,
        }
    }

    /// Skip probing the interpreter before a cold build
    pub fn skip_interpreter_check(mut self) -> Self {
        self.verify_interpreter = false;
        self
    }

    fn manifest(&self) -> &BundleManifest {
        self.reader.manifest()
    }

    /// Environment this bundle runs in
    pub fn spec(&self) -> SatchelResult<EnvironmentSpec> {
        let manifest = self.manifest();
        let lockset = manifest.lockset().map_err(|reason| SatchelError::CorruptBundle {
            path: self.reader.path().to_path_buf(),
            reason,
        })?;
        Ok(EnvironmentSpec::new(
            lockset,
            manifest.source_digest.clone(),
            self.python.clone(),
        ))
    }

    /// Make the environment ready and build the launch for `args`
    ///
    /// The returned lease keeps the environment from being evicted and
    /// must be held until the application exits. A corrupt environment
    /// found at dispatch time is invalidated and rebuilt once; a second
    /// failure is returned.
    pub async fn prepare(&self, args: Vec<OsString>) -> SatchelResult<(Launch, UseLease)> {
        let spec = self.spec()?;
        let cold = !matches!(self.manager.probe(&spec), EntryState::Ready(_));

        if cold && self.verify_interpreter {
            let interpreter = Interpreter::probe(&self.python).await?;
            interpreter.ensure_compatible(
                &self.manifest().platform,
                self.manifest().requires_python.as_deref(),
            )?;
        }

        let mut spinner = TaskSpinner::new(&UiContext::detect_stderr());
        if cold {
            spinner.start(&format!(
                "Preparing {} ({} packages)",
                self.manifest().name,
                spec.lockset.len()
            ));
        }

        let result = match self.attempt(&spec, args.clone()).await {
            Err(e) if e.is_retryable() => {
                warn!("{}; rebuilding environment {}", e, spec.key);
                self.manager.invalidate(&spec.key).await?;
                self.attempt(&spec, args).await
            }
            other => other,
        };

        match result {
            Ok((launch, env, lease)) => {
                if env.built {
                    spinner.stop(&format!("Prepared {}", self.manifest().name));
                } else {
                    spinner.clear();
                }
                Ok((launch, lease))
            }
            Err(e) => {
                if cold {
                    spinner.stop_error(&format!("Could not prepare {}", self.manifest().name));
                }
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        spec: &EnvironmentSpec,
        args: Vec<OsString>,
    ) -> SatchelResult<(Launch, ReadyEnvironment, UseLease)> {
        let content = BundleContent::new(self.reader);
        let env = self.manager.ensure(spec, self.installer, &content).await?;
        let lease = self.manager.lease(spec).await?;
        debug!(
            "Environment {} at {} (built: {})",
            env.key,
            env.path.display(),
            env.built
        );
        let launch = Dispatcher::new(self.python.clone()).prepare(
            &env,
            self.manifest(),
            self.reader.path(),
            args,
        )?;
        Ok((launch, env, lease))
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("satchel=warn"));
    // A subscriber may already be installed when embedded in tests
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the bundle in `reader` with this process's arguments
///
/// Returns the application's exit code where the platform cannot replace
/// the process image.
pub async fn run(reader: BundleReader) -> SatchelResult<i32> {
    init_logging();

    let config = match ConfigManager::from_env().load().await {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring configuration: {}", e);
            Default::default()
        }
    };

    let manager = CacheManager::new(ConfigManager::cache_dir(&config)).with_policy((&config.cache).into());
    let python = ConfigManager::runtime_python(&config);
    let installer = PipInstaller::new(python.clone());
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    let (launch, lease) = Bootstrap::new(&reader, &manager, &installer, python)
        .prepare(args)
        .await?;
    lease.keep_across_exec()?;
    let result = launch.exec();
    drop(lease);
    result
}
