//! Build command - bundle a Poetry project

use crate::bundle::{stub_from_file, BuiltBundle, BundleBuilder};
use crate::cache::format_bytes;
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::{SatchelError, SatchelResult};
use crate::lockfile::{read_lockset, LockSet, PlatformTag, ReadOptions, LOCKFILE_NAME};
use crate::project::{EntryPoint, Project};
use crate::python::Interpreter;
use crate::ui::{self, TaskSpinner, UiContext};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> SatchelResult<()> {
    let ctx = UiContext::detect();
    let root = project_root(args.project.as_deref())?;
    let project = Project::load(&root)?;
    debug!("Building project {} at {}", project.name, root.display());

    let platform = resolve_platform(&args, config, &project).await?;
    let lockfile = args
        .lockfile
        .clone()
        .unwrap_or_else(|| root.join(LOCKFILE_NAME));
    let options = ReadOptions {
        include_dev: args.include_dev || config.build.include_dev,
    };
    let lockset = read_lockset(&lockfile, platform, &options)?;

    let entry_points = project.entry_points(args.entry_point.as_deref())?;
    let outputs = output_paths(&root, config, args.output.as_deref(), &entry_points);

    let stub = match args.stub {
        Some(ref path) => Some(stub_from_file(path)?),
        None => None,
    };

    ui::section(&ctx, &format!("Bundling {}", project.name));
    ui::key_value(&ctx, "Lockfile", &lockfile.display().to_string());
    ui::key_value(&ctx, "Platform", lockset.platform().as_str());
    ui::key_value(
        &ctx,
        "Dependencies",
        &format!("{} (fingerprint {})", lockset.len(), lockset.fingerprint().short()),
    );
    println!();

    for (entry_point, output) in entry_points.into_iter().zip(outputs) {
        let built = build_one(&ctx, &project, &lockset, entry_point, &output, stub.as_deref(), config)?;
        ui::step_ok_detail(
            &ctx,
            &format!("{} -> {}", built.manifest.entry_point, built.path.display()),
            &format_bytes(built.size),
        );
    }

    Ok(())
}

fn build_one(
    ctx: &UiContext,
    project: &Project,
    lockset: &LockSet,
    entry_point: EntryPoint,
    output: &Path,
    stub: Option<&[u8]>,
    config: &Config,
) -> SatchelResult<BuiltBundle> {
    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Building {}...", entry_point.script));

    let mut builder =
        BundleBuilder::new(project, lockset, entry_point).exclude(config.build.exclude.iter().cloned());
    if let Some(stub) = stub {
        builder = builder.stub(stub.to_vec());
    }

    match builder.build(output) {
        Ok(built) => {
            spinner.clear();
            Ok(built)
        }
        Err(e) => {
            spinner.stop_error("Build failed");
            Err(e)
        }
    }
}

fn project_root(project: Option<&Path>) -> SatchelResult<PathBuf> {
    let root = match project {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir()
            .map_err(|e| SatchelError::io("getting current directory", e))?,
    };
    Ok(root.canonicalize().unwrap_or(root))
}

/// Platform from `--platform`, or probed from the build interpreter
async fn resolve_platform(args: &BuildArgs, config: &Config, project: &Project) -> SatchelResult<PlatformTag> {
    if let Some(ref tag) = args.platform {
        return Ok(PlatformTag::new(tag.clone()));
    }

    let python = args.python.as_deref().unwrap_or(&config.build.python);
    let interpreter = Interpreter::probe(python).await?;
    let tag = interpreter.platform_tag();

    // The bundle still builds; running it needs a compatible interpreter
    if let Err(e) = interpreter.ensure_compatible(&tag, project.requires_python.as_deref()) {
        warn!("{}", e);
    }
    Ok(tag)
}

/// Where each entry point's bundle goes
///
/// With one entry point `--output` names the file; with several it names
/// the directory. The default directory is `build.output_dir` under the
/// project root.
fn output_paths(
    root: &Path,
    config: &Config,
    output: Option<&Path>,
    entry_points: &[EntryPoint],
) -> Vec<PathBuf> {
    let default_dir = root.join(&config.build.output_dir);
    match (output, entry_points) {
        (Some(file), [_]) => vec![file.to_path_buf()],
        (Some(dir), _) => entry_points.iter().map(|e| dir.join(&e.script)).collect(),
        (None, _) => entry_points
            .iter()
            .map(|e| default_dir.join(&e.script))
            .collect(),
    }
}
