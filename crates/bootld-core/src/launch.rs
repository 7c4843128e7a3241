//! One launch from bundle to child outcome.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::child::ChildOutcome;
use crate::dylib::DynLib;
use crate::files;
use crate::platform::LaunchPlatform;
use crate::status::{ArchiveStatus, OptionLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMode {
    /// Copy the bundle into a per-run scratch directory and run from there.
    OneFile,
    /// Run in place from the bundle directory.
    OneDir,
}

#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub mode: BundleMode,
    pub bundle_dir: PathBuf,
    /// Executable path relative to the bundle root.
    pub payload: PathBuf,
    /// Full argument vector, `argv[0]` included.
    pub argv: Vec<OsString>,
    /// Shared libraries, relative to the bundle root, that must load from the
    /// staged root before the child is started.
    pub preload: Vec<PathBuf>,
}

/// Rejects payload paths that are absolute or climb out of the bundle.
pub fn validate_payload(payload: &Path) -> Result<()> {
    validate_bundle_path("payload", payload)
}

/// Rejects `path` unless it names something below the bundle root.
pub fn validate_bundle_path(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("{what} path is empty");
    }
    for comp in path.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("{what} must be relative to the bundle: {}", path.display()),
        }
    }
    Ok(())
}

/// Runs `plan` to completion. The scratch directory, if one was created, is
/// removed before this returns, whatever the outcome.
pub fn run(
    platform: &dyn LaunchPlatform,
    plan: &LaunchPlan,
    options: impl OptionLookup + 'static,
) -> Result<ChildOutcome> {
    validate_payload(&plan.payload)?;
    for lib in &plan.preload {
        validate_bundle_path("preload library", lib)?;
    }
    let mut status = ArchiveStatus::new(&plan.bundle_dir, options);

    let result = run_with_status(platform, plan, &mut status);
    if let Some(dir) = status.take_temppath() {
        debug!(target: "bootld", "removing scratch directory {}", dir.display());
        platform.remove_scratch_dir(&dir);
    }
    result
}

fn run_with_status(
    platform: &dyn LaunchPlatform,
    plan: &LaunchPlan,
    status: &mut ArchiveStatus,
) -> Result<ChildOutcome> {
    let root = match plan.mode {
        BundleMode::OneDir => plan.bundle_dir.clone(),
        BundleMode::OneFile => {
            platform.create_scratch_dir(status)?;
            let scratch = status
                .temppath()
                .context("scratch directory missing after creation")?
                .to_path_buf();
            let copied = files::copy_tree(&plan.bundle_dir, &scratch)
                .with_context(|| format!("extract bundle into {}", scratch.display()))?;
            info!(target: "bootld", "extracted {copied} file(s) into {}", scratch.display());
            scratch
        }
    };

    platform
        .stage_library_path(status)
        .context("stage dynamic library search path")?;

    for lib in &plan.preload {
        let path = root.join(lib);
        let loaded =
            DynLib::open(&path).with_context(|| format!("preload {}", lib.display()))?;
        debug!(target: "bootld", "preload {} ok", loaded.path().display());
    }

    let executable = root.join(&plan.payload);
    Ok(platform.spawn_and_wait(&executable, status, &plan.argv))
}
