use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bootld_core::{get_env, run, ChildOutcome, LaunchPlan, NativePlatform};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod manifest;

/// Log filter directives, `tracing_subscriber` syntax.
const ENV_LOG: &str = "BOOTLD_LOG";
/// Overrides the `<exe>.bundle` sidecar directory.
const ENV_BUNDLE_DIR: &str = "BOOTLD_BUNDLE_DIR";

fn main() -> ExitCode {
    init_logging();
    match try_main() {
        Ok(outcome) => outcome.reproduce(),
        Err(err) => {
            let _ = writeln_stderr(format!("bootld: {err:#}\n"));
            ExitCode::from(1)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn try_main() -> Result<ChildOutcome> {
    let bundle_dir = resolve_bundle_dir()?;
    let manifest = manifest::load(&bundle_dir)?;
    debug!(
        target: "bootld",
        "bundle {} mode={:?} payload={}",
        bundle_dir.display(),
        manifest.mode,
        manifest.payload
    );

    let argv: Vec<OsString> = std::env::args_os().collect();
    let plan = LaunchPlan {
        mode: manifest.mode.into(),
        bundle_dir,
        payload: manifest.payload_path(),
        argv,
        preload: manifest.preload_paths(),
    };
    run(&NativePlatform, &plan, manifest.options)
}

fn resolve_bundle_dir() -> Result<PathBuf> {
    if let Some(dir) = get_env(ENV_BUNDLE_DIR) {
        return Ok(PathBuf::from(dir));
    }
    let exe = std::env::current_exe().context("current_exe")?;
    Ok(manifest::sidecar_dir_for_exe(&exe))
}

fn writeln_stderr(msg: String) -> std::io::Result<()> {
    use std::io::Write;
    let mut stderr = std::io::stderr();
    stderr.write_all(msg.as_bytes())?;
    stderr.flush()
}
