//! Dynamic-loader search path staging.
//!
//! Before the child starts, the scratch (or installation) directory is put in
//! front of the loader's search-path variable. The previous value is kept in
//! `<VAR>_ORIG` so the application can restore the system search path before
//! it spawns external tools that must not pick up the bundled libraries.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::env::{get_env, set_env};
#[cfg(target_os = "macos")]
use crate::env::unset_env;
use crate::status::ArchiveStatus;

/// Suffix of the shadow variable holding the pre-launch value.
pub const ORIG_SUFFIX: &str = "_ORIG";

#[cfg(windows)]
pub const PATH_LIST_SEP: &str = ";";
#[cfg(not(windows))]
pub const PATH_LIST_SEP: &str = ":";

/// Loader search-path variable of this platform, if it has one.
#[cfg(target_os = "aix")]
pub const LIBRARY_PATH_VAR: Option<&str> = Some("LIBPATH");
#[cfg(all(unix, not(any(target_os = "aix", target_os = "macos"))))]
pub const LIBRARY_PATH_VAR: Option<&str> = Some("LD_LIBRARY_PATH");
#[cfg(any(windows, target_os = "macos"))]
pub const LIBRARY_PATH_VAR: Option<&str> = None;

/// dyld overrides scrubbed on macOS. Bundled libraries are found through
/// `@executable_path`-relative install names, and these variables would let
/// the host environment redirect that resolution.
#[cfg(target_os = "macos")]
pub const DYLD_OVERRIDE_VARS: &[&str] = &[
    "DYLD_FRAMEWORK_PATH",
    "DYLD_FALLBACK_FRAMEWORK_PATH",
    "DYLD_VERSIONED_FRAMEWORK_PATH",
    "DYLD_LIBRARY_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "DYLD_VERSIONED_LIBRARY_PATH",
    "DYLD_ROOT_PATH",
];

/// Stages the process environment for the child described by `status`.
#[cfg(target_os = "macos")]
pub fn set_environment(_status: &ArchiveStatus) -> Result<()> {
    for name in DYLD_OVERRIDE_VARS {
        unset_env(name)?;
    }
    Ok(())
}

/// Stages the process environment for the child described by `status`.
#[cfg(not(target_os = "macos"))]
pub fn set_environment(status: &ArchiveStatus) -> Result<()> {
    match LIBRARY_PATH_VAR {
        Some(var) => set_dynamic_library_path(var, status.library_dir()),
        None => Ok(()),
    }
}

/// Prepends `dir` to `var`, saving the previous value in `<var>_ORIG`.
///
/// The shadow variable is only written when `var` had a value. Staging twice
/// overwrites the shadow with the already-staged value; nesting is not
/// supported.
pub fn set_dynamic_library_path(var: &str, dir: &Path) -> Result<()> {
    let orig_var = format!("{var}{ORIG_SUFFIX}");
    let orig = get_env(var);
    if let Some(orig) = orig.as_deref() {
        set_env(&orig_var, orig).with_context(|| format!("set {orig_var}"))?;
        debug!(target: "bootld", "{orig_var}={}", orig.to_string_lossy());
    }

    let new_path = strjoin(Some(dir.as_os_str()), PATH_LIST_SEP, orig.as_deref());
    set_env(var, &new_path).with_context(|| format!("set {var}"))?;
    debug!(target: "bootld", "{var}={}", new_path.to_string_lossy());
    Ok(())
}

/// Joins two optional strings; `sep` is only inserted when both are
/// non-empty.
pub fn strjoin(first: Option<&OsStr>, sep: &str, second: Option<&OsStr>) -> OsString {
    let first = first.unwrap_or_default();
    let second = second.unwrap_or_default();
    let mut out = OsString::with_capacity(first.len() + sep.len() + second.len());
    out.push(first);
    if !first.is_empty() && !second.is_empty() {
        out.push(sep);
    }
    out.push(second);
    out
}
