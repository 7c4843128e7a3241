//! Process-private scratch directory.
//!
//! The directory is created at most once per process and removed exactly
//! once, after the child has been reaped, whatever the reason for exiting.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::env::get_env;
use crate::error::LaunchError;
use crate::status::{ArchiveStatus, OPT_RUNTIME_TMPDIR};

/// Name prefix of every scratch directory.
pub const SCRATCH_PREFIX: &str = "_MEI";

/// Name attempts per candidate root where directory creation is not atomic.
#[cfg(any(windows, test))]
const CREATE_ATTEMPTS: u32 = 5;

#[cfg(unix)]
const ENV_CANDIDATES: &[&str] = &["TMPDIR", "TEMP", "TMP"];
#[cfg(unix)]
const DIR_CANDIDATES: &[&str] = &["/tmp", "/var/tmp", "/usr/tmp"];

/// Creates the scratch directory unless the record already has one.
///
/// Fails with [`LaunchError::ScratchUnavailable`] when no candidate root
/// accepts a new directory; the record is left untouched in that case.
pub fn create_temp_path(status: &mut ArchiveStatus) -> Result<()> {
    if status.has_temp_directory() {
        return Ok(());
    }

    let runtime_tmpdir = status.get_option(OPT_RUNTIME_TMPDIR);
    if let Some(dir) = runtime_tmpdir.as_deref() {
        debug!(target: "bootld", "found runtime-tmpdir {dir}");
    }

    let path = get_temp_path(runtime_tmpdir.as_deref())?;
    debug!(target: "bootld", "created scratch directory {}", path.display());
    status.set_temppath(path);
    Ok(())
}

/// Creates a uniquely named directory under the first usable root.
///
/// With `runtime_tmpdir` only that root is tried.
pub fn get_temp_path(runtime_tmpdir: Option<&str>) -> Result<PathBuf> {
    get_temp_path_with(runtime_tmpdir, &get_env)
}

/// [`get_temp_path`] reading the candidate variables through `lookup`.
pub fn get_temp_path_with(
    runtime_tmpdir: Option<&str>,
    lookup: &dyn Fn(&str) -> Option<OsString>,
) -> Result<PathBuf> {
    let mut checked: Vec<PathBuf> = Vec::new();
    for root in candidate_roots(runtime_tmpdir, lookup)? {
        match make_unique_dir(&root) {
            Ok(path) => return Ok(path),
            Err(err) => {
                debug!(target: "bootld", "cannot create scratch directory under {}: {err}", root.display());
                checked.push(root);
            }
        }
    }
    Err(LaunchError::ScratchUnavailable { checked }.into())
}

fn candidate_roots(
    runtime_tmpdir: Option<&str>,
    #[cfg_attr(not(unix), allow(unused_variables))] lookup: &dyn Fn(&str) -> Option<OsString>,
) -> Result<Vec<PathBuf>> {
    if let Some(dir) = runtime_tmpdir {
        let abs = std::path::absolute(dir)
            .with_context(|| format!("resolve runtime-tmpdir: {dir}"))?;
        return Ok(vec![abs]);
    }

    let mut roots: Vec<PathBuf> = Vec::new();
    #[cfg(unix)]
    {
        for name in ENV_CANDIDATES {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                if let Ok(abs) = std::path::absolute(PathBuf::from(value)) {
                    roots.push(abs);
                }
            }
        }
        roots.extend(DIR_CANDIDATES.iter().map(PathBuf::from));
    }
    #[cfg(windows)]
    roots.push(std::env::temp_dir());
    Ok(roots)
}

#[cfg(unix)]
fn make_unique_dir(root: &Path) -> io::Result<PathBuf> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStringExt as _;

    let template = root.join(format!("{SCRATCH_PREFIX}XXXXXX"));
    let mut buf = CString::new(template.into_os_string().into_vec())?.into_bytes_with_nul();
    // mkdtemp rewrites the trailing XXXXXX in place.
    let ret = unsafe { libc::mkdtemp(buf.as_mut_ptr().cast()) };
    if ret.is_null() {
        return Err(io::Error::last_os_error());
    }
    buf.pop();
    Ok(PathBuf::from(OsString::from_vec(buf)))
}

#[cfg(windows)]
fn make_unique_dir(root: &Path) -> io::Result<PathBuf> {
    let prefix = format!("{SCRATCH_PREFIX}{}", std::process::id());
    retry_unique_dir(root, CREATE_ATTEMPTS, |attempt| {
        format!("{prefix}{}", name_nonce(attempt))
    })
}

#[cfg(windows)]
fn name_nonce(attempt: u32) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos ^ attempt.wrapping_mul(0x9e37_79b9))
}

/// Tries up to `attempts` generated names, giving up on the first error
/// that is not a name collision.
#[cfg(any(windows, test))]
fn retry_unique_dir(
    root: &Path,
    attempts: u32,
    mut next_name: impl FnMut(u32) -> String,
) -> io::Result<PathBuf> {
    let mut last_err = io::Error::new(io::ErrorKind::AlreadyExists, "no name attempts made");
    for attempt in 0..attempts {
        let candidate = root.join(next_name(attempt));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => last_err = err,
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

/// Removes `dir` and everything below it, best effort.
///
/// Entries that disappear while the walk is in progress are skipped.
/// Symbolic links are removed, never followed, and the walk does not descend
/// into directories on another device than `dir`.
pub fn remove_temp_path(dir: &Path) {
    if let Err(err) = std::fs::symlink_metadata(dir) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(target: "bootld", "cannot stat {}: {err}", dir.display());
        }
        return;
    }
    remove_tree(dir);
}

/// Removes the record's scratch directory, if it has one.
pub fn cleanup(status: &mut ArchiveStatus) {
    if let Some(dir) = status.take_temppath() {
        debug!(target: "bootld", "removing scratch directory {}", dir.display());
        remove_temp_path(&dir);
    }
}

fn remove_tree(dir: &Path) {
    let walk = WalkDir::new(dir)
        .follow_links(false)
        .follow_root_links(false)
        .same_file_system(true)
        .contents_first(true);
    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let vanished = err
                    .io_error()
                    .is_some_and(|e| e.kind() == io::ErrorKind::NotFound);
                if !vanished {
                    debug!(target: "bootld", "cannot walk {}: {err}", dir.display());
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            remove_best_effort(entry.path(), |p| std::fs::remove_dir(p));
        } else {
            remove_best_effort(entry.path(), remove_file_or_link);
        }
    }
}

fn remove_file_or_link(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Directory symlinks and junctions on Windows.
        Err(err) if cfg!(windows) && err.kind() != io::ErrorKind::NotFound => {
            std::fs::remove_dir(path).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}

fn remove_best_effort(path: &Path, op: impl Fn(&Path) -> io::Result<()>) {
    match op(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            #[cfg(windows)]
            {
                // Another process (often a virus scanner) may still hold it.
                std::thread::sleep(std::time::Duration::from_millis(100));
                if op(path).is_ok() {
                    return;
                }
            }
            debug!(target: "bootld", "cannot remove {}: {err}", path.display());
        }
    }
}
