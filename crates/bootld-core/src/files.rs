use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use walkdir::WalkDir;

const COPY_CHUNK: usize = 4096;

/// Opens `<root>/<relative>` for binary write, creating every missing
/// intermediate directory (mode 0700 on unix).
///
/// `relative` must stay below `root`: absolute paths and `..` components are
/// rejected.
pub fn open_target(root: &Path, relative: &Path) -> Result<File> {
    let target = join_below(root, relative)?;
    if let Some(parent) = target.parent() {
        create_private_dirs(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    if target.exists() {
        warn!(target: "bootld", "file {} already exists, overwriting", target.display());
    }
    File::create(&target).with_context(|| format!("open {} for write", target.display()))
}

/// Copies `src` to `<dst_root>/<relative>` in fixed-size chunks, then marks
/// the copy owner-only executable on unix.
pub fn copy_file(src: &Path, dst_root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut input = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut output = open_target(dst_root, relative)?;
    let target = dst_root.join(relative);

    let mut buf = [0u8; COPY_CHUNK];
    loop {
        let n = input
            .read(&mut buf)
            .with_context(|| format!("read {}", src.display()))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .with_context(|| format!("write {}", target.display()))?;
    }
    output
        .flush()
        .with_context(|| format!("flush {}", target.display()))?;
    drop(output);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("chmod {}", target.display()))?;
    }
    Ok(target)
}

/// Copies every regular file under `src_dir` into `dst_root`, keeping the
/// relative layout. Symbolic links are not followed. Returns the number of
/// files copied.
pub fn copy_tree(src_dir: &Path, dst_root: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", src_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src_dir).with_context(|| {
            format!(
                "strip prefix {} from {}",
                src_dir.display(),
                entry.path().display()
            )
        })?;
        copy_file(entry.path(), dst_root, rel)?;
        copied += 1;
    }
    Ok(copied)
}

fn join_below(root: &Path, relative: &Path) -> Result<PathBuf> {
    for comp in relative.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path escapes target root: {}", relative.display()),
        }
    }
    Ok(root.join(relative))
}

#[cfg(unix)]
fn create_private_dirs(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dirs(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
