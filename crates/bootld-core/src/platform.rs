use std::ffi::OsString;
use std::path::Path;

use anyhow::Result;

use crate::child::{self, ChildOutcome};
use crate::status::ArchiveStatus;
use crate::{libpath, scratch};

/// OS-facing steps of a launch. [`NativePlatform`] is the build target's
/// implementation; tests substitute their own.
pub trait LaunchPlatform {
    fn create_scratch_dir(&self, status: &mut ArchiveStatus) -> Result<()>;

    fn stage_library_path(&self, status: &ArchiveStatus) -> Result<()>;

    fn spawn_and_wait(
        &self,
        executable: &Path,
        status: &ArchiveStatus,
        argv: &[OsString],
    ) -> ChildOutcome;

    fn remove_scratch_dir(&self, dir: &Path);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlatform;

impl LaunchPlatform for NativePlatform {
    fn create_scratch_dir(&self, status: &mut ArchiveStatus) -> Result<()> {
        scratch::create_temp_path(status)
    }

    fn stage_library_path(&self, status: &ArchiveStatus) -> Result<()> {
        libpath::set_environment(status)
    }

    fn spawn_and_wait(
        &self,
        executable: &Path,
        status: &ArchiveStatus,
        argv: &[OsString],
    ) -> ChildOutcome {
        child::create_child(executable, status, argv)
    }

    fn remove_scratch_dir(&self, dir: &Path) {
        scratch::remove_temp_path(dir)
    }
}
