//! Child process launcher.
//!
//! The child is started with the filtered argument vector, the parent relays
//! (or swallows) signals while it runs, and its termination is reported as a
//! [`ChildOutcome`] the entry point reproduces once cleanup is done.

use std::ffi::OsString;
use std::path::Path;

use tracing::{debug, error};

use crate::error::LaunchError;
use crate::pump::{self, EventPump};
use crate::status::{ArchiveStatus, OptionLookup, OPT_IGNORE_SIGNALS};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

/// Prefix of the process serial number argument macOS appends to Finder
/// launches.
pub const PSN_ARG_PREFIX: &str = "-psn";

/// What the parent does with signals it receives while the child runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Relay the signal to the child.
    Forward,
    /// Swallow it; the child only sees signals addressed to it directly.
    Ignore,
}

impl SignalDisposition {
    pub fn from_options(options: &dyn OptionLookup) -> Self {
        if options.get_option(OPT_IGNORE_SIGNALS).is_some() {
            SignalDisposition::Ignore
        } else {
            SignalDisposition::Forward
        }
    }
}

/// How the child ended, as seen by the parent.
#[derive(Debug)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
    /// Spawn or wait failed; the cause has already been logged.
    Failed(LaunchError),
}

impl ChildOutcome {
    /// Status for the parent to exit with when the outcome is not a signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildOutcome::Exited(code) => *code,
            ChildOutcome::Signaled(_) | ChildOutcome::Failed(_) => 1,
        }
    }

    /// Terminates this process the way the child terminated: same exit code,
    /// or the same signal raised against ourselves.
    pub fn reproduce(self) -> ! {
        #[cfg(unix)]
        {
            if let ChildOutcome::Signaled(sig) = &self {
                unsafe {
                    libc::signal(*sig, libc::SIG_DFL);
                    libc::raise(*sig);
                }
            }
        }
        std::process::exit(self.exit_code())
    }
}

/// Drops arguments the desktop injects into GUI launches.
pub fn strip_psn_args(argv: &[OsString]) -> Vec<OsString> {
    argv.iter()
        .filter(|arg| !arg.to_string_lossy().starts_with(PSN_ARG_PREFIX))
        .cloned()
        .collect()
}

/// Argument vector handed to the child on this build.
pub fn filter_platform_args(argv: &[OsString]) -> Vec<OsString> {
    if cfg!(all(target_os = "macos", feature = "windowed")) {
        strip_psn_args(argv)
    } else {
        argv.to_vec()
    }
}

/// Runs `executable` as the child and waits for it, pumping desktop events
/// when the build has a pump.
///
/// `argv[0]` becomes the child's `argv[0]`; the rest are its arguments.
pub fn create_child(executable: &Path, status: &ArchiveStatus, argv: &[OsString]) -> ChildOutcome {
    match pump::native_pump() {
        Some(mut boxed) => {
            let events: &mut dyn EventPump = boxed.as_mut();
            create_child_with_pump(executable, status, argv, Some(events))
        }
        None => create_child_with_pump(executable, status, argv, None),
    }
}

pub fn create_child_with_pump(
    executable: &Path,
    status: &ArchiveStatus,
    argv: &[OsString],
    mut events: Option<&mut dyn EventPump>,
) -> ChildOutcome {
    let mut args = filter_platform_args(argv);
    if let Some(p) = events.as_deref_mut() {
        pump::drain_into_args(p, pump::POLL_INTERVAL, &mut args);
    }

    let disposition = SignalDisposition::from_options(status.options());
    debug!(
        target: "bootld",
        "starting {} with {} argument(s), signals {:?}",
        executable.display(),
        args.len(),
        disposition
    );

    let outcome = sys::spawn_and_wait(executable, &args, disposition, events);
    match &outcome {
        ChildOutcome::Failed(err) => error!(target: "bootld", "{err}"),
        ChildOutcome::Exited(code) => debug!(target: "bootld", "child exited with {code}"),
        ChildOutcome::Signaled(sig) => debug!(target: "bootld", "child killed by signal {sig}"),
    }
    outcome
}
