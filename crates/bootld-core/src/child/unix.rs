use std::ffi::OsString;
use std::os::unix::process::{CommandExt as _, ExitStatusExt as _};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::env::get_env;
use crate::error::LaunchError;
use crate::pump::{self, EventPump};

use super::{ChildOutcome, SignalDisposition};

/// systemd socket activation hands sockets to the pid named here.
const ENV_LISTEN_PID: &[u8] = b"LISTEN_PID\0";

/// One past the highest signal number handlers are installed for.
#[cfg(target_os = "linux")]
const SIGNAL_LIMIT: libc::c_int = 65;
#[cfg(not(target_os = "linux"))]
const SIGNAL_LIMIT: libc::c_int = 32;

/// Pid the relay handler targets; 0 while no child runs.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

pub(super) fn spawn_and_wait(
    executable: &Path,
    args: &[OsString],
    disposition: SignalDisposition,
    events: Option<&mut dyn EventPump>,
) -> ChildOutcome {
    let mut cmd = Command::new(executable);
    if let Some((arg0, rest)) = args.split_first() {
        cmd.arg0(arg0);
        cmd.args(rest);
    }
    if get_env("LISTEN_PID").is_some() {
        // setenv may allocate after fork; the launcher forks from a single thread.
        unsafe {
            cmd.pre_exec(rewrite_listen_pid);
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            return ChildOutcome::Failed(LaunchError::Spawn {
                program: executable.to_path_buf(),
                source,
            })
        }
    };

    let guard = SignalGuard::install(child.id() as libc::pid_t, disposition);
    let waited = match events {
        Some(pump) => wait_pumping(&mut child, pump),
        None => child.wait(),
    };
    drop(guard);

    match waited {
        Ok(status) => translate(status),
        Err(source) => ChildOutcome::Failed(LaunchError::Wait { source }),
    }
}

fn wait_pumping(child: &mut Child, events: &mut dyn EventPump) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        pump::drain_to_child(events, pump::POLL_INTERVAL, child.id());
    }
}

fn translate(status: ExitStatus) -> ChildOutcome {
    if let Some(code) = status.code() {
        return ChildOutcome::Exited(code);
    }
    if let Some(sig) = status.signal() {
        return ChildOutcome::Signaled(sig);
    }
    // wait() only reports stops for traced children.
    ChildOutcome::Exited(1)
}

/// Runs in the forked child before exec: point `LISTEN_PID` at the child.
fn rewrite_listen_pid() -> std::io::Result<()> {
    let mut digits = itoa::Buffer::new();
    let pid = digits.format(unsafe { libc::getpid() }).as_bytes();
    let mut value = [0u8; 24];
    value[..pid.len()].copy_from_slice(pid);
    let rc = unsafe {
        libc::setenv(
            ENV_LISTEN_PID.as_ptr() as *const libc::c_char,
            value.as_ptr() as *const libc::c_char,
            1,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

extern "C" fn relay_signal(sig: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::Relaxed);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

extern "C" fn swallow_signal(_sig: libc::c_int) {}

/// Installs the parent's handlers for the lifetime of the child and puts
/// every disposition back to default on drop.
struct SignalGuard;

impl SignalGuard {
    fn install(child_pid: libc::pid_t, disposition: SignalDisposition) -> Self {
        CHILD_PID.store(child_pid, Ordering::Relaxed);
        let handler = match disposition {
            SignalDisposition::Forward => relay_signal as extern "C" fn(libc::c_int),
            SignalDisposition::Ignore => swallow_signal as extern "C" fn(libc::c_int),
        };
        for sig in relayable_signals() {
            // Uncatchable and reserved signals fail here; that is expected.
            unsafe { set_handler(sig, handler as libc::sighandler_t) };
        }
        SignalGuard
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for sig in relayable_signals() {
            unsafe { set_handler(sig, libc::SIG_DFL) };
        }
        CHILD_PID.store(0, Ordering::Relaxed);
    }
}

fn relayable_signals() -> impl Iterator<Item = libc::c_int> {
    (1..SIGNAL_LIMIT).filter(|&sig| sig != libc::SIGCHLD)
}

unsafe fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> bool {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(sig, &action, std::ptr::null_mut()) == 0
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serial_test::serial;

    use super::*;
    use crate::pump::testing::ScriptedPump;
    use crate::pump::DesktopEvent;

    fn sh(script: &str) -> Vec<OsString> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    #[serial]
    fn exit_code_is_reported() {
        let out = spawn_and_wait(
            Path::new("/bin/sh"),
            &sh("exit 7"),
            SignalDisposition::Forward,
            None,
        );
        assert!(matches!(out, ChildOutcome::Exited(7)), "{out:?}");
    }

    #[test]
    #[serial]
    fn signal_termination_is_reported() {
        let out = spawn_and_wait(
            Path::new("/bin/sh"),
            &sh("kill -TERM $$"),
            SignalDisposition::Forward,
            None,
        );
        assert!(matches!(out, ChildOutcome::Signaled(libc::SIGTERM)), "{out:?}");
    }

    #[test]
    #[serial]
    fn missing_executable_is_a_spawn_failure() {
        let out = spawn_and_wait(
            Path::new("/nonexistent/bootld-child"),
            &[OsString::from("child")],
            SignalDisposition::Forward,
            None,
        );
        assert!(
            matches!(out, ChildOutcome::Failed(LaunchError::Spawn { .. })),
            "{out:?}"
        );
        assert_eq!(CHILD_PID.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[serial]
    fn pumped_wait_forwards_events_until_exit() {
        let mut pump = ScriptedPump::new(vec![vec![DesktopEvent::OpenDocuments(vec![
            "/doc.txt".to_string(),
        ])]]);
        let start = Instant::now();
        let events: &mut dyn EventPump = &mut pump;
        let out = spawn_and_wait(
            Path::new("/bin/sh"),
            &sh("sleep 0.2; exit 3"),
            SignalDisposition::Forward,
            Some(events),
        );
        assert!(matches!(out, ChildOutcome::Exited(3)), "{out:?}");
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(pump.forwarded.len(), 1);
        assert!(pump.polls >= 1);
    }

    #[test]
    #[serial]
    fn guard_clears_pid_on_drop() {
        {
            let _guard = SignalGuard::install(999_999, SignalDisposition::Ignore);
            assert_eq!(CHILD_PID.load(Ordering::Relaxed), 999_999);
        }
        assert_eq!(CHILD_PID.load(Ordering::Relaxed), 0);
    }
}
