use std::ffi::OsString;
use std::os::windows::ffi::OsStrExt as _;
use std::path::Path;

use windows_sys::Win32::Foundation::{CloseHandle, TRUE, WAIT_FAILED};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::Environment::GetCommandLineW;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, WaitForSingleObject, INFINITE, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOW,
};

use crate::error::LaunchError;
use crate::pump::EventPump;

use super::{ChildOutcome, SignalDisposition};

const SIGBREAK: libc::c_int = 21;

/// Console signals the parent ignores while the child owns the console.
const PARENT_IGNORED_SIGNALS: [libc::c_int; 4] =
    [libc::SIGABRT, libc::SIGINT, libc::SIGTERM, SIGBREAK];

/// The child receives this process's own command line verbatim, so `args` is
/// only used for logging. Windows has no signal relay; `disposition` does not
/// apply.
pub(super) fn spawn_and_wait(
    executable: &Path,
    args: &[OsString],
    _disposition: SignalDisposition,
    _events: Option<&mut dyn EventPump>,
) -> ChildOutcome {
    tracing::debug!(target: "bootld", "child argv has {} entries", args.len());
    let _ignored = ConsoleSignalGuard::install();

    let app: Vec<u16> = executable
        .as_os_str()
        .encode_wide()
        .chain(Some(0))
        .collect();
    let mut command_line = own_command_line();

    let security = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    unsafe {
        startup.hStdInput = GetStdHandle(STD_INPUT_HANDLE);
        startup.hStdOutput = GetStdHandle(STD_OUTPUT_HANDLE);
        startup.hStdError = GetStdHandle(STD_ERROR_HANDLE);
    }
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
        CreateProcessW(
            app.as_ptr(),
            command_line.as_mut_ptr(),
            &security,
            std::ptr::null(),
            TRUE,
            0,
            std::ptr::null(),
            std::ptr::null(),
            &startup,
            &mut info,
        )
    };
    if ok == 0 {
        return ChildOutcome::Failed(LaunchError::Spawn {
            program: executable.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }

    let outcome = wait_for_exit(info.hProcess);
    unsafe {
        CloseHandle(info.hThread);
        CloseHandle(info.hProcess);
    }
    outcome
}

fn wait_for_exit(process: windows_sys::Win32::Foundation::HANDLE) -> ChildOutcome {
    if unsafe { WaitForSingleObject(process, INFINITE) } == WAIT_FAILED {
        return ChildOutcome::Failed(LaunchError::Wait {
            source: std::io::Error::last_os_error(),
        });
    }
    let mut code: u32 = 0;
    if unsafe { GetExitCodeProcess(process, &mut code) } == 0 {
        return ChildOutcome::Failed(LaunchError::Wait {
            source: std::io::Error::last_os_error(),
        });
    }
    ChildOutcome::Exited(code as i32)
}

fn own_command_line() -> Vec<u16> {
    let raw = unsafe { GetCommandLineW() };
    let mut len = 0;
    unsafe {
        while *raw.add(len) != 0 {
            len += 1;
        }
        let mut line = std::slice::from_raw_parts(raw, len).to_vec();
        line.push(0);
        line
    }
}

struct ConsoleSignalGuard;

impl ConsoleSignalGuard {
    fn install() -> Self {
        for sig in PARENT_IGNORED_SIGNALS {
            unsafe { libc::signal(sig, libc::SIG_IGN) };
        }
        ConsoleSignalGuard
    }
}

impl Drop for ConsoleSignalGuard {
    fn drop(&mut self) {
        for sig in PARENT_IGNORED_SIGNALS {
            unsafe { libc::signal(sig, libc::SIG_DFL) };
        }
    }
}
