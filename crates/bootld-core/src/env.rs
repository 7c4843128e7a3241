//! Process environment access.
//!
//! Values are always returned as owned copies, so mutating a returned value
//! never touches the live environment. A variable that is set to the empty
//! string is reported as absent: some platforms cannot really unset a
//! variable, and a child that "unsets" one there ends up with an empty value
//! instead. Callers must not try to tell the two states apart.

use std::ffi::{OsStr, OsString};

use anyhow::Result;

/// Returns a copy of `name`, or `None` when it is unset or empty.
///
/// On Windows `%VAR%` references inside the value are expanded.
pub fn get_env(name: &str) -> Option<OsString> {
    let raw = std::env::var_os(name)?;
    #[cfg(windows)]
    let raw = expand_references(&raw).unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(raw)
}

/// Like [`get_env`], for values that must be valid UTF-8.
pub fn get_env_string(name: &str) -> Option<String> {
    get_env(name).and_then(|v| v.into_string().ok())
}

pub fn set_env(name: &str, value: impl AsRef<OsStr>) -> Result<()> {
    let value = value.as_ref();
    validate_name(name)?;
    if contains_nul(value) {
        anyhow::bail!("value for environment variable {name} contains NUL");
    }
    std::env::set_var(name, value);
    Ok(())
}

pub fn unset_env(name: &str) -> Result<()> {
    validate_name(name)?;
    std::env::remove_var(name);
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("environment variable name is empty");
    }
    if name.contains('=') || name.contains('\0') {
        anyhow::bail!("invalid environment variable name {name:?}");
    }
    Ok(())
}

#[cfg(unix)]
fn contains_nul(value: &OsStr) -> bool {
    use std::os::unix::ffi::OsStrExt as _;
    value.as_bytes().contains(&0)
}

#[cfg(windows)]
fn contains_nul(value: &OsStr) -> bool {
    use std::os::windows::ffi::OsStrExt as _;
    value.encode_wide().any(|c| c == 0)
}

#[cfg(windows)]
fn expand_references(value: &OsStr) -> Option<OsString> {
    use std::os::windows::ffi::{OsStrExt as _, OsStringExt as _};
    use windows_sys::Win32::System::Environment::ExpandEnvironmentStringsW;

    let src: Vec<u16> = value.encode_wide().chain(Some(0)).collect();
    let mut buf = vec![0u16; src.len().max(260)];
    loop {
        let cap = u32::try_from(buf.len()).ok()?;
        // Returns the required size in u16 units, terminating NUL included.
        let n = unsafe { ExpandEnvironmentStringsW(src.as_ptr(), buf.as_mut_ptr(), cap) } as usize;
        if n == 0 {
            return None;
        }
        if n <= buf.len() {
            buf.truncate(n - 1);
            return Some(OsString::from_wide(&buf));
        }
        buf.resize(n, 0);
    }
}
