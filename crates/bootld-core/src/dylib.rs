//! Loading shared libraries out of the staged directory.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

#[cfg(target_os = "aix")]
const RTLD_MEMBER: libc::c_int = 0x0004_0000;

/// An open shared library. The handle is released on drop.
#[derive(Debug)]
pub struct DynLib {
    handle: *mut c_void,
    path: PathBuf,
}

impl DynLib {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl DynLib {
    /// `dlopen` with immediate binding and global symbol visibility.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        use std::os::unix::ffi::OsStrExt as _;

        let path = path.as_ref();
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| anyhow::anyhow!("library path contains NUL: {}", path.display()))?;

        #[cfg(target_os = "aix")]
        let flags = libc::RTLD_NOW | libc::RTLD_GLOBAL | RTLD_MEMBER;
        #[cfg(not(target_os = "aix"))]
        let flags = libc::RTLD_NOW | libc::RTLD_GLOBAL;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), flags) };
        if handle.is_null() {
            anyhow::bail!("dlopen {}: {}", path.display(), last_dl_error());
        }
        debug!(target: "bootld", "loaded {}", path.display());
        Ok(DynLib {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Address of `name`, or `None` if the library does not export it.
    pub fn symbol(&self, name: &str) -> Option<*mut c_void> {
        let c_name = std::ffi::CString::new(name).ok()?;
        let sym = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        (!sym.is_null()).then_some(sym)
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return "unknown error".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(msg) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(unix)]
impl Drop for DynLib {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(windows)]
impl DynLib {
    /// `LoadLibraryExW` resolving dependencies relative to the library's own
    /// directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        use std::os::windows::ffi::OsStrExt as _;
        use windows_sys::Win32::System::LibraryLoader::{
            LoadLibraryExW, LOAD_WITH_ALTERED_SEARCH_PATH,
        };

        let path = path.as_ref();
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let handle = unsafe {
            LoadLibraryExW(
                wide.as_ptr(),
                std::ptr::null_mut(),
                LOAD_WITH_ALTERED_SEARCH_PATH,
            )
        };
        if handle.is_null() {
            let err = std::io::Error::last_os_error();
            anyhow::bail!("LoadLibraryExW {}: {err}", path.display());
        }
        debug!(target: "bootld", "loaded {}", path.display());
        Ok(DynLib {
            handle: handle as *mut c_void,
            path: path.to_path_buf(),
        })
    }

    pub fn symbol(&self, name: &str) -> Option<*mut c_void> {
        use windows_sys::Win32::System::LibraryLoader::GetProcAddress;

        let c_name = std::ffi::CString::new(name).ok()?;
        let sym = unsafe { GetProcAddress(self.handle as _, c_name.as_ptr() as *const u8) }?;
        Some(sym as *mut c_void)
    }
}

#[cfg(windows)]
impl Drop for DynLib {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::FreeLibrary(self.handle as _);
        }
    }
}
