use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Overrides the root under which the scratch directory is created.
pub const OPT_RUNTIME_TMPDIR: &str = "pyi-runtime-tmpdir";
/// When present, the parent swallows signals instead of forwarding them.
pub const OPT_IGNORE_SIGNALS: &str = "pyi-bootloader-ignore-signals";

/// Read-only view of the options packed into the application bundle.
pub trait OptionLookup {
    fn get_option(&self, key: &str) -> Option<String>;
}

impl OptionLookup for BTreeMap<String, String> {
    fn get_option(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Per-process launch record shared by the scratch manager, the stager and
/// the launcher.
///
/// Only the scratch manager writes the scratch directory; everyone else
/// reads it.
pub struct ArchiveStatus {
    homepath: PathBuf,
    temppath: Option<PathBuf>,
    options: Box<dyn OptionLookup>,
}

impl ArchiveStatus {
    pub fn new(homepath: impl Into<PathBuf>, options: impl OptionLookup + 'static) -> Self {
        ArchiveStatus {
            homepath: homepath.into(),
            temppath: None,
            options: Box::new(options),
        }
    }

    /// Installation directory (one-dir mode, or the bundle location).
    pub fn homepath(&self) -> &Path {
        &self.homepath
    }

    /// Scratch directory, once created.
    pub fn temppath(&self) -> Option<&Path> {
        self.temppath.as_deref()
    }

    pub fn has_temp_directory(&self) -> bool {
        self.temppath.is_some()
    }

    pub fn get_option(&self, key: &str) -> Option<String> {
        self.options.get_option(key)
    }

    pub fn options(&self) -> &dyn OptionLookup {
        self.options.as_ref()
    }

    /// Directory the dynamic loader should search first: the scratch
    /// directory if one exists, the installation directory otherwise.
    pub fn library_dir(&self) -> &Path {
        self.temppath().unwrap_or(&self.homepath)
    }

    pub(crate) fn set_temppath(&mut self, path: PathBuf) {
        self.temppath = Some(path);
    }

    pub(crate) fn take_temppath(&mut self) -> Option<PathBuf> {
        self.temppath.take()
    }
}

impl std::fmt::Debug for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStatus")
            .field("homepath", &self.homepath)
            .field("temppath", &self.temppath)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn library_dir_prefers_scratch() {
        let mut st = ArchiveStatus::new("/opt/app", opts(&[]));
        assert_eq!(st.library_dir(), Path::new("/opt/app"));
        assert!(!st.has_temp_directory());

        st.set_temppath(PathBuf::from("/tmp/_MEIabc123"));
        assert!(st.has_temp_directory());
        assert_eq!(st.library_dir(), Path::new("/tmp/_MEIabc123"));
    }

    #[test]
    fn options_are_looked_up_by_key() {
        let st = ArchiveStatus::new("/opt/app", opts(&[(OPT_IGNORE_SIGNALS, "1")]));
        assert_eq!(st.get_option(OPT_IGNORE_SIGNALS).as_deref(), Some("1"));
        assert_eq!(st.get_option(OPT_RUNTIME_TMPDIR), None);
    }
}
