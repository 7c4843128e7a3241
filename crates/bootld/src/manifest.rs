use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bootld_core::{validate_bundle_path, validate_payload, BundleMode};
use serde::Deserialize;

pub const MANIFEST_SCHEMA_VERSION: &str = "bootld.bundle.manifest@0.1.0";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestMode {
    Onefile,
    Onedir,
}

impl From<ManifestMode> for BundleMode {
    fn from(mode: ManifestMode) -> Self {
        match mode {
            ManifestMode::Onefile => BundleMode::OneFile,
            ManifestMode::Onedir => BundleMode::OneDir,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub schema_version: String,
    pub mode: ManifestMode,
    pub payload: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Libraries checked for loadability before the payload starts.
    #[serde(default)]
    pub preload: Vec<String>,
}

impl BundleManifest {
    pub fn payload_path(&self) -> PathBuf {
        PathBuf::from(&self.payload)
    }

    pub fn preload_paths(&self) -> Vec<PathBuf> {
        self.preload.iter().map(PathBuf::from).collect()
    }
}

pub fn sidecar_dir_for_exe(exe: &Path) -> PathBuf {
    let mut dir = exe.as_os_str().to_owned();
    dir.push(".bundle");
    PathBuf::from(dir)
}

pub fn load(bundle_dir: &Path) -> Result<BundleManifest> {
    let path = bundle_dir.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("read bundle manifest: {}", path.display()))?;
    parse(&bytes).with_context(|| format!("bundle manifest: {}", path.display()))
}

pub fn parse(bytes: &[u8]) -> Result<BundleManifest> {
    let manifest: BundleManifest = serde_json::from_slice(bytes).context("parse JSON")?;
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        anyhow::bail!(
            "unsupported bundle manifest schema_version: {:?}",
            manifest.schema_version
        );
    }
    validate_payload(&manifest.payload_path())?;
    for lib in manifest.preload_paths() {
        validate_bundle_path("preload library", &lib)?;
    }
    Ok(manifest)
}
