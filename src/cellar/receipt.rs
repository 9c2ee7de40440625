//! Installation receipts.
//!
//! The durable record of one install lives inside the prefix it describes
//! (`.malt/receipt.toml`), so removing the prefix removes the record with it.
//! A receipt exists only for installs whose steps and tests all succeeded.

use super::CellarError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const RECEIPT_DIR: &str = ".malt";
const RECEIPT_FILE: &str = "receipt.toml";

/// The durable artifact of a successful install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationRecord {
    pub name: String,
    pub version: String,
    /// Runtime dependency closure (build and test deps excluded)
    #[serde(default)]
    pub runtime_deps: Vec<String>,
    /// Files placed, relative to the prefix, sorted
    #[serde(default)]
    pub files: Vec<String>,
    /// Unix timestamp of the publish
    pub installed_at: u64,
}

impl InstallationRecord {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        runtime_deps: Vec<String>,
        files: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            runtime_deps,
            files,
            installed_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn path(prefix: &Path) -> PathBuf {
        prefix.join(RECEIPT_DIR).join(RECEIPT_FILE)
    }

    /// Write the receipt into a prefix (staged or published).
    pub fn write(&self, prefix: &Path) -> Result<(), CellarError> {
        let path = Self::path(prefix);
        std::fs::create_dir_all(path.parent().expect("receipt path has a parent"))?;
        let text = toml::to_string_pretty(self).map_err(CellarError::ReceiptEncode)?;
        std::fs::write(&path, text)?;
        Ok(())
    }

    /// Read the receipt out of an installed prefix.
    pub fn read(prefix: &Path) -> Result<Self, CellarError> {
        let path = Self::path(prefix);
        if !path.is_file() {
            return Err(CellarError::NotInstalled(prefix.display().to_string()));
        }
        let text = std::fs::read_to_string(&path)?;
        toml::from_str(&text).map_err(CellarError::ReceiptParse)
    }
}

/// Collect the relative paths of all regular files and symlinks under a
/// prefix, excluding the receipt directory itself. Sorted for determinism.
pub fn collect_files(prefix: &Path) -> Result<Vec<String>, CellarError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(prefix) {
        let entry = entry.map_err(|e| CellarError::Io(e.into()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(prefix)
            .expect("walkdir yields children of its root");
        if rel.starts_with(RECEIPT_DIR) {
            continue;
        }
        files.push(rel.display().to_string());
    }
    files.sort();
    Ok(files)
}
