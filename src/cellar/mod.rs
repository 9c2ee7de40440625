//! Cellar - the on-disk layout of installed prefixes.
//!
//! Layout:
//!
//! ```text
//! <cellar>/<name>/<version>/...   one prefix per installed version
//! <cellar>/opt/<name>             symlink to the active version
//! <cellar>/.build/                staging area for in-progress builds
//! <cellar>/.locks/                publish locks
//! ```
//!
//! A build happens entirely inside a staging directory and becomes visible
//! through a single `rename`, so a concurrent reader either sees the old
//! state or the complete new prefix, never a half-written one. Failed or
//! cancelled builds leave the cellar untouched; the staging directory is
//! discarded with its `TempDir` guard.

mod lock;
mod receipt;

pub use receipt::{InstallationRecord, collect_files};

use crate::platform::lenient_version;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CellarError {
    #[error("another builder is publishing {name}/{version}")]
    Conflict { name: String, version: String },
    #[error("{name} {version} is already installed")]
    AlreadyInstalled { name: String, version: String },
    #[error("not installed: {0}")]
    NotInstalled(String),
    #[error("invalid receipt: {0}")]
    ReceiptParse(toml::de::Error),
    #[error("cannot encode receipt: {0}")]
    ReceiptEncode(toml::ser::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A staged, not-yet-published prefix. Dropping it without publishing
/// removes the partial tree.
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    /// The staged prefix path that steps install into.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Owns the cellar directory tree.
#[derive(Debug, Clone)]
pub struct Cellar {
    root: PathBuf,
}

impl Cellar {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<cellar>/<name>/<version>`
    pub fn version_prefix(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    /// `<cellar>/opt/<name>`
    pub fn opt_link(&self, name: &str) -> PathBuf {
        self.root.join("opt").join(name)
    }

    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.version_prefix(name, version).is_dir()
    }

    /// The prefix dependents should build against: the opt target when the
    /// link is healthy, otherwise the newest installed version.
    pub fn installed_prefix(&self, name: &str) -> Option<PathBuf> {
        let opt = self.opt_link(name);
        if let Ok(target) = std::fs::read_link(&opt)
            && target.is_dir()
        {
            return Some(target);
        }
        let version = self.installed_versions(name).ok()?.pop()?;
        Some(self.version_prefix(name, &version))
    }

    /// Installed versions of a formula, oldest first. Versions that parse as
    /// semver sort numerically, the rest lexicographically after them.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<String>, CellarError> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        versions.sort_by(|a, b| match (lenient_version(a), lenient_version(b)) {
            (Some(va), Some(vb)) => va.cmp(&vb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        });
        Ok(versions)
    }

    /// The version the opt link currently points at.
    pub fn active_version(&self, name: &str) -> Option<String> {
        let target = std::fs::read_link(self.opt_link(name)).ok()?;
        Some(target.file_name()?.to_string_lossy().to_string())
    }

    /// Names of all formulas with at least one installed version.
    pub fn installed_names(&self) -> Result<Vec<String>, CellarError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || file_name == "opt" {
                continue;
            }
            if entry.file_type()?.is_dir() && !self.installed_versions(&file_name)?.is_empty() {
                names.push(file_name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Allocate a staging prefix for a build.
    pub fn stage(&self, name: &str, version: &str) -> Result<Staging, CellarError> {
        let build_dir = self.root.join(".build");
        std::fs::create_dir_all(&build_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", name, version))
            .tempdir_in(&build_dir)?;
        Ok(Staging { dir })
    }

    /// Publish a staged prefix under the record's name/version.
    ///
    /// Writes the receipt into the staged tree, then renames it into place
    /// under the per-key publish lock and flips the opt symlink. Returns the
    /// published prefix.
    pub fn publish(
        &self,
        staging: Staging,
        record: &InstallationRecord,
    ) -> Result<PathBuf, CellarError> {
        let _lock = lock::acquire(&self.root, &record.name, &record.version)?;

        let target = self.version_prefix(&record.name, &record.version);
        if target.exists() {
            return Err(CellarError::AlreadyInstalled {
                name: record.name.clone(),
                version: record.version.clone(),
            });
        }

        record.write(staging.path())?;

        std::fs::create_dir_all(target.parent().expect("version prefix has a parent"))?;
        let staged = staging.dir.keep();
        if let Err(e) = std::fs::rename(&staged, &target) {
            // Failed rename must not leave the staged tree behind
            let _ = std::fs::remove_dir_all(&staged);
            return Err(e.into());
        }

        self.link_opt(&record.name, &record.version)?;
        Ok(target)
    }

    /// Point `opt/<name>` at a version. The link is created beside its final
    /// name and renamed over, so readers never observe a missing link.
    fn link_opt(&self, name: &str, version: &str) -> Result<(), CellarError> {
        let opt_dir = self.root.join("opt");
        std::fs::create_dir_all(&opt_dir)?;
        let tmp = opt_dir.join(format!(".{}.tmp{}", name, std::process::id()));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(self.version_prefix(name, version), &tmp)?;
        std::fs::rename(&tmp, self.opt_link(name))?;
        Ok(())
    }

    /// Remove one version (or all versions) of a formula. Returns the
    /// removed versions. The opt link is retargeted at the newest remaining
    /// version, or removed with the last one.
    pub fn uninstall(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Vec<String>, CellarError> {
        let installed = self.installed_versions(name)?;
        if installed.is_empty() {
            return Err(CellarError::NotInstalled(name.to_string()));
        }

        let targets: Vec<String> = match version {
            Some(v) if installed.iter().any(|i| i == v) => vec![v.to_string()],
            Some(v) => {
                return Err(CellarError::NotInstalled(format!("{} {}", name, v)));
            }
            None => installed,
        };

        for v in &targets {
            std::fs::remove_dir_all(self.version_prefix(name, v))?;
        }

        let remaining = self.installed_versions(name)?;
        match remaining.last() {
            Some(newest) => self.link_opt(name, newest)?,
            None => {
                let _ = std::fs::remove_file(self.opt_link(name));
                let _ = std::fs::remove_dir(self.root.join(name));
            }
        }

        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cellar() -> (TempDir, Cellar) {
        let dir = TempDir::new().unwrap();
        let cellar = Cellar::new(dir.path().join("cellar"));
        (dir, cellar)
    }

    fn stage_with_file(cellar: &Cellar, name: &str, version: &str) -> Staging {
        let staging = cellar.stage(name, version).unwrap();
        let bin = staging.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(name), "#!/bin/sh\n").unwrap();
        staging
    }

    fn record(name: &str, version: &str) -> InstallationRecord {
        InstallationRecord::new(name, version, vec![], vec![format!("bin/{}", name)])
    }

    #[test]
    fn test_publish_creates_prefix_and_opt_link() {
        let (_dir, cellar) = cellar();
        let staging = stage_with_file(&cellar, "widget", "1.0.0");
        let prefix = cellar.publish(staging, &record("widget", "1.0.0")).unwrap();

        assert_eq!(prefix, cellar.version_prefix("widget", "1.0.0"));
        assert!(prefix.join("bin/widget").is_file());
        assert!(prefix.join(".malt/receipt.toml").is_file());
        assert!(cellar.is_installed("widget", "1.0.0"));
        assert_eq!(
            std::fs::read_link(cellar.opt_link("widget")).unwrap(),
            prefix
        );
        // staging area left clean
        let leftovers: Vec<_> = std::fs::read_dir(cellar.root().join(".build"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_double_publish_same_key_fails() {
        let (_dir, cellar) = cellar();
        let staging = stage_with_file(&cellar, "widget", "1.0.0");
        cellar.publish(staging, &record("widget", "1.0.0")).unwrap();

        let staging = stage_with_file(&cellar, "widget", "1.0.0");
        let err = cellar
            .publish(staging, &record("widget", "1.0.0"))
            .unwrap_err();
        assert!(matches!(err, CellarError::AlreadyInstalled { .. }));
    }

    #[test]
    fn test_opt_link_flips_to_new_version() {
        let (_dir, cellar) = cellar();
        let staging = stage_with_file(&cellar, "widget", "1.0.0");
        cellar.publish(staging, &record("widget", "1.0.0")).unwrap();
        let staging = stage_with_file(&cellar, "widget", "2.0.0");
        cellar.publish(staging, &record("widget", "2.0.0")).unwrap();

        assert_eq!(cellar.active_version("widget").as_deref(), Some("2.0.0"));
        assert_eq!(
            cellar.installed_versions("widget").unwrap(),
            vec!["1.0.0", "2.0.0"]
        );
    }

    #[test]
    fn test_dropped_staging_publishes_nothing() {
        let (_dir, cellar) = cellar();
        {
            let _staging = stage_with_file(&cellar, "widget", "1.0.0");
            // dropped without publish - the failed-build path
        }
        assert!(!cellar.is_installed("widget", "1.0.0"));
        let leftovers: Vec<_> = std::fs::read_dir(cellar.root().join(".build"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_uninstall_retargets_opt_link() {
        let (_dir, cellar) = cellar();
        for version in ["1.0.0", "2.0.0"] {
            let staging = stage_with_file(&cellar, "widget", version);
            cellar.publish(staging, &record("widget", version)).unwrap();
        }
        assert_eq!(cellar.active_version("widget").as_deref(), Some("2.0.0"));

        let removed = cellar.uninstall("widget", Some("2.0.0")).unwrap();
        assert_eq!(removed, vec!["2.0.0"]);
        assert_eq!(cellar.active_version("widget").as_deref(), Some("1.0.0"));

        cellar.uninstall("widget", None).unwrap();
        assert!(!cellar.opt_link("widget").exists());
        assert!(cellar.installed_names().unwrap().is_empty());
    }

    #[test]
    fn test_uninstall_unknown() {
        let (_dir, cellar) = cellar();
        assert!(matches!(
            cellar.uninstall("ghost", None),
            Err(CellarError::NotInstalled(_))
        ));
    }

    #[test]
    fn test_installed_prefix_prefers_opt_target() {
        let (_dir, cellar) = cellar();
        for version in ["1.0.0", "2.0.0"] {
            let staging = stage_with_file(&cellar, "widget", version);
            cellar.publish(staging, &record("widget", version)).unwrap();
        }
        assert_eq!(
            cellar.installed_prefix("widget").unwrap(),
            cellar.version_prefix("widget", "2.0.0")
        );
    }
}
