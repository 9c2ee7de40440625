//! Artifact fetching - resolve a declared source to a ready local tree.
//!
//! Downloads (or reuses from the cache), verifies the declared checksum, and
//! unpacks archives natively. The orchestrator only sees the resulting
//! source directory; everything else here is peripheral I/O.

mod download;
mod extract;
mod verify;

pub use verify::{Checksum, HashAlgorithm};

use crate::formula::SourceSpec;
use crate::output;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download failed: {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("invalid checksum declaration: {0}")]
    InvalidChecksum(String),
    #[error("{algorithm} mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: &'static str,
        file: String,
        expected: String,
        actual: String,
    },
    #[error("archive contains unsafe path: {0}")]
    UnsafeArchivePath(String),
    #[error("checksum declared for directory source: {0}")]
    DirectoryChecksum(String),
    #[error("source not found: {0}")]
    NotFound(String),
}

/// Fetches declared sources into a download cache and unpacks them.
pub struct Fetcher {
    cache_dir: PathBuf,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Resolve `source` to a populated directory at `dest`.
    ///
    /// Archives are unpacked into `dest`; a plain file is copied into it; a
    /// local directory source is copied recursively. The checksum, when
    /// declared, is verified before anything is unpacked.
    pub fn fetch(&self, source: &SourceSpec, dest: &Path) -> Result<PathBuf, FetchError> {
        let checksum = source
            .checksum
            .as_deref()
            .map(Checksum::parse)
            .transpose()?;

        let local = self.localize(&source.url, checksum.as_ref())?;
        std::fs::create_dir_all(dest)?;

        if local.is_dir() {
            // A directory has no bytes to hash; a declared checksum that can
            // never be checked must not pass silently.
            if checksum.is_some() {
                return Err(FetchError::DirectoryChecksum(source.url.clone()));
            }
            copy_tree(&local, dest)?;
            return Ok(dest.to_path_buf());
        }

        if let Some(checksum) = &checksum {
            verify::verify(&local, checksum)?;
        }

        if extract::is_archive(&local) {
            output::detail(&format!("unpacking {}", file_name(&local)));
            extract::extract(&local, dest, source.strip_components)?;
        } else {
            std::fs::copy(&local, dest.join(file_name(&local)))?;
        }

        Ok(dest.to_path_buf())
    }

    /// Turn the URL into a local file or directory path, downloading into
    /// the cache when needed.
    fn localize(&self, url: &str, checksum: Option<&Checksum>) -> Result<PathBuf, FetchError> {
        if let Some(rest) = url.strip_prefix("file://") {
            return self.local_path(rest);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.download_cached(url, checksum);
        }
        if url.contains("://") {
            return Err(FetchError::UnsupportedScheme(url.to_string()));
        }
        self.local_path(url)
    }

    fn local_path(&self, path: &str) -> Result<PathBuf, FetchError> {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(FetchError::NotFound(path.display().to_string()));
        }
        Ok(path)
    }

    /// Download into the cache, reusing a cached file whose checksum still
    /// verifies. Without a declared checksum any cached file is trusted.
    fn download_cached(
        &self,
        url: &str,
        checksum: Option<&Checksum>,
    ) -> Result<PathBuf, FetchError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let cached = self.cache_dir.join(url_filename(url));

        if cached.is_file() {
            match checksum {
                Some(checksum) if verify::verify(&cached, checksum).is_err() => {
                    output::detail("cached file is stale, re-downloading");
                    std::fs::remove_file(&cached)?;
                }
                _ => {
                    output::detail(&format!("using cached {}", file_name(&cached)));
                    return Ok(cached);
                }
            }
        }

        download::download(url, &cached)?;
        Ok(cached)
    }
}

/// Extract the filename from a URL.
fn url_filename(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or("download")
        .split('?')
        .next()
        .unwrap_or("download")
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Recursively copy a directory tree (symlinks are copied as links).
fn copy_tree(from: &Path, to: &Path) -> Result<(), FetchError> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| FetchError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir yields children of its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_url_filename() {
        assert_eq!(
            url_filename("https://example.org/a/b/otp_src_24.2.2.tar.gz?x=1"),
            "otp_src_24.2.2.tar.gz"
        );
    }

    #[test]
    fn test_fetch_local_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("sub/file.txt"), "hello").unwrap();

        let dest = dir.path().join("dest");
        let fetcher = Fetcher::new(dir.path().join("cache"));
        let spec = SourceSpec {
            url: src.display().to_string(),
            checksum: None,
            strip_components: 0,
        };
        fetcher.fetch(&spec, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("sub/file.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_directory_source_with_checksum_rejected() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file.txt"), "hello").unwrap();

        let dest = dir.path().join("dest");
        let fetcher = Fetcher::new(dir.path().join("cache"));
        let spec = SourceSpec {
            url: src.display().to_string(),
            checksum: Some(format!("sha256:{}", "0".repeat(64))),
            strip_components: 0,
        };
        let err = fetcher.fetch(&spec, &dest).unwrap_err();
        assert!(matches!(err, FetchError::DirectoryChecksum(_)));
        assert!(!dest.join("file.txt").exists());
    }

    #[test]
    fn test_fetch_missing_source() {
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(dir.path().join("cache"));
        let spec = SourceSpec {
            url: dir.path().join("nope.tar.gz").display().to_string(),
            checksum: None,
            strip_components: 0,
        };
        let err = fetcher.fetch(&spec, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn test_fetch_plain_file_with_checksum() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"formula bytes").unwrap();
        // sha256 of "formula bytes"
        let digest = {
            use sha2::Digest;
            hex::encode(sha2::Sha256::digest(b"formula bytes"))
        };

        let dest = dir.path().join("dest");
        let fetcher = Fetcher::new(dir.path().join("cache"));
        let spec = SourceSpec {
            url: file.display().to_string(),
            checksum: Some(format!("sha256:{}", digest)),
            strip_components: 0,
        };
        fetcher.fetch(&spec, &dest).unwrap();
        assert!(dest.join("data.bin").is_file());

        let bad = SourceSpec {
            checksum: Some(format!("sha256:{}", "0".repeat(64))),
            ..spec
        };
        let err = fetcher.fetch(&bad, &dest).unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unsupported_scheme() {
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(dir.path().join("cache"));
        let spec = SourceSpec {
            url: "ftp://example.org/x.tar.gz".to_string(),
            checksum: None,
            strip_components: 0,
        };
        let err = fetcher.fetch(&spec, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(_)));
    }
}
