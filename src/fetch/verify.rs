//! Checksum verification for fetched artifacts.
//!
//! Supports SHA256, SHA512, and BLAKE3. Files are hashed in chunks; large
//! files get a coarse progress readout.

use super::FetchError;
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files during hashing (1MB)
const CHUNK_SIZE: usize = 1024 * 1024;

/// Threshold for showing hashing progress (100MB)
const PROGRESS_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Blake3 => "BLAKE3",
        }
    }

    /// Hex digest length for this algorithm
    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// A parsed checksum declaration: algorithm plus lowercase hex digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl Checksum {
    /// Parse `"sha256:<hex>"`, `"sha512:<hex>"`, `"blake3:<hex>"`, or bare
    /// hex (treated as sha256).
    pub fn parse(s: &str) -> Result<Self, FetchError> {
        let (algorithm, hex) = match s.split_once(':') {
            Some(("sha256", hex)) => (HashAlgorithm::Sha256, hex),
            Some(("sha512", hex)) => (HashAlgorithm::Sha512, hex),
            Some(("blake3", hex)) => (HashAlgorithm::Blake3, hex),
            Some((other, _)) => {
                return Err(FetchError::InvalidChecksum(format!(
                    "unknown algorithm '{}'",
                    other
                )));
            }
            None => (HashAlgorithm::Sha256, s),
        };

        let hex = hex.to_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FetchError::InvalidChecksum(format!(
                "malformed {} digest '{}'",
                algorithm.name(),
                hex
            )));
        }

        Ok(Self { algorithm, hex })
    }
}

/// Verify a file against a checksum declaration.
pub fn verify(file: &Path, checksum: &Checksum) -> Result<(), FetchError> {
    let mut f = std::fs::File::open(file)?;
    let file_size = f.metadata().map(|m| m.len()).unwrap_or(0);
    let show_progress = file_size > PROGRESS_THRESHOLD;

    let actual = match checksum.algorithm {
        HashAlgorithm::Sha256 => hash_digest::<sha2::Sha256>(&mut f, file_size, show_progress)?,
        HashAlgorithm::Sha512 => hash_digest::<sha2::Sha512>(&mut f, file_size, show_progress)?,
        HashAlgorithm::Blake3 => hash_blake3(&mut f, file_size, show_progress)?,
    };

    if actual != checksum.hex {
        return Err(FetchError::ChecksumMismatch {
            algorithm: checksum.algorithm.name(),
            file: file.display().to_string(),
            expected: checksum.hex.clone(),
            actual,
        });
    }

    Ok(())
}

/// Compute a digest using the sha2 crate (SHA256/SHA512)
fn hash_digest<D: sha2::Digest>(
    reader: &mut impl Read,
    file_size: u64,
    show_progress: bool,
) -> Result<String, FetchError> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total_read = 0u64;
    let mut last_percent = 0u8;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_read += n as u64;
        report_progress(total_read, file_size, show_progress, &mut last_percent);
    }
    finish_progress(show_progress);

    Ok(hex::encode(hasher.finalize()))
}

/// Compute a BLAKE3 digest (separate implementation due to different API)
fn hash_blake3(
    reader: &mut impl Read,
    file_size: u64,
    show_progress: bool,
) -> Result<String, FetchError> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total_read = 0u64;
    let mut last_percent = 0u8;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_read += n as u64;
        report_progress(total_read, file_size, show_progress, &mut last_percent);
    }
    finish_progress(show_progress);

    Ok(hasher.finalize().to_hex().to_string())
}

fn report_progress(total_read: u64, file_size: u64, show: bool, last_percent: &mut u8) {
    if show && file_size > 0 {
        let percent = ((total_read * 100) / file_size) as u8;
        if percent >= *last_percent + 10 {
            print!("\r     checksum: {}%...", percent);
            std::io::Write::flush(&mut std::io::stdout()).ok();
            *last_percent = percent;
        }
    }
}

fn finish_progress(show: bool) {
    if show {
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_prefixed_and_bare() {
        let c = Checksum::parse(&format!("sha256:{}", "A".repeat(64))).unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Sha256);
        assert_eq!(c.hex, "a".repeat(64));

        let c = Checksum::parse(&"b".repeat(64)).unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Sha256);

        let c = Checksum::parse(&format!("sha512:{}", "c".repeat(128))).unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Sha512);

        let c = Checksum::parse(&format!("blake3:{}", "d".repeat(64))).unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Blake3);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Checksum::parse("md5:abcd").is_err());
        assert!(Checksum::parse("sha256:short").is_err());
        assert!(Checksum::parse(&format!("sha256:{}", "z".repeat(64))).is_err());
    }

    #[test]
    fn test_verify_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("blob");
        std::fs::write(&file, b"some source archive").unwrap();

        let digest = {
            use sha2::Digest;
            hex::encode(sha2::Sha256::digest(b"some source archive"))
        };
        let good = Checksum::parse(&format!("sha256:{}", digest)).unwrap();
        verify(&file, &good).unwrap();

        let bad = Checksum::parse(&format!("sha256:{}", "0".repeat(64))).unwrap();
        let err = verify(&file, &bad).unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_verify_blake3() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("blob");
        std::fs::write(&file, b"blake me").unwrap();

        let digest = blake3::hash(b"blake me").to_hex().to_string();
        let checksum = Checksum::parse(&format!("blake3:{}", digest)).unwrap();
        verify(&file, &checksum).unwrap();
    }
}
