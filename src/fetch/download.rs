//! HTTP download with progress reporting.

use super::FetchError;
use crate::output;
use std::io::{Read, Write};
use std::path::Path;

/// Download a URL to a destination path, reporting byte progress when the
/// server advertises a content length.
pub fn download(url: &str, dest: &Path) -> Result<(), FetchError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let filename = dest
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let pb = output::spinner(&format!("downloading {}", filename));

    let response = ureq::get(url).call().map_err(|e| FetchError::Download {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(len) = response
        .header("content-length")
        .and_then(|s| s.parse().ok())
    {
        output::upgrade_to_bytes(&pb, len);
    }

    // Write to a temp name first so an interrupted download never poses as
    // a complete cache entry.
    let partial = dest.with_extension("part");
    let mut file = std::fs::File::create(&partial)?;
    let mut reader = response.into_reader();
    let mut buffer = [0u8; 8192];
    let mut total_bytes = 0u64;

    loop {
        let n = reader.read(&mut buffer).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            FetchError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])?;
        total_bytes += n as u64;
        pb.set_position(total_bytes);
    }

    file.sync_all()?;
    drop(file);
    std::fs::rename(&partial, dest)?;

    pb.finish_and_clear();
    output::detail(&format!("downloaded {} ({} bytes)", filename, total_bytes));
    Ok(())
}
