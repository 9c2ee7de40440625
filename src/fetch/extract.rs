//! Native archive extraction (no external tools needed).
//!
//! Handles the tar family: gz, xz, bz2, zstd, and plain tar. Entry paths are
//! sanitized so an archive can never write outside the destination.

use super::FetchError;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// Archive formats recognized by filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Tar,
}

fn detect(path: &Path) -> Option<Format> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(Format::TarGz)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Some(Format::TarXz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        Some(Format::TarBz2)
    } else if name.ends_with(".tar.zst") {
        Some(Format::TarZst)
    } else if name.ends_with(".tar") {
        Some(Format::Tar)
    } else {
        None
    }
}

/// Whether the file looks like an archive we can unpack.
pub fn is_archive(path: &Path) -> bool {
    detect(path).is_some()
}

/// Unpack an archive into `dest`, stripping `strip_components` leading path
/// components from every entry (the usual top-level `name-version/` dir).
pub fn extract(archive: &Path, dest: &Path, strip_components: usize) -> Result<(), FetchError> {
    let format = detect(archive).ok_or_else(|| {
        FetchError::UnsupportedArchive(archive.display().to_string())
    })?;
    let file = BufReader::new(File::open(archive)?);

    match format {
        Format::TarGz => unpack_tar(flate2::read::GzDecoder::new(file), dest, strip_components),
        Format::TarXz => unpack_tar(xz2::read::XzDecoder::new(file), dest, strip_components),
        Format::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(file), dest, strip_components),
        Format::TarZst => unpack_tar(zstd::stream::read::Decoder::new(file)?, dest, strip_components),
        Format::Tar => unpack_tar(file, dest, strip_components),
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path, strip: usize) -> Result<(), FetchError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();

        let Some(rel) = sanitize(&raw, strip)? else {
            // entry fully consumed by strip_components
            continue;
        };
        let target = dest.join(&rel);

        // Links must stay inside the destination tree.
        if let Some(link) = entry.link_name()? {
            if link.is_absolute()
                || link.components().any(|c| matches!(c, Component::ParentDir))
            {
                return Err(FetchError::UnsafeArchivePath(format!(
                    "{} -> {}",
                    raw.display(),
                    link.display()
                )));
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }

    Ok(())
}

/// Strip leading components and reject absolute or escaping paths.
/// Returns `None` when stripping consumes the whole path.
fn sanitize(path: &Path, strip: usize) -> Result<Option<PathBuf>, FetchError> {
    let mut out = PathBuf::new();
    let mut kept = 0usize;
    let mut skipped = 0usize;

    for component in path.components() {
        match component {
            Component::Normal(seg) => {
                if skipped < strip {
                    skipped += 1;
                } else {
                    out.push(seg);
                    kept += 1;
                }
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FetchError::UnsafeArchivePath(path.display().to_string()));
            }
        }
    }

    Ok((kept > 0).then_some(out))
}
