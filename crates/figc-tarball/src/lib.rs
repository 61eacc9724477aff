//! Safe tar.gz extraction
//!
//! Extracts IG package tarballs into a staging directory. Entry paths are
//! validated twice: a lexical sanitize (absolute paths, drive letters, `..`)
//! and a canonicalized prefix check against the staging root after parent
//! directories exist. Symlinks, hardlinks, and device entries are skipped;
//! IG packages never carry them and admitting them opens escape paths.

use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use figc_io::paths::{sanitize_entry_path, PathError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum TarballError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("tar error: {0}")]
    Tar(String),

    #[error("non-UTF8 path in tarball")]
    NonUtf8Path,

    #[error(transparent)]
    UnsafePath(#[from] PathError),

    #[error("archive entry escapes extraction root: {path}")]
    Escape { path: Utf8PathBuf },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create file {path}: {source}")]
    CreateFile {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write file {path}: {source}")]
    WriteFile {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("failed to set permissions on {path}: {source}")]
    SetPermissions {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("extraction cancelled")]
    Cancelled,

    #[error("spawn_blocking failed: {0}")]
    SpawnBlocking(#[from] tokio::task::JoinError),
}

/// Extract a gzip-compressed tar archive into `dest`.
///
/// `dest` must already exist and be exclusively owned by the caller (the
/// job's staging directory). Cancellation is observed between entries; a
/// cancelled extraction leaves a partial `dest` for the caller to remove.
pub async fn extract(
    archive: Utf8PathBuf,
    dest: Utf8PathBuf,
    cancel: CancellationToken,
) -> Result<(), TarballError> {
    tokio::task::spawn_blocking(move || extract_sync(&archive, &dest, &cancel)).await?
}

fn extract_sync(
    archive: &Utf8Path,
    dest: &Utf8Path,
    cancel: &CancellationToken,
) -> Result<(), TarballError> {
    let file = std::fs::File::open(archive).map_err(|e| TarballError::Open {
        path: archive.to_owned(),
        source: e,
    })?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    // The staging root is canonicalized once; every entry's real parent must
    // stay under it even if something tampers with the tree mid-extraction.
    let dest_canon = std::fs::canonicalize(dest).map_err(|e| TarballError::Open {
        path: dest.to_owned(),
        source: e,
    })?;

    for entry in tar.entries().map_err(|e| TarballError::Tar(e.to_string()))? {
        if cancel.is_cancelled() {
            return Err(TarballError::Cancelled);
        }

        let mut entry = entry.map_err(|e| TarballError::Tar(e.to_string()))?;
        let raw_path = String::from_utf8(entry.path_bytes().into_owned())
            .map_err(|_| TarballError::NonUtf8Path)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                let relative = sanitize_entry_path(&raw_path)?;
                let target = dest.join(&relative);
                std::fs::create_dir_all(&target).map_err(|e| TarballError::CreateDir {
                    path: target.clone(),
                    source: e,
                })?;
                ensure_contained(&target, &dest_canon)?;
            }
            tar::EntryType::Regular => {
                let relative = sanitize_entry_path(&raw_path)?;
                let target = dest.join(&relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| TarballError::CreateDir {
                        path: parent.to_owned(),
                        source: e,
                    })?;
                    ensure_contained(parent, &dest_canon)?;
                }

                let mut output =
                    std::fs::File::create(&target).map_err(|e| TarballError::CreateFile {
                        path: target.clone(),
                        source: e,
                    })?;
                copy_entry(&mut entry, &mut output, &target)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        if mode & 0o111 != 0 {
                            let perms = std::fs::Permissions::from_mode(mode);
                            std::fs::set_permissions(&target, perms).map_err(|e| {
                                TarballError::SetPermissions {
                                    path: target.clone(),
                                    source: e,
                                }
                            })?;
                        }
                    }
                }
            }
            other => {
                // Symlinks, hardlinks, devices, fifos: not part of IG
                // packages, never materialized.
                tracing::debug!(entry = %raw_path, kind = ?other, "skipping non-regular archive entry");
            }
        }
    }

    Ok(())
}

fn copy_entry<R: Read>(
    entry: &mut R,
    output: &mut std::fs::File,
    target: &Utf8Path,
) -> Result<(), TarballError> {
    std::io::copy(entry, output).map_err(|e| TarballError::WriteFile {
        path: target.to_owned(),
        source: e,
    })?;
    Ok(())
}

/// The canonicalized path must start with the canonicalized staging root.
fn ensure_contained(path: &Utf8Path, dest_canon: &std::path::Path) -> Result<(), TarballError> {
    let canon = std::fs::canonicalize(path).map_err(|e| TarballError::CreateDir {
        path: path.to_owned(),
        source: e,
    })?;
    if !canon.starts_with(dest_canon) {
        return Err(TarballError::Escape {
            path: path.to_owned(),
        });
    }
    Ok(())
}
