//! # Root Filesystem Extraction
//!
//! Expands a (possibly gzipped) tar image into an owned temp directory that
//! later becomes the jail's root via `pivot_root`.
//!
//! ## Entry Handling
//!
//! | Entry type | Action |
//! |------------|--------|
//! | directory | `mkdir -p` with the header's permission bits |
//! | regular file | create/truncate, explicit chmod from the header, stream body |
//! | symlink | anchor absolute targets inside the extraction root, keep relative ones verbatim |
//! | anything else | fail with `Unknown type flag` |
//!
//! ## Symlink Anchoring
//!
//! An absolute link target like `/bin/sh` is treated as rooted at the
//! extraction directory and rewritten as a relative path from the link's
//! parent, so the link still resolves inside the extracted tree once it is
//! the jail's `/`. Relative targets are used as-is.
//!
//! Two symlink failures are recoverable: "already exists" is tolerated, and
//! "not found" (archive lists the link before its parent directory) is
//! healed with one `mkdir -p` and a single retry.
//!
//! Path confinement against `..` escapes is intentionally not enforced; the
//! image is expected to come from a trusted source.

use crate::constants::TASK_FILE_PREFIX;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File, Permissions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tempfile::TempDir;
use tracing::debug;

/// Extracts the image file into a fresh `task`-prefixed temp directory.
///
/// The returned [`TempDir`] owns the extracted tree: dropping it removes
/// the directory recursively (best effort).
pub fn extract(image: &Path, compressed: bool) -> Result<TempDir> {
    let root = tempfile::Builder::new()
        .prefix(TASK_FILE_PREFIX)
        .tempdir()?;

    let file = File::open(image)?;
    if compressed {
        unpack(Archive::new(GzDecoder::new(file)), root.path())?;
    } else {
        unpack(Archive::new(file), root.path())?;
    }

    debug!(root = %root.path().display(), "extracted image");
    Ok(root)
}

fn unpack<R: Read>(mut archive: Archive<R>, root: &Path) -> Result<()> {
    for entry in archive.entries().map_err(|e| Error::ExtractFailure {
        path: root.display().to_string(),
        reason: e.to_string(),
    })? {
        let mut entry = entry.map_err(|e| Error::ExtractFailure {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;

        let rel = entry
            .path()
            .map_err(|e| Error::ExtractFailure {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?
            .into_owned();
        let dest = root.join(&rel);
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|e| extract_err(&rel, e))?;
                fs::set_permissions(&dest, Permissions::from_mode(mode))
                    .map_err(|e| extract_err(&rel, e))?;
            }
            EntryType::Regular => {
                let mut file = File::create(&dest).map_err(|e| extract_err(&rel, e))?;
                // The create above may have used permissive defaults.
                fs::set_permissions(&dest, Permissions::from_mode(mode))
                    .map_err(|e| extract_err(&rel, e))?;
                io::copy(&mut entry, &mut file).map_err(|e| extract_err(&rel, e))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| extract_err(&rel, e))?
                    .ok_or_else(|| Error::ExtractFailure {
                        path: rel.display().to_string(),
                        reason: "symlink entry without target".to_string(),
                    })?
                    .into_owned();
                place_symlink(root, &rel, &target)?;
            }
            other => {
                return Err(Error::UnknownTypeFlag {
                    flag: other.as_byte() as char,
                    path: rel.display().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn extract_err(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::ExtractFailure {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Creates the symlink for entry `rel` with the raw archive target.
///
/// Absolute targets are re-anchored under `root` and expressed relative to
/// the link's parent directory; relative targets pass through unchanged.
fn place_symlink(root: &Path, rel: &Path, raw_target: &Path) -> Result<()> {
    let link = root.join(rel);
    let link_parent = link.parent().unwrap_or(root).to_path_buf();

    let target = if raw_target.is_absolute() {
        let stripped = raw_target.strip_prefix("/").unwrap_or(raw_target);
        let anchored = root.join(stripped);
        relative_path(&link_parent, &anchored)
    } else {
        raw_target.to_path_buf()
    };

    match symlink(&target, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // The archive listed the link before its parent directory.
            fs::create_dir_all(&link_parent).map_err(|e| extract_err(rel, e))?;
            if raw_target.is_absolute() {
                let stripped = raw_target.strip_prefix("/").unwrap_or(raw_target);
                if let Some(parent) = root.join(stripped).parent() {
                    fs::create_dir_all(parent).map_err(|e| extract_err(rel, e))?;
                }
            }
            symlink(&target, &link).map_err(|e| extract_err(rel, e))
        }
        Err(e) => Err(extract_err(rel, e)),
    }
}

/// Computes the relative path from directory `from` to `to`.
///
/// Both inputs are absolute and are compared lexically (no filesystem
/// access), which is exactly what symlink targets need.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_sibling() {
        assert_eq!(
            relative_path(Path::new("/tmp/root/etc"), Path::new("/tmp/root/bin/sh")),
            PathBuf::from("../bin/sh")
        );
    }

    #[test]
    fn relative_path_same_dir() {
        assert_eq!(
            relative_path(Path::new("/tmp/root/bin"), Path::new("/tmp/root/bin/busybox")),
            PathBuf::from("busybox")
        );
    }

    #[test]
    fn relative_path_identical() {
        assert_eq!(
            relative_path(Path::new("/tmp/root"), Path::new("/tmp/root")),
            PathBuf::from(".")
        );
    }

    #[test]
    fn relative_path_deeper_source() {
        assert_eq!(
            relative_path(Path::new("/a/b/c/d"), Path::new("/a/x")),
            PathBuf::from("../../../x")
        );
    }
}
