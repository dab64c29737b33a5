//! `.tar.gz` extraction confined to one destination directory.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::error::{ExtError, Result};

/// Unpack `bytes` into `dest` on the blocking pool. Returns the number of
/// entries written. File modes declared in the archive are preserved.
pub(crate) async fn extract_tar_gz(bytes: Vec<u8>, dest: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || unpack(&bytes, &dest))
        .await
        .map_err(|e| ExtError::Archive(format!("extraction task failed: {e}")))?
}

fn unpack(bytes: &[u8], dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        ensure_relative(&path)?;

        match entry.header().entry_type() {
            EntryType::Symlink => {
                if let Some(target) = entry.link_name()? {
                    let base = path.parent().unwrap_or_else(|| Path::new(""));
                    ensure_contained(base, &target, &path)?;
                }
            }
            EntryType::Link => {
                if let Some(target) = entry.link_name()? {
                    ensure_contained(Path::new(""), &target, &path)?;
                }
            }
            _ => {}
        }

        if !entry.unpack_in(dest)? {
            return Err(escape(&path));
        }
        written += 1;
    }
    Ok(written)
}

fn escape(path: &Path) -> ExtError {
    ExtError::Archive(format!("entry escapes the destination: {}", path.display()))
}

fn ensure_relative(path: &Path) -> Result<()> {
    for c in path.components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(escape(path)),
        }
    }
    Ok(())
}

/// `target`, resolved from `base`, must stay below the archive root.
fn ensure_contained(base: &Path, target: &Path, entry: &Path) -> Result<()> {
    let mut depth: usize = 0;
    for c in base.components().chain(target.components()) {
        match c {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1).ok_or_else(|| escape(entry))?;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape(entry)),
        }
    }
    Ok(())
}
