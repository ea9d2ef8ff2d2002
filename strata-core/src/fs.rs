//! Materializing images onto the root filesystem, and wiping it between
//! stages.

use crate::error::{Result, StrataError};
use crate::image::Image;
use crate::snapshot::PathWhitelist;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Unpacks every layer of `image`, in order, into `root`.
///
/// Whiteout entries delete the corresponding path instead of being written.
/// Whitelisted paths are never touched.
pub fn unpack_image(image: &Image, root: &Path, whitelist: &PathWhitelist) -> Result<()> {
    info!(root = %root.display(), layers = image.layers.len(), "unpacking image");
    fs::create_dir_all(root).map_err(|e| StrataError::io(root, e))?;

    for layer in &image.layers {
        let tar = layer.uncompressed()?;
        unpack_layer(&tar, root, whitelist)?;
    }
    Ok(())
}

fn unpack_layer(tar_bytes: &[u8], root: &Path, whitelist: &PathWhitelist) -> Result<()> {
    let unpack_err = |reason: String| StrataError::FilesystemUnpack {
        root: root.to_path_buf(),
        reason,
    };

    let mut archive = tar::Archive::new(tar_bytes);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    // Ownership restoration needs root; real builds run as root inside a
    // container with the root dir at /.
    archive.set_preserve_ownerships(root == Path::new("/"));
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| unpack_err(format!("reading layer tar: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| unpack_err(format!("reading tar entry: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| unpack_err(format!("tar entry path: {e}")))?
            .into_owned();
        let target = root.join(&rel);

        if whitelist.contains(&target) {
            debug!(path = %target.display(), "whitelisted, not extracting");
            continue;
        }

        let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name == ".wh..wh..opq" {
            // Opaque whiteout: the directory's lower contents disappear.
            if let Some(parent) = target.parent() {
                clear_directory(parent)?;
            }
            continue;
        }
        if let Some(victim) = name.strip_prefix(".wh.") {
            let victim = target
                .parent()
                .map(|p| p.join(victim))
                .unwrap_or_else(|| root.join(victim));
            remove_path(&victim)?;
            continue;
        }

        // A file replacing a directory (or vice versa) must displace it.
        if let Ok(existing) = fs::symlink_metadata(&target) {
            let header_is_dir = entry.header().entry_type().is_dir();
            if existing.is_dir() != header_is_dir {
                remove_path(&target)?;
            }
        }

        entry
            .unpack_in(root)
            .map_err(|e| unpack_err(format!("unpacking {}: {e}", rel.display())))?;
    }
    Ok(())
}

/// Deletes everything under `root` that is not whitelisted. Directories that
/// shelter a whitelisted path are descended into rather than removed.
pub fn wipe_root(root: &Path, whitelist: &PathWhitelist) -> Result<()> {
    info!(root = %root.display(), "deleting filesystem before next stage");
    wipe_dir(root, whitelist)
}

fn wipe_dir(dir: &Path, whitelist: &PathWhitelist) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| StrataError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(dir, e))?;
        let path = entry.path();
        if whitelist.contains(&path) {
            debug!(path = %path.display(), "whitelisted, skipping wipe");
            continue;
        }
        let meta = fs::symlink_metadata(&path).map_err(|e| StrataError::io(&path, e))?;
        if meta.is_dir() && whitelist.shelters(&path) {
            wipe_dir(&path, whitelist)?;
            continue;
        }
        remove_path(&path)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| StrataError::io(path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| StrataError::io(path, e)),
        // Already gone; a whiteout for a path the base never had.
        Err(_) => {
            warn!(path = %path.display(), "whiteout for missing path");
            Ok(())
        }
    }
}

fn clear_directory(dir: &Path) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(dir, e))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}
