//! Filesystem snapshotting: diff the root filesystem against the layered map
//! and emit tar layers of added, changed, and deleted paths.

pub mod hasher;
pub mod layered_map;

use crate::error::{Result, StrataError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use hasher::Hasher;
pub use layered_map::LayeredMap;

/// Path prefixes that must never appear in a layer.
///
/// Owned by the stage builder and handed to the snapshotter by reference;
/// append-only within a run (`VOLUME` extends it).
#[derive(Debug, Clone)]
pub struct PathWhitelist {
    prefixes: Vec<PathBuf>,
}

impl PathWhitelist {
    /// Whitelist for a build rooted at `root`, shielding the engine's own
    /// work directory. Builds rooted at `/` additionally shield the kernel
    /// pseudo-filesystems and every active mount point.
    pub fn for_root(root: &Path, work_dir: &Path) -> Self {
        let mut prefixes = vec![work_dir.to_path_buf()];
        if root == Path::new("/") {
            for fixed in ["/proc", "/sys", "/dev", "/etc/mtab", "/var/run"] {
                prefixes.push(PathBuf::from(fixed));
            }
            prefixes.extend(mount_points());
        }
        Self { prefixes }
    }

    /// A whitelist that shields nothing, for extractions into directories the
    /// engine fully owns.
    pub fn empty() -> Self {
        Self { prefixes: Vec::new() }
    }

    pub fn add(&mut self, path: PathBuf) {
        debug!(path = %path.display(), "extending whitelist");
        self.prefixes.push(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    /// True if a whitelisted path lives at or below `path`, i.e. `path`
    /// cannot be deleted wholesale.
    pub fn shelters(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| prefix.starts_with(path))
    }
}

/// Mount points below `/`, read from mountinfo. Anything mounted into the
/// build container is not part of the image.
fn mount_points() -> Vec<PathBuf> {
    let Ok(contents) = fs::read_to_string("/proc/self/mountinfo") else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .filter(|mount| *mount != "/")
        .map(PathBuf::from)
        .collect()
}

/// Takes tar snapshots of the root filesystem.
///
/// `init` must be called exactly once per stage, after the base image is
/// unpacked; it primes layer 0 with the base filesystem state.
pub struct Snapshotter {
    layered_map: LayeredMap,
    root: PathBuf,
}

impl Snapshotter {
    pub fn new(hasher: Hasher, root: impl Into<PathBuf>) -> Self {
        Self { layered_map: LayeredMap::new(hasher), root: root.into() }
    }

    /// Digest of the current filesystem state, for cache keys.
    pub fn fs_key(&self) -> String {
        self.layered_map.fs_key()
    }

    /// Priming pass: records the base image's filesystem state and discards
    /// the tar.
    pub fn init(&mut self, whitelist: &PathWhitelist) -> Result<()> {
        self.snapshot_fs(whitelist)?;
        Ok(())
    }

    /// Full-filesystem pass. Returns the tar bytes, or `None` when neither
    /// additions nor whiteouts were produced.
    pub fn take_snapshot_fs(&mut self, whitelist: &PathWhitelist) -> Result<Option<Vec<u8>>> {
        info!("taking snapshot of full filesystem");
        self.snapshot_fs(whitelist)
    }

    /// Targeted pass over paths an instruction is known to have touched.
    /// Emits no whiteouts; targeted mode assumes no deletions.
    pub fn take_snapshot(
        &mut self,
        files: &[PathBuf],
        whitelist: &PathWhitelist,
    ) -> Result<Option<Vec<u8>>> {
        info!(count = files.len(), "taking snapshot of files");
        self.layered_map.push_layer();
        if files.is_empty() {
            return Ok(None);
        }

        let mut buf = Vec::new();
        let mut builder = tar_builder(&mut buf);
        let mut files_added = false;

        for file in files {
            let file = clean(file);
            if whitelist.contains(&file) {
                debug!(path = %file.display(), "whitelisted, not adding to layer");
                continue;
            }
            if self.layered_map.maybe_add(&file)? {
                self.append_entry(&mut builder, &file)?;
                files_added = true;
            }
        }

        finish(builder)?;
        Ok(files_added.then_some(buf))
    }

    fn snapshot_fs(&mut self, whitelist: &PathWhitelist) -> Result<Option<Vec<u8>>> {
        self.layered_map.push_layer();

        let mut buf = Vec::new();
        let mut builder = tar_builder(&mut buf);
        let mut files_added = false;

        for path in sorted_walk(&self.root, whitelist)? {
            if self.layered_map.maybe_add(&path)? {
                debug!(path = %path.display(), "adding to layer");
                self.append_entry(&mut builder, &path)?;
                files_added = true;
            }
        }

        let whiteouts_added = self.append_whiteouts(&mut builder, whitelist)?;

        finish(builder)?;
        Ok((files_added || whiteouts_added).then_some(buf))
    }

    /// Emits a whiteout for every known path no longer on disk, unless an
    /// ancestor's whiteout already covers it.
    fn append_whiteouts(
        &mut self,
        builder: &mut tar::Builder<&mut Vec<u8>>,
        whitelist: &PathWhitelist,
    ) -> Result<bool> {
        let mut known: Vec<PathBuf> = self.layered_map.flattened_paths().into_iter().collect();
        // Parents sort before children, so a directory's whiteout is recorded
        // before its contents are considered.
        known.sort();

        let mut added = false;
        'paths: for path in known {
            if fs::symlink_metadata(&path).is_ok() || whitelist.contains(&path) {
                continue;
            }
            for ancestor in path.ancestors().skip(1) {
                if ancestor == self.root {
                    break;
                }
                if self.layered_map.get_whiteout(ancestor) {
                    debug!(path = %path.display(), "ancestor already whited out");
                    continue 'paths;
                }
            }
            if self.layered_map.maybe_add_whiteout(&path) {
                debug!(path = %path.display(), "adding whiteout");
                self.append_whiteout_entry(builder, &path)?;
                added = true;
            }
        }
        Ok(added)
    }

    fn append_entry(
        &self,
        builder: &mut tar::Builder<&mut Vec<u8>>,
        path: &Path,
    ) -> Result<()> {
        let rel = match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => return Ok(()),
        };

        let meta = fs::symlink_metadata(path).map_err(|e| StrataError::io(path, e))?;
        let file_type = meta.file_type();
        if !file_type.is_file() && !file_type.is_dir() && !file_type.is_symlink() {
            // Sockets and device nodes have no place in an image layer.
            warn!(path = %path.display(), "skipping special file");
            return Ok(());
        }

        builder
            .append_path_with_name(path, rel)
            .map_err(|e| StrataError::Snapshot {
                reason: format!("adding {} to tar: {e}", path.display()),
            })
    }

    fn append_whiteout_entry(
        &self,
        builder: &mut tar::Builder<&mut Vec<u8>>,
        path: &Path,
    ) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StrataError::Snapshot {
                reason: format!("whiteout for unnameable path {}", path.display()),
            })?;
        let parent = path.parent().unwrap_or(&self.root);
        let rel_parent = parent.strip_prefix(&self.root).unwrap_or(Path::new(""));
        let marker = rel_parent.join(format!(".wh.{name}"));

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &marker, std::io::empty())
            .map_err(|e| StrataError::Snapshot {
                reason: format!("adding whiteout {} to tar: {e}", marker.display()),
            })
    }
}

fn tar_builder(buf: &mut Vec<u8>) -> tar::Builder<&mut Vec<u8>> {
    let mut builder = tar::Builder::new(buf);
    builder.follow_symlinks(false);
    builder
}

fn finish(builder: tar::Builder<&mut Vec<u8>>) -> Result<()> {
    builder
        .into_inner()
        .map(|_| ())
        .map_err(|e| StrataError::Snapshot { reason: format!("finishing tar: {e}") })
}

/// Depth-first walk in lexical order, pruning whitelisted subtrees, so tar
/// layers are deterministic.
fn sorted_walk(root: &Path, whitelist: &PathWhitelist) -> Result<Vec<PathBuf>> {
    fn descend(dir: &Path, whitelist: &PathWhitelist, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| StrataError::io(dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StrataError::io(dir, e))?;
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            if whitelist.contains(&path) {
                debug!(path = %path.display(), "whitelisted, not adding to layer");
                continue;
            }
            let meta = fs::symlink_metadata(&path).map_err(|e| StrataError::io(&path, e))?;
            let is_dir = meta.is_dir();
            out.push(path.clone());
            if is_dir {
                descend(&path, whitelist, out)?;
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    descend(root, whitelist, &mut out)?;
    Ok(out)
}

/// Normalizes away `.` and trailing separators without touching the
/// filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn entries(tar_bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tar_bytes);
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(path, data);
        }
        out
    }

    fn snapshotter(root: &TempDir) -> (Snapshotter, PathWhitelist) {
        let mut s = Snapshotter::new(Hasher::Full, root.path());
        let w = PathWhitelist::empty();
        s.init(&w).unwrap();
        (s, w)
    }

    #[test]
    fn test_no_change_yields_no_layer() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("f"), "x").unwrap();
        let (mut s, w) = snapshotter(&root);
        assert!(s.take_snapshot_fs(&w).unwrap().is_none());
    }

    #[test]
    fn test_created_file_is_captured() {
        let root = TempDir::new().unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::write(root.path().join("new"), "hello").unwrap();
        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        let map = entries(&tar);
        assert_eq!(map.get("new").map(Vec::as_slice), Some(b"hello".as_slice()));
    }

    #[test]
    fn test_chmod_is_captured() {
        use std::os::unix::fs::PermissionsExt;
        let root = TempDir::new().unwrap();
        let file = root.path().join("f");
        fs::write(&file, "x").unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        assert!(entries(&tar).contains_key("f"));
    }

    #[test]
    fn test_deleted_file_yields_whiteout() {
        let root = TempDir::new().unwrap();
        let sub = root.path().join("etc");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("hostname"), "h").unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::remove_file(sub.join("hostname")).unwrap();
        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        let map = entries(&tar);
        assert!(map.contains_key("etc/.wh.hostname"));
        assert_eq!(map.get("etc/.wh.hostname").map(Vec::len), Some(0));
    }

    #[test]
    fn test_whiteout_dominance() {
        let root = TempDir::new().unwrap();
        let a = root.path().join("a");
        fs::create_dir_all(a.join("b")).unwrap();
        fs::write(a.join("b").join("c"), "x").unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::remove_dir_all(a.join("b")).unwrap();
        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        let map = entries(&tar);
        assert!(map.contains_key("a/.wh.b"));
        assert!(!map.contains_key("a/b/.wh.c"));
    }

    #[test]
    fn test_whitelisted_paths_never_appear() {
        let root = TempDir::new().unwrap();
        let (mut s, mut w) = snapshotter(&root);
        w.add(root.path().join("secret"));

        fs::create_dir(root.path().join("secret")).unwrap();
        fs::write(root.path().join("secret").join("f"), "x").unwrap();
        fs::write(root.path().join("visible"), "y").unwrap();

        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        let map = entries(&tar);
        assert!(map.contains_key("visible"));
        assert!(!map.keys().any(|k| k.contains("secret")));
    }

    #[test]
    fn test_targeted_snapshot_only_lists_changed() {
        let root = TempDir::new().unwrap();
        let (mut s, w) = snapshotter(&root);

        let touched = root.path().join("copied");
        fs::write(&touched, "contents").unwrap();
        fs::write(root.path().join("unrelated"), "z").unwrap();

        let tar = s
            .take_snapshot(&[touched.clone()], &w)
            .unwrap()
            .expect("layer expected");
        let map = entries(&tar);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("copied"));

        // Re-snapshotting the same unchanged file yields nothing.
        assert!(s.take_snapshot(&[touched], &w).unwrap().is_none());
    }

    #[test]
    fn test_symlink_retarget_is_captured() {
        let root = TempDir::new().unwrap();
        let link = root.path().join("l");
        std::os::unix::fs::symlink("one", &link).unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink("two", &link).unwrap();
        let tar = s.take_snapshot_fs(&w).unwrap().expect("layer expected");
        assert!(entries(&tar).contains_key("l"));
    }

    #[test]
    fn test_tar_entries_sorted() {
        let root = TempDir::new().unwrap();
        let (mut s, w) = snapshotter(&root);

        fs::write(root.path().join("zebra"), "z").unwrap();
        fs::write(root.path().join("apple"), "a").unwrap();
        fs::create_dir(root.path().join("mid")).unwrap();
        fs::write(root.path().join("mid").join("kiwi"), "k").unwrap();

        let tar = s.take_snapshot_fs(&w).unwrap().unwrap();
        let mut archive = tar::Archive::new(tar.as_slice());
        let order: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(order, vec!["apple", "mid", "mid/kiwi", "zebra"]);
    }
}
