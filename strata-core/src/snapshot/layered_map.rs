//! Layered path → fingerprint maps backing change detection.
//!
//! One layer triple is pushed per snapshot pass; only the top layer is ever
//! written. Lookups scan from the top layer down, so the effective fingerprint
//! of a path is always the most recent one.

use crate::error::Result;
use crate::snapshot::hasher::{ignore_mtime_hash, Hasher};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct LayeredMap {
    /// Change-detection fingerprints (mode-dependent).
    layers: Vec<HashMap<PathBuf, String>>,
    /// Mtime-free fingerprints feeding `fs_key`.
    tar_hashes: Vec<HashMap<PathBuf, String>>,
    /// Paths recorded as deleted.
    whiteouts: Vec<HashSet<PathBuf>>,
    hasher: Hasher,
}

impl LayeredMap {
    pub fn new(hasher: Hasher) -> Self {
        Self { layers: Vec::new(), tar_hashes: Vec::new(), whiteouts: Vec::new(), hasher }
    }

    /// Opens a new layer triple. Called once at the start of every snapshot
    /// pass, before any walk.
    pub fn push_layer(&mut self) {
        self.layers.push(HashMap::new());
        self.tar_hashes.push(HashMap::new());
        self.whiteouts.push(HashSet::new());
    }

    /// Top-down fingerprint lookup.
    pub fn get(&self, path: &Path) -> Option<&str> {
        self.layers.iter().rev().find_map(|layer| layer.get(path).map(String::as_str))
    }

    /// Top-down whiteout lookup.
    pub fn get_whiteout(&self, path: &Path) -> bool {
        self.whiteouts.iter().rev().any(|layer| layer.contains(path))
    }

    /// Unconditionally fingerprints `path` into the top layer, and records the
    /// mtime-free fingerprint alongside.
    pub fn add(&mut self, path: &Path) -> Result<()> {
        let hash = self.hasher.hash(path)?;
        let tar_hash = ignore_mtime_hash(path)?;
        let top = self.layers.len() - 1;
        self.layers[top].insert(path.to_path_buf(), hash);
        self.tar_hashes[top].insert(path.to_path_buf(), tar_hash);
        Ok(())
    }

    /// Fingerprints `path` and records it in the top layer iff it differs from
    /// the effective fingerprint. Returns whether it was recorded.
    pub fn maybe_add(&mut self, path: &Path) -> Result<bool> {
        let new = self.hasher.hash(path)?;
        if self.get(path) == Some(new.as_str()) {
            return Ok(false);
        }
        let tar_hash = ignore_mtime_hash(path)?;
        let top = self.layers.len() - 1;
        self.layers[top].insert(path.to_path_buf(), new);
        self.tar_hashes[top].insert(path.to_path_buf(), tar_hash);
        Ok(true)
    }

    /// Records a whiteout in the top layer unless one is already in effect.
    /// Returns whether it was recorded.
    pub fn maybe_add_whiteout(&mut self, path: &Path) -> bool {
        if self.get_whiteout(path) {
            return false;
        }
        let top = self.whiteouts.len() - 1;
        self.whiteouts[top].insert(path.to_path_buf());
        true
    }

    /// Every path known to any layer, excluding tar whiteout markers
    /// (basenames starting with `.wh.`) which are not real files.
    pub fn flattened_paths(&self) -> HashSet<PathBuf> {
        let mut paths = HashSet::new();
        for layer in &self.layers {
            for path in layer.keys() {
                let is_marker = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(".wh."));
                if !is_marker {
                    paths.insert(path.clone());
                }
            }
        }
        paths
    }

    /// Deterministic digest of the filesystem state: SHA256 over the sorted
    /// `path=tar_hash` projection, topmost entry winning per path.
    pub fn fs_key(&self) -> String {
        let mut effective: HashMap<&Path, &str> = HashMap::new();
        for layer in &self.tar_hashes {
            for (path, hash) in layer {
                effective.insert(path, hash);
            }
        }
        let mut entries: Vec<(&Path, &str)> = effective.into_iter().collect();
        entries.sort();

        let mut hasher = Sha256::new();
        for (path, hash) in entries {
            hasher.update(path.as_os_str().as_encoded_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
