//! Layer cache client.
//!
//! Produced layers are stored as single-layer images tagged by cache key in a
//! cache repository. Lookups that fail for any reason degrade to a miss; cache
//! pushes that fail are logged and forgotten. Only the final destination push
//! is allowed to kill a build.
//!
//! The same module consults the warm base-image directory populated by an
//! external warmer.

use crate::config::BuildOptions;
use crate::error::Result;
use crate::image::{tarball, Image, Layer};
use crate::registry::RegistryClient;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Looks up a cached layer under `cache_key`. Returns the single-layer image
/// on a hit, `None` on a miss or any lookup failure.
pub async fn check_cache_for_layer(
    opts: &BuildOptions,
    registry: &RegistryClient,
    cache_key: &str,
) -> Option<Image> {
    let Some(repo) = opts.cache_repository() else {
        warn!("no cache repository configured and no destination to derive one from");
        return None;
    };
    let reference = format!("{repo}:{cache_key}");
    info!(reference, "checking for cached layer");

    match registry.pull(&reference).await {
        Ok(pulled) if !pulled.image.layers.is_empty() => {
            info!(reference, "cache hit");
            Some(pulled.image)
        }
        Ok(_) => {
            warn!(reference, "cached image has no layers, ignoring");
            None
        }
        Err(e) => {
            debug!(reference, "cache miss: {e}");
            None
        }
    }
}

/// Publishes `layer` under `cache_key` as a single-layer image. Failures are
/// logged but never propagate.
pub async fn push_layer_to_cache(
    opts: &BuildOptions,
    registry: &RegistryClient,
    cache_key: &str,
    layer: Layer,
    created_by: &str,
) {
    let Some(repo) = opts.cache_repository() else {
        return;
    };
    let reference = format!("{repo}:{cache_key}");
    info!(reference, "pushing layer to cache");

    // A minimal single-layer image, like appending onto the empty image.
    let mut entry = Image::default();
    entry.config_file.os = "linux".to_string();
    entry.append_layer(layer, created_by);

    if let Err(e) = registry.push(&reference, &entry).await {
        warn!(reference, "failed to push cache entry: {e}");
    }
}

/// A pre-warmed base image tarball for `reference`, if one exists under
/// `--cache-dir`.
pub fn local_base_image(opts: &BuildOptions, reference: &str) -> Result<Option<Image>> {
    let Some(path) = warmed_path(opts, reference) else {
        return Ok(None);
    };
    if !path.exists() {
        debug!(reference, path = %path.display(), "no warmed base image");
        return Ok(None);
    }
    info!(reference, path = %path.display(), "using warmed base image");
    tarball::read_from_file(&path).map(Some)
}

fn warmed_path(opts: &BuildOptions, reference: &str) -> Option<PathBuf> {
    let cache_dir = opts.cache_dir.as_ref()?;
    let key = format!("{:x}", Sha256::digest(reference.as_bytes()));
    Some(cache_dir.join(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::RunConfig;
    use tempfile::TempDir;

    #[test]
    fn test_warmed_path_is_keyed_by_reference() {
        let dir = TempDir::new().unwrap();
        let opts = BuildOptions {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let a = warmed_path(&opts, "alpine:3.12").unwrap();
        let b = warmed_path(&opts, "alpine:3.13").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
    }

    #[test]
    fn test_local_base_image_round_trip() {
        let dir = TempDir::new().unwrap();
        let opts = BuildOptions {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        assert!(local_base_image(&opts, "alpine:3.12").unwrap().is_none());

        let mut image = Image::empty();
        image.set_config(RunConfig::default());
        let path = warmed_path(&opts, "alpine:3.12").unwrap();
        tarball::write_to_file(&path, Some("alpine:3.12"), &image).unwrap();

        let loaded = local_base_image(&opts, "alpine:3.12").unwrap().unwrap();
        assert_eq!(loaded.config_file, image.config_file);
    }

    #[test]
    fn test_no_cache_dir_means_no_warm_lookup() {
        let opts = BuildOptions::default();
        assert!(local_base_image(&opts, "alpine:3.12").unwrap().is_none());
    }
}
