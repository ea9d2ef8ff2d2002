//! Docker-save style image tarballs.
//!
//! Used for `--tar-path`, for persisting intermediate stages, and for loading
//! pre-warmed base images from the cache directory.

use crate::error::{Result, StrataError};
use crate::image::{Image, Layer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Writes `image` as a tarball at `path`. `reference`, when given, becomes the
/// RepoTags entry.
pub fn write_to_file(path: &Path, reference: Option<&str>, image: &Image) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
    }
    let file = fs::File::create(path).map_err(|e| StrataError::io(path, e))?;
    let mut builder = tar::Builder::new(file);

    let tb_err = |reason: String| StrataError::Tarball { path: path.to_path_buf(), reason };

    let config_bytes = image.config_bytes()?;
    let config_name = format!("{}.json", hex_of(&crate::image::sha256_digest(&config_bytes)));
    append_file(&mut builder, &config_name, &config_bytes).map_err(tb_err)?;

    let mut layer_names = Vec::new();
    for layer in &image.layers {
        let name = format!("{}.tar.gz", hex_of(&layer.digest));
        append_file(&mut builder, &name, &layer.compressed).map_err(tb_err)?;
        layer_names.push(name);
    }

    let manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags: reference.map(str::to_string).into_iter().collect(),
        layers: layer_names,
    }];
    let manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|e| tb_err(format!("serializing manifest: {e}")))?;
    append_file(&mut builder, "manifest.json", &manifest_bytes).map_err(tb_err)?;

    builder.finish().map_err(|e| tb_err(format!("finishing tarball: {e}")))?;
    info!(path = %path.display(), layers = image.layers.len(), "wrote image tarball");
    Ok(())
}

/// Loads an image tarball produced by `write_to_file` (or docker save).
pub fn read_from_file(path: &Path) -> Result<Image> {
    let file = fs::File::open(path).map_err(|e| StrataError::io(path, e))?;
    let mut archive = tar::Archive::new(file);

    let tb_err = |reason: String| StrataError::Tarball { path: path.to_path_buf(), reason };

    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    let entries = archive
        .entries()
        .map_err(|e| tb_err(format!("reading tarball: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| tb_err(format!("reading tarball entry: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| tb_err(format!("tarball entry path: {e}")))?
            .display()
            .to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| tb_err(format!("reading {name}: {e}")))?;
        files.insert(name, data);
    }

    let manifest_bytes = files
        .get("manifest.json")
        .ok_or_else(|| tb_err("missing manifest.json".to_string()))?;
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(manifest_bytes)
        .map_err(|e| tb_err(format!("parsing manifest.json: {e}")))?;
    let entry = manifest
        .first()
        .ok_or_else(|| tb_err("manifest.json is empty".to_string()))?;

    let config_bytes = files
        .get(&entry.config)
        .ok_or_else(|| tb_err(format!("missing config {}", entry.config)))?;
    let config_file = serde_json::from_slice(config_bytes)
        .map_err(|e| tb_err(format!("parsing config: {e}")))?;

    let mut layers = Vec::new();
    for name in &entry.layers {
        let bytes = files
            .remove(name)
            .ok_or_else(|| tb_err(format!("missing layer {name}")))?;
        layers.push(Layer::from_compressed(bytes, crate::image::LAYER_MEDIA_TYPE.to_string())?);
    }

    Ok(Image { layers, config_file })
}

fn append_file(
    builder: &mut tar::Builder<fs::File>,
    name: &str,
    contents: &[u8],
) -> std::result::Result<(), String> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| format!("adding {name}: {e}"))
}

/// Strips the `sha256:` prefix for use as a file name.
fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
