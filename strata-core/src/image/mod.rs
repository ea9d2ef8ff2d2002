//! In-memory image assembly.
//!
//! An [`Image`] is the growing pair of (layer stack, config file). The stage
//! builder appends one layer per non-empty snapshot; the driver serializes the
//! result to a registry push or a tarball.

pub mod config;
pub mod tarball;

use crate::config::{AUTHOR, SCRATCH_ENV};
use crate::error::{Result, StrataError};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use tracing::debug;

pub use config::{ConfigFile, History, RunConfig};

/// Docker schema 2 media types used for assembled images.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// A single gzip-compressed tar layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub media_type: String,
    pub compressed: Vec<u8>,
    /// `sha256:` digest of the compressed bytes.
    pub digest: String,
    /// `sha256:` digest of the uncompressed tar.
    pub diff_id: String,
}

impl Layer {
    /// Compresses a tar stream into a layer.
    pub fn from_tar(tar: &[u8]) -> Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(tar)
            .and_then(|_| encoder.finish())
            .map(|compressed| Self {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: sha256_digest(&compressed),
                diff_id: sha256_digest(tar),
                compressed,
            })
            .map_err(|e| StrataError::Snapshot { reason: format!("compressing layer: {e}") })
    }

    /// Wraps already-compressed bytes, e.g. pulled from a registry.
    pub fn from_compressed(compressed: Vec<u8>, media_type: String) -> Result<Self> {
        let digest = sha256_digest(&compressed);
        let diff_id = sha256_digest(&decompress(&compressed)?);
        Ok(Self { media_type, compressed, digest, diff_id })
    }

    /// The uncompressed tar stream.
    pub fn uncompressed(&self) -> Result<Vec<u8>> {
        decompress(&self.compressed)
    }
}

/// An OCI image under construction.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub layers: Vec<Layer>,
    pub config_file: ConfigFile,
}

impl Image {
    /// The empty image `FROM scratch` builds on.
    pub fn empty() -> Self {
        let mut config_file = ConfigFile {
            architecture: normalized_arch().to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        config_file.config.env = vec![SCRATCH_ENV.to_string()];
        Self { layers: Vec::new(), config_file }
    }

    /// Appends a layer with its history entry. Layer order always matches
    /// append order. History entries carry no timestamp: the config file is a
    /// cache-key component and must be stable across runs.
    pub fn append_layer(&mut self, layer: Layer, created_by: &str) {
        debug!(digest = %layer.digest, created_by, "appending layer");
        self.config_file.rootfs.diff_ids.push(layer.diff_id.clone());
        self.config_file.history.push(History {
            created_by: created_by.to_string(),
            author: AUTHOR.to_string(),
            ..Default::default()
        });
        self.layers.push(layer);
    }

    /// Records an instruction that produced no layer.
    pub fn append_empty_history(&mut self, created_by: &str) {
        self.config_file.history.push(History {
            created_by: created_by.to_string(),
            author: AUTHOR.to_string(),
            empty_layer: true,
            ..Default::default()
        });
    }

    /// Replaces the run config, stamping the creation time.
    pub fn set_config(&mut self, config: RunConfig) {
        self.config_file.config = config;
        self.config_file.created = Some(Utc::now());
    }

    /// Serialized config file.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.config_file)
            .map_err(|e| StrataError::InvalidConfig { reason: e.to_string() })
    }

    /// Serialized image manifest.
    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        let config_bytes = self.config_bytes()?;
        let manifest = Manifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE,
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                size: config_bytes.len() as u64,
                digest: sha256_digest(&config_bytes),
            },
            layers: self
                .layers
                .iter()
                .map(|layer| Descriptor {
                    media_type: layer.media_type.clone(),
                    size: layer.compressed.len() as u64,
                    digest: layer.digest.clone(),
                })
                .collect(),
        };
        serde_json::to_vec(&manifest)
            .map_err(|e| StrataError::InvalidConfig { reason: e.to_string() })
    }

    /// The image digest: SHA256 of the serialized manifest.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }

    /// Canonicalizes for reproducible builds: zeroes the config and history
    /// timestamps and rewrites every layer with epoch mtimes and root
    /// ownership, recomputing digests.
    pub fn canonicalize(&mut self) -> Result<()> {
        self.config_file.created = Some(config::epoch());
        for entry in &mut self.config_file.history {
            entry.created = None;
        }

        let layers = std::mem::take(&mut self.layers);
        self.config_file.rootfs.diff_ids.clear();
        for layer in layers {
            let tar = canonicalize_tar(&layer.uncompressed()?)?;
            let layer = Layer::from_tar(&tar)?;
            self.config_file.rootfs.diff_ids.push(layer.diff_id.clone());
            self.layers.push(layer);
        }
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    size: u64,
    digest: String,
}

#[derive(serde::Serialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Rewrites a tar stream with zeroed mtimes and uid/gid 0.
fn canonicalize_tar(tar_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut out = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut out);
        let entries = archive
            .entries()
            .map_err(|e| StrataError::Snapshot { reason: format!("reading layer tar: {e}") })?;
        for entry in entries {
            let mut entry = entry
                .map_err(|e| StrataError::Snapshot { reason: format!("reading tar entry: {e}") })?;
            let mut header = entry.header().clone();
            let path = entry
                .path()
                .map_err(|e| StrataError::Snapshot { reason: format!("tar entry path: {e}") })?
                .into_owned();
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| StrataError::Snapshot { reason: format!("tar entry data: {e}") })?;

            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            let _ = header.set_username("");
            let _ = header.set_groupname("");
            builder
                .append_data(&mut header, &path, data.as_slice())
                .map_err(|e| StrataError::Snapshot {
                    reason: format!("rewriting tar entry {}: {e}", path.display()),
                })?;
        }
        builder
            .finish()
            .map_err(|e| StrataError::Snapshot { reason: format!("finishing tar: {e}") })?;
    }
    Ok(out)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    // Registries may hand back uncompressed tar layers.
    if !bytes.starts_with(&[0x1f, 0x8b]) {
        return Ok(bytes.to_vec());
    }
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| StrataError::Snapshot { reason: format!("decompressing layer: {e}") })?;
    Ok(out)
}

/// Digest in registry notation.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

fn normalized_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
