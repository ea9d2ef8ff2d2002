//! Registry client: resolve, pull, and push images.
//!
//! Thin wrapper over `oci-client` that adds reference-scoped authentication
//! from the docker config keychain, a builder-identifying User-Agent, and the
//! insecure-transport switches.

use crate::config::{BuildOptions, USER_AGENT};
use crate::error::{Result, StrataError};
use crate::image::{ConfigFile, Image, Layer};
use base64::Engine as _;
use oci_client::client::{Client, ClientConfig, ClientProtocol, Config as OciConfig, ImageLayer};
use oci_client::manifest::{self, ImageIndexEntry};
use oci_client::secrets::RegistryAuth;
use oci_client::Reference;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Always selects the linux image for the host architecture; the builder only
/// produces linux images.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    debug!("looking for linux/{arch} image variant");
    manifests
        .iter()
        .filter_map(|entry| Some((entry, entry.platform.as_ref()?)))
        .find(|(_, platform)| platform.os == "linux" && platform.architecture == arch)
        .map(|(entry, _)| entry.digest.clone())
}

/// A pulled image plus the manifest digest it resolved to.
#[derive(Debug)]
pub struct PulledImage {
    pub image: Image,
    pub digest: String,
}

pub struct RegistryClient {
    client: Client,
}

impl RegistryClient {
    pub fn new(opts: &BuildOptions) -> Self {
        let protocol = if opts.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::HttpsExcept(vec!["localhost".to_string()])
        };
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: opts.skip_tls_verify,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            user_agent: USER_AGENT,
            ..Default::default()
        };
        Self { client: Client::new(config) }
    }

    /// Resolves a tag reference and pulls config plus layers.
    pub async fn pull(&self, reference: &str) -> Result<PulledImage> {
        info!(reference, "pulling image");
        let parsed = parse_reference(reference)?;
        let auth = auth_for(&parsed);

        let data = self
            .client
            .pull(
                &parsed,
                &auth,
                vec![
                    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    manifest::IMAGE_LAYER_MEDIA_TYPE,
                ],
            )
            .await
            .map_err(|e| StrataError::BaseImageUnavailable {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;

        let config_file: ConfigFile =
            serde_json::from_slice(&data.config.data).map_err(|e| {
                StrataError::InvalidConfig {
                    reason: format!("config of {reference}: {e}"),
                }
            })?;

        let mut layers = Vec::with_capacity(data.layers.len());
        for layer in data.layers {
            layers.push(Layer::from_compressed(layer.data, layer.media_type)?);
        }

        let image = Image { layers, config_file };
        // Digest recomputed from the assembled manifest; stable for cache
        // keying regardless of what media types the registry served.
        let digest = image.digest()?;
        info!(reference, digest = %digest, "pulled image");
        Ok(PulledImage { image, digest })
    }

    /// Pushes `image` to `reference`.
    pub async fn push(&self, reference: &str, image: &Image) -> Result<()> {
        info!(reference, layers = image.layers.len(), "pushing image");
        let parsed = parse_reference(reference)?;
        let auth = auth_for(&parsed);

        let layers: Vec<ImageLayer> = image
            .layers
            .iter()
            .map(|layer| {
                ImageLayer::new(layer.compressed.clone(), layer.media_type.clone(), None)
            })
            .collect();
        let config = OciConfig::new(
            image.config_bytes()?,
            crate::image::CONFIG_MEDIA_TYPE.to_string(),
            None,
        );

        self.client
            .push(&parsed, &layers, config, &auth, None)
            .await
            .map_err(|e| StrataError::DestinationPush {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        info!(reference, "pushed image");
        Ok(())
    }
}

pub fn parse_reference(reference: &str) -> Result<Reference> {
    Reference::try_from(reference).map_err(|e| StrataError::InvalidReference {
        reference: reference.to_string(),
        reason: e.to_string(),
    })
}

/// The docker config keychain: per-registry basic auth from
/// `$DOCKER_CONFIG/config.json` (or `~/.docker/config.json`), anonymous
/// otherwise.
fn auth_for(reference: &Reference) -> RegistryAuth {
    match keychain_lookup(reference.registry()) {
        Some((username, password)) => {
            debug!(registry = reference.registry(), "using keychain credentials");
            RegistryAuth::Basic(username, password)
        }
        None => RegistryAuth::Anonymous,
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: std::collections::HashMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

fn keychain_lookup(registry: &str) -> Option<(String, String)> {
    let path = docker_config_path()?;
    let contents = std::fs::read_to_string(path).ok()?;
    let config: DockerConfig = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("malformed docker config: {e}");
            return None;
        }
    };

    // Docker Hub credentials are stored under the legacy index URL.
    let candidates: &[&str] = if registry == "docker.io" {
        &["docker.io", "index.docker.io", "https://index.docker.io/v1/"]
    } else {
        &[registry]
    };

    for key in candidates {
        let Some(entry) = config.auths.get(*key) else { continue };
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Some((user.clone(), pass.clone()));
        }
        if let Some(auth) = &entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, pass) = decoded.split_once(':')?;
            return Some((user.to_string(), pass.to_string()));
        }
    }
    None
}
