//! Build options and engine path layout.
//!
//! `BuildOptions` is the single configuration value threaded from the CLI
//! through the driver, the stage builder, and the cache client.

use std::path::PathBuf;

/// `Author` recorded in layer history entries.
pub const AUTHOR: &str = "strata";

/// User-Agent sent by the registry client.
pub const USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

/// Default PATH for images built `FROM scratch`.
pub const SCRATCH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How file fingerprints are computed during snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Hash metadata and full file contents.
    #[default]
    Full,
    /// Hash metadata and mtime only; contents are never read.
    Time,
}

impl SnapshotMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(SnapshotMode::Full),
            "time" => Some(SnapshotMode::Time),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotMode::Full => "full",
            SnapshotMode::Time => "time",
        }
    }
}

impl std::fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for a single build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Path to the Dockerfile, absolute or relative to the context.
    pub dockerfile: PathBuf,

    /// Build context directory.
    pub context: PathBuf,

    /// Registry references the final image is pushed to.
    pub destinations: Vec<String>,

    /// Build arguments in KEY=VALUE form.
    pub build_args: Vec<String>,

    /// Stop at this stage instead of the Dockerfile's last stage.
    pub target: Option<String>,

    /// Fingerprint mode for snapshotting.
    pub snapshot_mode: SnapshotMode,

    /// Collapse the final stage into a single layer taken after the last
    /// instruction.
    pub single_snapshot: bool,

    /// Canonicalize the final image for byte-identical rebuilds.
    pub reproducible: bool,

    /// Consult and populate the remote layer cache.
    pub use_cache: bool,

    /// Repository for cached layers; defaults to `<destination>/cache`.
    pub cache_repo: Option<String>,

    /// Directory of pre-warmed base-image tarballs.
    pub cache_dir: Option<PathBuf>,

    /// Build but do not push the final image.
    pub no_push: bool,

    /// Write the final image to this tarball instead of pushing.
    pub tar_path: Option<PathBuf>,

    /// Talk to registries over plain HTTP.
    pub insecure: bool,

    /// Accept invalid registry TLS certificates.
    pub skip_tls_verify: bool,

    /// Root filesystem the build executes against.
    pub root_dir: PathBuf,

    /// Engine work directory holding intermediate stages and scratch space.
    /// Never captured in layers.
    pub work_dir: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dockerfile: PathBuf::from("Dockerfile"),
            context: PathBuf::from("/workspace"),
            destinations: Vec::new(),
            build_args: Vec::new(),
            target: None,
            snapshot_mode: SnapshotMode::Full,
            single_snapshot: false,
            reproducible: false,
            use_cache: false,
            cache_repo: None,
            cache_dir: None,
            no_push: false,
            tar_path: None,
            insecure: false,
            skip_tls_verify: false,
            root_dir: PathBuf::from("/"),
            work_dir: PathBuf::from("/strata"),
        }
    }
}

impl BuildOptions {
    /// Tarballs of saved intermediate stages, keyed by stage index.
    pub fn intermediate_stage_path(&self, index: usize) -> PathBuf {
        self.work_dir.join("stages").join(index.to_string())
    }

    /// Extracted filesystem of a saved stage, used by `COPY --from=<index>`.
    pub fn dependency_dir(&self, index: usize) -> PathBuf {
        self.work_dir.join(index.to_string())
    }

    /// Per-stage scratch area for ADD downloads and tar expansions.
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }

    /// Resolve the Dockerfile path: absolute, or relative to the context.
    pub fn dockerfile_path(&self) -> PathBuf {
        if self.dockerfile.is_absolute() || self.dockerfile.exists() {
            self.dockerfile.clone()
        } else {
            self.context.join(&self.dockerfile)
        }
    }

    /// The cache repository layers are stored in.
    pub fn cache_repository(&self) -> Option<String> {
        if let Some(repo) = &self.cache_repo {
            return Some(repo.clone());
        }
        // Derive from the first destination: strip the tag, append /cache.
        let destination = self.destinations.first()?;
        let repo = match destination.rsplit_once(':') {
            // A colon inside the last path component is a tag separator; a
            // colon before a slash belongs to a registry port.
            Some((head, tail)) if !tail.contains('/') => head,
            _ => destination.as_str(),
        };
        Some(format!("{repo}/cache"))
    }
}
