//! Per-stage build controller.
//!
//! Unpacks the base image, primes the snapshot baseline, then walks the
//! instruction list: consult the layer cache, execute, snapshot, append.

use crate::cache;
use crate::commands::{self, CommandContext, DockerCommand};
use crate::config::BuildOptions;
use crate::dockerfile::{args::BuildArgs, parser, BaseImage, Stage};
use crate::error::{Result, StrataError};
use crate::fs::unpack_image;
use crate::image::{tarball, ConfigFile, Image, Layer};
use crate::registry::RegistryClient;
use crate::snapshot::{Hasher, PathWhitelist, Snapshotter};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub struct StageBuilder<'a> {
    stage: Stage,
    opts: &'a BuildOptions,
    registry: &'a RegistryClient,
    pub image: Image,
    pub config: ConfigFile,
    snapshotter: Snapshotter,
    base_digest: String,
    build_args: BuildArgs,
    ctx: CommandContext,
}

impl<'a> StageBuilder<'a> {
    /// Resolves the stage's base image and sets up fresh per-stage state.
    pub async fn new(
        stage: Stage,
        opts: &'a BuildOptions,
        registry: &'a RegistryClient,
        global_args: &[(String, Option<String>)],
    ) -> Result<Self> {
        let mut stage = stage;
        let (image, base_digest) = retrieve_base_image(&stage, opts, registry).await?;
        let mut config = image.config_file.clone();

        // A base image with ONBUILD triggers has them executed first, and the
        // resulting image drops them.
        if !config.config.on_build.is_empty() {
            let triggers = std::mem::take(&mut config.config.on_build);
            info!(count = triggers.len(), "executing build triggers");
            let mut prepended = Vec::with_capacity(triggers.len() + stage.instructions.len());
            for trigger in &triggers {
                prepended.push(parser::parse_line(0, trigger)?);
            }
            prepended.append(&mut stage.instructions);
            stage.instructions = prepended;
        }

        let mut build_args = BuildArgs::new(&opts.build_args, global_args)?;
        build_args.begin_stage();

        let snapshotter = Snapshotter::new(Hasher::from(opts.snapshot_mode), &opts.root_dir);
        let ctx = CommandContext {
            root: opts.root_dir.clone(),
            context: opts.context.clone(),
            work_dir: opts.work_dir.clone(),
        };

        Ok(Self {
            stage,
            opts,
            registry,
            image,
            config,
            snapshotter,
            base_digest,
            build_args,
            ctx,
        })
    }

    /// Runs every instruction of the stage, growing `self.image`.
    pub async fn build(&mut self, whitelist: &mut PathWhitelist) -> Result<()> {
        unpack_image(&self.image, &self.opts.root_dir, whitelist)?;
        self.snapshotter.init(whitelist)?;

        let instructions = self.stage.instructions.clone();
        for (index, instruction) in instructions.iter().enumerate() {
            let is_final_cmd = index == instructions.len() - 1;
            let mut cmd = commands::get_command(instruction, &self.ctx);
            let created_by = cmd.created_by();
            info!(instruction = %created_by, "executing");

            let cache_key = self.cache_key(&created_by)?;
            if cmd.cacheable() && self.opts.use_cache {
                if let Some(cached) =
                    cache::check_cache_for_layer(self.opts, self.registry, &cache_key).await
                {
                    self.extract_cached_layer(cached, &created_by, whitelist)?;
                    continue;
                }
            }

            cmd.execute(&mut self.config, &mut self.build_args).await?;

            let contents = self.snapshot_for(cmd.as_ref(), is_final_cmd, whitelist)?;
            for volume in cmd.pending_volumes() {
                whitelist.add(volume);
            }

            let Some(contents) = contents else {
                debug!(instruction = %created_by, "no files changed, no layer added");
                self.image.append_empty_history(&created_by);
                continue;
            };

            let layer = Layer::from_tar(&contents)?;
            if cmd.cacheable() && self.opts.use_cache {
                cache::push_layer_to_cache(
                    self.opts,
                    self.registry,
                    &cache_key,
                    layer.clone(),
                    &created_by,
                )
                .await;
            }
            self.image.append_layer(layer, &created_by);
        }
        Ok(())
    }

    /// Folds the accumulated config into the image and returns it.
    pub fn finish(mut self) -> Image {
        let config = self.config.clone();
        self.image.config_file.author = config.author.clone();
        self.image.config_file.architecture = config.architecture.clone();
        self.image.config_file.os = config.os.clone();
        self.image.set_config(config.config);
        self.image
    }

    /// The snapshot decision matrix. Intermediate stages only need their last
    /// filesystem state; single-snapshot collapses the final stage the same
    /// way; otherwise each instruction gets its own pass, targeted when the
    /// instruction knows its outputs.
    fn snapshot_for(
        &mut self,
        cmd: &dyn DockerCommand,
        is_final_cmd: bool,
        whitelist: &PathWhitelist,
    ) -> Result<Option<Vec<u8>>> {
        if !self.stage.final_stage || self.opts.single_snapshot {
            if is_final_cmd {
                return self.snapshotter.take_snapshot_fs(whitelist);
            }
            return Ok(None);
        }
        match cmd.files_to_snapshot() {
            Some(files) => self.snapshotter.take_snapshot(&files, whitelist),
            None => self.snapshotter.take_snapshot_fs(whitelist),
        }
    }

    /// `SHA256(base_digest ‖ fs_key ‖ config_hash ‖ created_by)`.
    fn cache_key(&self, created_by: &str) -> Result<String> {
        let fs_key = self.snapshotter.fs_key();
        let config_bytes = serde_json::to_vec(&self.config)
            .map_err(|e| StrataError::InvalidConfig { reason: e.to_string() })?;
        let config_hash = format!("{:x}", Sha256::digest(&config_bytes));

        let mut hasher = Sha256::new();
        hasher.update(self.base_digest.as_bytes());
        hasher.update(fs_key.as_bytes());
        hasher.update(config_hash.as_bytes());
        hasher.update(created_by.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// A cache hit: materialize the cached layer onto the root so later cache
    /// keys see the same filesystem state as a real execution, refresh the
    /// layered map, and append the cached layer as-is.
    fn extract_cached_layer(
        &mut self,
        cached: Image,
        created_by: &str,
        whitelist: &PathWhitelist,
    ) -> Result<()> {
        info!(instruction = %created_by, "found cached layer, extracting to filesystem");
        unpack_image(&cached, &self.opts.root_dir, whitelist)?;
        self.snapshotter.take_snapshot_fs(whitelist)?;
        let layer = cached
            .layers
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::Snapshot {
                reason: "cached image has no layer".to_string(),
            })?;
        self.image.append_layer(layer, created_by);
        Ok(())
    }
}

/// Resolves where the stage's base filesystem comes from: the empty image,
/// a saved earlier stage, a warmed tarball, or a registry pull.
async fn retrieve_base_image(
    stage: &Stage,
    opts: &BuildOptions,
    registry: &RegistryClient,
) -> Result<(Image, String)> {
    match &stage.base {
        BaseImage::Scratch => {
            debug!("stage starts from scratch");
            let image = Image::empty();
            let digest = image.digest()?;
            Ok((image, digest))
        }
        BaseImage::Stage(index) => {
            let path = opts.intermediate_stage_path(*index);
            info!(stage = index, path = %path.display(), "using saved stage as base");
            let image = tarball::read_from_file(&path)?;
            let digest = image.digest()?;
            Ok((image, digest))
        }
        BaseImage::Registry(reference) => {
            if let Some(image) = cache::local_base_image(opts, reference)? {
                let digest = image.digest()?;
                return Ok((image, digest));
            }
            let pulled = registry.pull(reference).await?;
            Ok((pulled.image, pulled.digest))
        }
    }
}
