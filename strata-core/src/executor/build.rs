//! Top-level build driver.
//!
//! Iterates stages in Dockerfile order, persists intermediate stages that
//! later stages reference, and returns the final stage's image.

use crate::config::BuildOptions;
use crate::dockerfile::{self, parser};
use crate::error::{Result, StrataError};
use crate::executor::stage::StageBuilder;
use crate::fs::{unpack_image, wipe_root};
use crate::image::{tarball, Image};
use crate::registry::RegistryClient;
use crate::snapshot::PathWhitelist;
use std::fs;
use tracing::info;

/// Builds the Dockerfile in `opts` and returns the final image.
pub async fn do_build(opts: &BuildOptions) -> Result<Image> {
    let dockerfile_path = opts.dockerfile_path();
    let content =
        fs::read_to_string(&dockerfile_path).map_err(|e| StrataError::InvalidDockerfile {
            path: dockerfile_path.clone(),
            reason: e.to_string(),
        })?;
    let dockerfile = parser::parse(&content)?;
    let stages =
        dockerfile::resolve_stages(&dockerfile, opts.target.as_deref(), &opts.build_args)?;
    info!(stages = stages.len(), dockerfile = %dockerfile_path.display(), "parsed Dockerfile");

    fs::create_dir_all(&opts.root_dir).map_err(|e| StrataError::io(&opts.root_dir, e))?;
    fs::create_dir_all(&opts.work_dir).map_err(|e| StrataError::io(&opts.work_dir, e))?;

    let registry = RegistryClient::new(opts);
    // One whitelist for the whole build: VOLUME declarations accumulate and
    // keep shielding descendant stages.
    let mut whitelist = PathWhitelist::for_root(&opts.root_dir, &opts.work_dir);

    for stage in &stages {
        info!(stage = stage.index, final_stage = stage.final_stage, "building stage");
        let mut builder =
            StageBuilder::new(stage.clone(), opts, &registry, &dockerfile.global_args).await?;
        builder.build(&mut whitelist).await?;
        let image = builder.finish();

        if stage.final_stage {
            let image = if opts.reproducible {
                info!("canonicalizing image for reproducible build");
                let mut image = image;
                image.canonicalize()?;
                image
            } else {
                image
            };
            return Ok(image);
        }

        if stage.save_stage {
            save_stage(stage.index, &image, opts)?;
        }

        // The next stage starts from its own base.
        wipe_root(&opts.root_dir, &whitelist)?;
    }

    unreachable!("resolve_stages guarantees a final stage")
}

/// Persists a non-final stage both as a tarball (for `FROM <stage>`) and as an
/// extracted tree (for `COPY --from=<stage>`).
fn save_stage(index: usize, image: &Image, opts: &BuildOptions) -> Result<()> {
    let tar_path = opts.intermediate_stage_path(index);
    info!(stage = index, path = %tar_path.display(), "storing intermediate stage");
    tarball::write_to_file(&tar_path, None, image)?;

    let dependency_dir = opts.dependency_dir(index);
    fs::create_dir_all(&dependency_dir).map_err(|e| StrataError::io(&dependency_dir, e))?;
    // The dependency tree lives inside the work dir; nothing there is
    // whitelisted from its own extraction.
    unpack_image(image, &dependency_dir, &PathWhitelist::empty())
}
