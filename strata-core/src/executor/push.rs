//! Delivering the final image: registry push, tarball, or nothing.

use crate::config::BuildOptions;
use crate::error::Result;
use crate::image::{tarball, Image};
use crate::registry::RegistryClient;
use std::path::Path;
use tracing::info;

/// Pushes `image` to every destination in `opts`, honoring `--tar-path` and
/// `--no-push`.
pub async fn do_push(
    image: &Image,
    opts: &BuildOptions,
    registry: &RegistryClient,
) -> Result<()> {
    if let Some(tar_path) = &opts.tar_path {
        return write_tarball(image, tar_path, opts);
    }
    if opts.no_push {
        info!("skipping push to container registry due to --no-push flag");
        return Ok(());
    }
    for destination in &opts.destinations {
        registry.push(destination, image).await?;
    }
    Ok(())
}

fn write_tarball(image: &Image, tar_path: &Path, opts: &BuildOptions) -> Result<()> {
    let reference = opts.destinations.first().map(String::as_str);
    info!(path = %tar_path.display(), "writing image tarball");
    tarball::write_to_file(tar_path, reference, image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::RunConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tar_path_writes_instead_of_pushing() {
        let dir = TempDir::new().unwrap();
        let tar_path = dir.path().join("out.tar");
        let opts = BuildOptions {
            destinations: vec!["example.com/app:1".to_string()],
            tar_path: Some(tar_path.clone()),
            ..Default::default()
        };
        let registry = RegistryClient::new(&opts);

        let mut image = Image::empty();
        image.set_config(RunConfig::default());
        do_push(&image, &opts, &registry).await.unwrap();

        let loaded = tarball::read_from_file(&tar_path).unwrap();
        assert_eq!(loaded.config_file, image.config_file);
    }

    #[tokio::test]
    async fn test_no_push_is_a_no_op() {
        let opts = BuildOptions {
            destinations: vec!["example.com/app:1".to_string()],
            no_push: true,
            ..Default::default()
        };
        let registry = RegistryClient::new(&opts);
        let mut image = Image::empty();
        image.set_config(RunConfig::default());
        // No registry is reachable in tests; success proves nothing was sent.
        do_push(&image, &opts, &registry).await.unwrap();
    }
}
