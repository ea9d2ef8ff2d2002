use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use strata_core::{do_build, do_push, BuildOptions, RegistryClient, SnapshotMode, StrataError};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Build and push OCI images from a Dockerfile, without a daemon or
/// privileges.
#[derive(Parser)]
#[command(name = "strata", version)]
struct Cli {
    /// Path to the Dockerfile to build
    #[arg(short = 'f', long, default_value = "Dockerfile")]
    dockerfile: PathBuf,

    /// Path to the build context directory
    #[arg(short, long, default_value = "/workspace")]
    context: PathBuf,

    /// Registry reference to push the image to (repeatable)
    #[arg(short, long)]
    destination: Vec<String>,

    /// Use the remote layer cache
    #[arg(long)]
    cache: bool,

    /// Repository for cached layers (default: <destination>/cache)
    #[arg(long)]
    cache_repo: Option<String>,

    /// Directory of pre-warmed base-image tarballs
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Build without pushing anywhere
    #[arg(long)]
    no_push: bool,

    /// Write the image to this tarball instead of pushing
    #[arg(long)]
    tar_path: Option<PathBuf>,

    /// Take a single snapshot of the final stage after the last instruction
    #[arg(long)]
    single_snapshot: bool,

    /// Strip timestamps so identical inputs produce identical images
    #[arg(long)]
    reproducible: bool,

    /// Build up to this stage instead of the last one
    #[arg(long)]
    target: Option<String>,

    /// Build argument (KEY=VALUE, repeatable)
    #[arg(long = "build-arg")]
    build_args: Vec<String>,

    /// File fingerprinting mode
    #[arg(long, default_value = "full", value_parser = ["full", "time"])]
    snapshot_mode: String,

    /// Talk to registries over plain HTTP
    #[arg(long)]
    insecure: bool,

    /// Accept invalid registry TLS certificates
    #[arg(long)]
    skip_tls_verify: bool,

    /// Log level (debug, info, warn, error, fatal, panic)
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

impl Cli {
    fn into_options(self) -> Result<BuildOptions> {
        if self.destination.is_empty() && !self.no_push && self.tar_path.is_none() {
            bail!("at least one --destination is required unless --no-push or --tar-path is set");
        }
        let snapshot_mode = SnapshotMode::parse(&self.snapshot_mode)
            .expect("clap restricts the value");
        Ok(BuildOptions {
            dockerfile: self.dockerfile,
            context: self.context,
            destinations: self.destination,
            build_args: self.build_args,
            target: self.target,
            snapshot_mode,
            single_snapshot: self.single_snapshot,
            reproducible: self.reproducible,
            use_cache: self.cache,
            cache_repo: self.cache_repo,
            cache_dir: self.cache_dir,
            no_push: self.no_push,
            tar_path: self.tar_path,
            insecure: self.insecure,
            skip_tls_verify: self.skip_tls_verify,
            ..Default::default()
        })
    }
}

fn init_logging(verbosity: &str) -> Result<()> {
    // The fatal/panic levels map onto error, matching their severity intent.
    let level = match verbosity {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" | "fatal" | "panic" => "error",
        other => bail!("invalid verbosity level: {other}"),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.verbosity) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let opts = match cli.into_options() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&opts).await {
        error!("{e}");
        // A failing RUN passes its exit code through.
        let code = match e.downcast_ref::<StrataError>() {
            Some(StrataError::RunExit { code, .. }) if *code > 0 => *code,
            _ => 1,
        };
        std::process::exit(code);
    }
}

async fn run(opts: &BuildOptions) -> Result<()> {
    let image = do_build(opts).await?;
    let registry = RegistryClient::new(opts);
    do_push(&image, opts, &registry).await?;
    Ok(())
}
