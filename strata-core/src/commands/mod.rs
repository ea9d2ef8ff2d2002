//! Per-instruction command executors.
//!
//! Each Dockerfile instruction maps to one executor with four capabilities:
//! apply the instruction, declare which paths it touched (if known), produce
//! the history string, and say whether its output may be cached.

pub mod add;
pub mod copy;
pub mod metadata;
pub mod run;

use crate::dockerfile::{args::BuildArgs, Instruction};
use crate::error::Result;
use crate::image::ConfigFile;
use async_trait::async_trait;
use std::path::PathBuf;

/// Paths an executor needs to resolve sources and destinations.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Root filesystem the build mutates.
    pub root: PathBuf,
    /// Build context directory `COPY`/`ADD` sources come from.
    pub context: PathBuf,
    /// Engine work directory; `<work_dir>/<index>` holds the extracted
    /// filesystem of stage `index` for `COPY --from`.
    pub work_dir: PathBuf,
}

impl CommandContext {
    /// Resolves a destination path against the working directory and root.
    pub fn dest_path(&self, dest: &str, working_dir: &str) -> PathBuf {
        let absolute = if dest.starts_with('/') {
            PathBuf::from(dest)
        } else if working_dir.is_empty() {
            PathBuf::from("/").join(dest)
        } else {
            PathBuf::from(working_dir).join(dest)
        };
        self.root.join(absolute.strip_prefix("/").unwrap_or(&absolute))
    }
}

#[async_trait]
pub trait DockerCommand: Send {
    /// Applies the instruction: mutates `config` and/or writes under the
    /// root filesystem.
    async fn execute(&mut self, config: &mut ConfigFile, build_args: &mut BuildArgs)
        -> Result<()>;

    /// Paths this instruction is known to have touched. `None` means unknown:
    /// the snapshotter must walk the full filesystem. `Some(vec![])` means
    /// the instruction never touches the filesystem.
    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(Vec::new())
    }

    /// The history string recorded for this instruction.
    fn created_by(&self) -> String;

    /// Whether this instruction's layer may be served from the layer cache.
    /// Config-only instructions are free to re-run and are never cached.
    fn cacheable(&self) -> bool {
        false
    }

    /// `VOLUME` paths declared by this instruction, to join the whitelist
    /// after the next snapshot.
    fn pending_volumes(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Builds the executor for an instruction.
pub fn get_command(instruction: &Instruction, ctx: &CommandContext) -> Box<dyn DockerCommand> {
    match instruction {
        Instruction::Run { .. } => Box::new(run::RunCommand::new(instruction.clone(), ctx)),
        Instruction::Copy { .. } => Box::new(copy::CopyCommand::new(instruction.clone(), ctx)),
        Instruction::Add { .. } => Box::new(add::AddCommand::new(instruction.clone(), ctx)),
        _ => Box::new(metadata::MetadataCommand::new(instruction.clone(), ctx)),
    }
}
