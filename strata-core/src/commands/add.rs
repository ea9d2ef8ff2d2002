//! ADD: COPY plus remote URLs and local tar auto-extraction.

use crate::commands::copy::{resolve_chown, Copier};
use crate::commands::{CommandContext, DockerCommand};
use crate::dockerfile::{args::expand, args::BuildArgs, Instruction};
use crate::error::{Result, StrataError};
use crate::image::ConfigFile;
use async_trait::async_trait;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct AddCommand {
    instruction: Instruction,
    ctx: CommandContext,
    snapshot_files: Vec<PathBuf>,
}

impl AddCommand {
    pub fn new(instruction: Instruction, ctx: &CommandContext) -> Self {
        Self { instruction, ctx: ctx.clone(), snapshot_files: Vec::new() }
    }
}

#[async_trait]
impl DockerCommand for AddCommand {
    async fn execute(
        &mut self,
        config: &mut ConfigFile,
        build_args: &mut BuildArgs,
    ) -> Result<()> {
        let Instruction::Add { sources, dest, chown } = self.instruction.clone() else {
            unreachable!("AddCommand holds an ADD instruction");
        };

        let env = config.config.env.clone();
        let sources: Vec<String> =
            sources.iter().map(|s| expand(s, &env, build_args)).collect();
        let dest = expand(&dest, &env, build_args);

        info!(sources = ?sources, dest, "adding files");
        let mut copier = Copier::new(resolve_chown(chown.as_deref(), &self.created_by())?);
        let dest_path = self.ctx.dest_path(&dest, &config.config.working_dir);
        let treat_dest_as_dir = dest.ends_with('/') || sources.len() > 1;

        for source in &sources {
            if is_url(source) {
                self.download(source, &dest_path, treat_dest_as_dir, &mut copier).await?;
            } else {
                let src = self.ctx.context.join(source.trim_start_matches('/'));
                if is_local_archive(&src) {
                    self.extract_archive(&src, &dest_path, &mut copier)?;
                } else {
                    copier.copy_source(&src, &dest_path, treat_dest_as_dir)?;
                }
            }
        }

        self.snapshot_files = copier.files;
        Ok(())
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(self.snapshot_files.clone())
    }

    fn created_by(&self) -> String {
        self.instruction.to_string()
    }

    fn cacheable(&self) -> bool {
        true
    }
}

impl AddCommand {
    async fn download(
        &self,
        url: &str,
        dest_path: &Path,
        treat_dest_as_dir: bool,
        copier: &mut Copier,
    ) -> Result<()> {
        info!(url, "downloading");
        let exec_err = |reason: String| StrataError::InstructionExec {
            instruction: self.created_by(),
            reason,
        };

        let response = reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| exec_err(format!("fetching {url}: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| exec_err(format!("reading {url}: {e}")))?;

        let target = if treat_dest_as_dir || dest_path.is_dir() {
            let name = url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| exec_err(format!("cannot derive a file name from {url}")))?;
            dest_path.join(name)
        } else {
            dest_path.to_path_buf()
        };

        copier.write_new_file(&target, &body, 0o600)?;
        Ok(())
    }

    /// Unpacks a local tar archive into the destination directory, recording
    /// every extracted path.
    fn extract_archive(
        &self,
        src: &Path,
        dest_dir: &Path,
        copier: &mut Copier,
    ) -> Result<()> {
        info!(src = %src.display(), dest = %dest_dir.display(), "extracting archive");
        let exec_err = |reason: String| StrataError::InstructionExec {
            instruction: self.created_by(),
            reason,
        };

        let bytes = fs::read(src)
            .map_err(|_| StrataError::SourceNotFound { path: src.to_path_buf() })?;
        let tar_bytes = if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| exec_err(format!("decompressing {}: {e}", src.display())))?;
            out
        } else {
            bytes
        };

        copier.record_dir_if_new(dest_dir)?;
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        archive.set_overwrite(true);
        archive.set_preserve_permissions(true);
        let entries = archive
            .entries()
            .map_err(|e| exec_err(format!("reading {}: {e}", src.display())))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| exec_err(format!("tar entry: {e}")))?;
            let rel = entry
                .path()
                .map_err(|e| exec_err(format!("tar entry path: {e}")))?
                .into_owned();
            entry
                .unpack_in(dest_dir)
                .map_err(|e| exec_err(format!("unpacking {}: {e}", rel.display())))?;
            let target = dest_dir.join(&rel);
            debug!(path = %target.display(), "extracted");
            copier.apply_ownership(&target, None);
            copier.files.push(target);
        }
        Ok(())
    }
}

impl Copier {
    /// Writes bytes to a fresh file with the given mode, recording it and any
    /// created parents. An explicit `--chown` applies here too.
    pub(crate) fn write_new_file(
        &mut self,
        target: &Path,
        contents: &[u8],
        mode: u32,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            self.record_dir_if_new(parent)?;
        }
        fs::write(target, contents).map_err(|e| StrataError::io(target, e))?;
        fs::set_permissions(target, fs::Permissions::from_mode(mode))
            .map_err(|e| StrataError::io(target, e))?;
        self.apply_ownership(target, None);
        self.files.push(target.to_path_buf());
        Ok(())
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_local_archive(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}
