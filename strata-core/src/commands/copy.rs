//! COPY: move files from the build context (or an earlier stage) into the
//! root filesystem, preserving mode and ownership.

use crate::commands::{CommandContext, DockerCommand};
use crate::dockerfile::{args::expand, args::BuildArgs, Instruction};
use crate::error::{Result, StrataError};
use crate::image::ConfigFile;
use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct CopyCommand {
    instruction: Instruction,
    ctx: CommandContext,
    snapshot_files: Vec<PathBuf>,
}

impl CopyCommand {
    pub fn new(instruction: Instruction, ctx: &CommandContext) -> Self {
        Self { instruction, ctx: ctx.clone(), snapshot_files: Vec::new() }
    }
}

#[async_trait]
impl DockerCommand for CopyCommand {
    async fn execute(
        &mut self,
        config: &mut ConfigFile,
        build_args: &mut BuildArgs,
    ) -> Result<()> {
        let Instruction::Copy { sources, dest, from, chown } = self.instruction.clone() else {
            unreachable!("CopyCommand holds a COPY instruction");
        };

        let env = config.config.env.clone();
        let sources: Vec<String> =
            sources.iter().map(|s| expand(s, &env, build_args)).collect();
        let dest = expand(&dest, &env, build_args);

        // --from=<index> roots sources in the saved stage's filesystem.
        let source_base = match &from {
            Some(index) => {
                let index: usize = index.parse().map_err(|_| StrataError::InstructionExec {
                    instruction: self.created_by(),
                    reason: format!("--from={index} is not a resolved stage index"),
                })?;
                self.ctx.work_dir.join(index.to_string())
            }
            None => self.ctx.context.clone(),
        };

        info!(sources = ?sources, dest, "copying files");
        let mut copier = Copier::new(resolve_chown(chown.as_deref(), &self.created_by())?);
        let dest_path = self.ctx.dest_path(&dest, &config.config.working_dir);
        let treat_dest_as_dir = dest.ends_with('/') || sources.len() > 1;

        for source in &sources {
            let src = source_base.join(source.trim_start_matches('/'));
            copier.copy_source(&src, &dest_path, treat_dest_as_dir)?;
        }

        self.snapshot_files = copier.files;
        Ok(())
    }

    /// COPY knows exactly what it wrote.
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

/// Parses `--chown=uid[:gid]`. Name resolution against the image's passwd
/// database is not supported; ids must be numeric.
pub(crate) fn resolve_chown(
    chown: Option<&str>,
    instruction: &str,
) -> Result<Option<(u32, u32)>> {
    let Some(chown) = chown else {
        return Ok(None);
    };
    let err = || StrataError::InstructionExec {
        instruction: instruction.to_string(),
        reason: format!("--chown={chown} must use numeric uid[:gid]"),
    };
    let (uid, gid) = match chown.split_once(':') {
        Some((u, g)) => (u.parse().map_err(|_| err())?, g.parse().map_err(|_| err())?),
        None => {
            let uid = chown.parse().map_err(|_| err())?;
            (uid, uid)
        }
    };
    Ok(Some((uid, gid)))
}

/// Copies sources into the root filesystem and records every path it creates,
/// parent directories included, so targeted snapshots capture the whole
/// effect.
pub(crate) struct Copier {
    chown: Option<(u32, u32)>,
    pub(crate) files: Vec<PathBuf>,
}

impl Copier {
    pub(crate) fn new(chown: Option<(u32, u32)>) -> Self {
        Self { chown, files: Vec::new() }
    }

    pub(crate) fn copy_source(
        &mut self,
        src: &Path,
        dest_path: &Path,
        treat_dest_as_dir: bool,
    ) -> Result<()> {
        let meta = fs::symlink_metadata(src)
            .map_err(|_| StrataError::SourceNotFound { path: src.to_path_buf() })?;

        if meta.is_dir() {
            // A directory's contents are copied, not the directory itself.
            self.ensure_dir(dest_path, Some(&meta))?;
            self.copy_dir_contents(src, dest_path)
        } else {
            let target = if treat_dest_as_dir || dest_path.is_dir() {
                let name = src.file_name().ok_or_else(|| StrataError::SourceNotFound {
                    path: src.to_path_buf(),
                })?;
                dest_path.join(name)
            } else {
                dest_path.to_path_buf()
            };
            if let Some(parent) = target.parent() {
                self.ensure_dir(parent, None)?;
            }
            self.copy_entry(src, &meta, &target)
        }
    }

    fn copy_dir_contents(&mut self, src_dir: &Path, dst_dir: &Path) -> Result<()> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(src_dir).map_err(|e| StrataError::io(src_dir, e))? {
            entries.push(entry.map_err(|e| StrataError::io(src_dir, e))?.path());
        }
        entries.sort();

        for src in entries {
            let meta = fs::symlink_metadata(&src).map_err(|e| StrataError::io(&src, e))?;
            let target = dst_dir.join(src.file_name().unwrap_or_default());
            if meta.is_dir() {
                self.ensure_dir(&target, Some(&meta))?;
                self.copy_dir_contents(&src, &target)?;
            } else {
                self.copy_entry(&src, &meta, &target)?;
            }
        }
        Ok(())
    }

    fn copy_entry(&mut self, src: &Path, meta: &fs::Metadata, target: &Path) -> Result<()> {
        debug!(src = %src.display(), target = %target.display(), "copying");
        if meta.file_type().is_symlink() {
            let link = fs::read_link(src).map_err(|e| StrataError::io(src, e))?;
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).map_err(|e| StrataError::io(target, e))?;
            }
            std::os::unix::fs::symlink(&link, target)
                .map_err(|e| StrataError::io(target, e))?;
        } else {
            fs::copy(src, target).map_err(|e| StrataError::io(target, e))?;
            let mode = meta.permissions().mode();
            fs::set_permissions(target, fs::Permissions::from_mode(mode))
                .map_err(|e| StrataError::io(target, e))?;
        }
        self.apply_ownership(target, Some(meta));
        self.files.push(target.to_path_buf());
        Ok(())
    }

    /// Creates `dir` and any missing ancestors, recording the ones created.
    /// A freshly created directory takes the source directory's mode and
    /// ownership when given.
    fn ensure_dir(&mut self, dir: &Path, src_meta: Option<&fs::Metadata>) -> Result<()> {
        let recorded = self.files.len();
        self.record_dir_if_new(dir)?;
        if self.files.len() == recorded {
            return Ok(());
        }
        if let Some(meta) = src_meta {
            let mode = meta.permissions().mode();
            fs::set_permissions(dir, fs::Permissions::from_mode(mode))
                .map_err(|e| StrataError::io(dir, e))?;
        }
        self.apply_ownership(dir, src_meta);
        Ok(())
    }

    /// Creates `dir` plus missing ancestors with default modes, recording the
    /// created ones, parents before children.
    pub(crate) fn record_dir_if_new(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cursor = dir;
        while !cursor.exists() {
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|e| StrataError::io(dir, e))?;
        missing.reverse();
        for created in &missing {
            self.apply_ownership(created, None);
        }
        self.files.extend(missing);
        Ok(())
    }

    /// `--chown` wins; otherwise source ownership is carried over. Entries
    /// with no source metadata (downloads, archive extraction) only change
    /// owner under an explicit `--chown`. Builds running unprivileged cannot
    /// chown, which is fine: everything is owned by the build user then.
    pub(crate) fn apply_ownership(&self, target: &Path, src_meta: Option<&fs::Metadata>) {
        let (uid, gid) = match (self.chown, src_meta) {
            (Some((uid, gid)), _) => (uid, gid),
            (None, Some(meta)) => (meta.uid(), meta.gid()),
            (None, None) => return,
        };
        let result = if fs::symlink_metadata(target).map(|m| m.is_symlink()).unwrap_or(false) {
            std::os::unix::fs::lchown(target, Some(uid), Some(gid))
        } else {
            std::os::unix::fs::chown(target, Some(uid), Some(gid))
        };
        if let Err(e) = result {
            debug!(target = %target.display(), "chown skipped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        _context: TempDir,
        ctx: CommandContext,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let context = TempDir::new().unwrap();
        let ctx = CommandContext {
            root: root.path().to_path_buf(),
            context: context.path().to_path_buf(),
            work_dir: root.path().join("work"),
        };
        Fixture { _root: root, _context: context, ctx }
    }

    async fn run_copy(f: &Fixture, instruction: Instruction) -> (CopyCommand, ConfigFile) {
        let mut config = ConfigFile::default();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd = CopyCommand::new(instruction, &f.ctx);
        cmd.execute(&mut config, &mut args).await.unwrap();
        (cmd, config)
    }

    #[tokio::test]
    async fn test_copy_single_file() {
        let f = fixture();
        fs::write(f.ctx.context.join("foo"), "abc").unwrap();

        let (cmd, _) = run_copy(
            &f,
            Instruction::Copy {
                sources: vec!["foo".into()],
                dest: "/foo".into(),
                from: None,
                chown: None,
            },
        )
        .await;

        let target = f.ctx.root.join("foo");
        assert_eq!(fs::read_to_string(&target).unwrap(), "abc");
        assert_eq!(cmd.files_to_snapshot(), Some(vec![target]));
    }

    #[tokio::test]
    async fn test_copy_preserves_mode() {
        let f = fixture();
        let src = f.ctx.context.join("tool");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        run_copy(
            &f,
            Instruction::Copy {
                sources: vec!["tool".into()],
                dest: "/bin/tool".into(),
                from: None,
                chown: None,
            },
        )
        .await;

        let mode = fs::metadata(f.ctx.root.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_copy_dir_copies_contents() {
        let f = fixture();
        fs::create_dir_all(f.ctx.context.join("src/nested")).unwrap();
        fs::write(f.ctx.context.join("src/a"), "a").unwrap();
        fs::write(f.ctx.context.join("src/nested/b"), "b").unwrap();

        let (cmd, _) = run_copy(
            &f,
            Instruction::Copy {
                sources: vec!["src".into()],
                dest: "/app".into(),
                from: None,
                chown: None,
            },
        )
        .await;

        assert_eq!(fs::read_to_string(f.ctx.root.join("app/a")).unwrap(), "a");
        assert_eq!(fs::read_to_string(f.ctx.root.join("app/nested/b")).unwrap(), "b");
        // The directory itself was created and recorded, not copied as "src".
        assert!(!f.ctx.root.join("app/src").exists());
        let files = cmd.files_to_snapshot().unwrap();
        assert!(files.contains(&f.ctx.root.join("app")));
        assert!(files.contains(&f.ctx.root.join("app/nested/b")));
    }

    #[tokio::test]
    async fn test_copy_into_workdir_relative_dest() {
        let f = fixture();
        fs::write(f.ctx.context.join("foo"), "x").unwrap();

        let mut config = ConfigFile::default();
        config.config.working_dir = "/app".to_string();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd = CopyCommand::new(
            Instruction::Copy {
                sources: vec!["foo".into()],
                dest: "conf/".into(),
                from: None,
                chown: None,
            },
            &f.ctx,
        );
        cmd.execute(&mut config, &mut args).await.unwrap();

        assert!(f.ctx.root.join("app/conf/foo").exists());
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let f = fixture();
        let mut config = ConfigFile::default();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd = CopyCommand::new(
            Instruction::Copy {
                sources: vec!["ghost".into()],
                dest: "/x".into(),
                from: None,
                chown: None,
            },
            &f.ctx,
        );
        assert!(matches!(
            cmd.execute(&mut config, &mut args).await,
            Err(StrataError::SourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_from_stage_dependency_dir() {
        let f = fixture();
        let stage_dir = f.ctx.work_dir.join("0");
        fs::create_dir_all(&stage_dir).unwrap();
        fs::write(stage_dir.join("x"), "built").unwrap();

        run_copy(
            &f,
            Instruction::Copy {
                sources: vec!["/x".into()],
                dest: "/x".into(),
                from: Some("0".into()),
                chown: None,
            },
        )
        .await;

        assert_eq!(fs::read_to_string(f.ctx.root.join("x")).unwrap(), "built");
    }

    #[tokio::test]
    async fn test_copy_symlink_preserved() {
        let f = fixture();
        std::os::unix::fs::symlink("target", f.ctx.context.join("link")).unwrap();

        run_copy(
            &f,
            Instruction::Copy {
                sources: vec!["link".into()],
                dest: "/link".into(),
                from: None,
                chown: None,
            },
        )
        .await;

        let copied = f.ctx.root.join("link");
        assert!(fs::symlink_metadata(&copied).unwrap().is_symlink());
        assert_eq!(fs::read_link(&copied).unwrap(), PathBuf::from("target"));
    }

    #[test]
    fn test_resolve_chown_forms() {
        assert_eq!(resolve_chown(None, "COPY").unwrap(), None);
        assert_eq!(resolve_chown(Some("1000"), "COPY").unwrap(), Some((1000, 1000)));
        assert_eq!(resolve_chown(Some("1000:5"), "COPY").unwrap(), Some((1000, 5)));
        assert!(resolve_chown(Some("appuser"), "COPY").is_err());
    }
}
