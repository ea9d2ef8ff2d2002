//! RUN: fork/exec a command against the root filesystem.
//!
//! No re-entrant isolation is attempted; the container the builder runs in is
//! the sandbox. The child gets the image config's environment (plus declared
//! build args), user, and working directory.

use crate::commands::{CommandContext, DockerCommand};
use crate::dockerfile::{args::BuildArgs, Command, Instruction};
use crate::error::{Result, StrataError};
use crate::image::ConfigFile;
use async_trait::async_trait;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct RunCommand {
    instruction: Instruction,
    root: PathBuf,
}

impl RunCommand {
    pub fn new(instruction: Instruction, ctx: &CommandContext) -> Self {
        Self { instruction, root: ctx.root.clone() }
    }

    fn argv(&self, config: &ConfigFile) -> Vec<String> {
        let Instruction::Run { command } = &self.instruction else {
            unreachable!("RunCommand holds a RUN instruction");
        };
        match command {
            Command::Exec(argv) => argv.clone(),
            Command::Shell(cmd) => {
                let mut argv = config
                    .config
                    .shell
                    .clone()
                    .unwrap_or_else(|| vec!["/bin/sh".to_string(), "-c".to_string()]);
                argv.push(cmd.clone());
                argv
            }
        }
    }
}

#[async_trait]
impl DockerCommand for RunCommand {
    async fn execute(
        &mut self,
        config: &mut ConfigFile,
        build_args: &mut BuildArgs,
    ) -> Result<()> {
        let argv = self.argv(config);
        if argv.is_empty() {
            return Err(StrataError::InstructionExec {
                instruction: self.created_by(),
                reason: "empty command".to_string(),
            });
        }
        info!(command = %argv.join(" "), "running command");

        // The working directory must exist before exec; WORKDIR itself is
        // config-only.
        let cwd = if config.config.working_dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(config.config.working_dir.trim_start_matches('/'))
        };
        fs::create_dir_all(&cwd).map_err(|e| StrataError::io(&cwd, e))?;

        let mut env: Vec<(String, String)> = Vec::new();
        for entry in config.config.env.iter().chain(build_args.replacement_env().iter()) {
            if let Some((k, v)) = entry.split_once('=') {
                env.push((k.to_string(), v.to_string()));
            }
        }

        let mut command = std::process::Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(&cwd).env_clear().envs(env);

        if !config.config.user.is_empty() {
            let (uid, gid) = resolve_user(&config.config.user, &self.root)
                .ok_or_else(|| StrataError::InstructionExec {
                    instruction: self.created_by(),
                    reason: format!("cannot resolve user {}", config.config.user),
                })?;
            command.uid(uid).gid(gid);
        }

        let status = command.status().map_err(|e| StrataError::InstructionExec {
            instruction: self.created_by(),
            reason: format!("spawning {}: {e}", argv[0]),
        })?;

        if !status.success() {
            return Err(StrataError::RunExit {
                command: argv.join(" "),
                code: status.code().unwrap_or(-1),
            });
        }
        debug!("command completed");
        Ok(())
    }

    /// RUN can touch anything: force a full filesystem pass.
    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        None
    }

    fn created_by(&self) -> String {
        self.instruction.to_string()
    }

    fn cacheable(&self) -> bool {
        true
    }
}

/// Resolves `user[:group]` to numeric ids: numeric forms directly, names via
/// the root filesystem's passwd and group files.
fn resolve_user(user: &str, root: &Path) -> Option<(u32, u32)> {
    let (user, group) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let (uid, primary_gid) = if let Ok(uid) = user.parse::<u32>() {
        (uid, uid)
    } else {
        lookup_passwd(user, root)?
    };

    let gid = match group {
        None => primary_gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_group(g, root)?,
        },
    };
    Some((uid, gid))
}

/// `name:pw:uid:gid:...` lines.
fn lookup_passwd(name: &str, root: &Path) -> Option<(u32, u32)> {
    let contents = fs::read_to_string(root.join("etc/passwd")).ok()?;
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(name) {
            let uid = fields.nth(1)?.parse().ok()?;
            let gid = fields.next()?.parse().ok()?;
            return Some((uid, gid));
        }
    }
    None
}

/// `name:pw:gid:...` lines.
fn lookup_group(name: &str, root: &Path) -> Option<u32> {
    let contents = fs::read_to_string(root.join("etc/group")).ok()?;
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(name) {
            return fields.nth(1)?.parse().ok();
        }
    }
    None
}
