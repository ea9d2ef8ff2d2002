//! Config-only instructions: ENV, ARG, LABEL, WORKDIR, USER, EXPOSE, VOLUME,
//! CMD, ENTRYPOINT, ONBUILD, STOPSIGNAL, HEALTHCHECK, SHELL, MAINTAINER.
//!
//! None of these touch the filesystem, so they snapshot nothing and are never
//! cached.

use crate::commands::{CommandContext, DockerCommand};
use crate::dockerfile::args::{expand, BuildArgs};
use crate::dockerfile::{Command, Instruction};
use crate::error::{Result, StrataError};
use crate::image::config::{Empty, HealthConfig};
use crate::image::ConfigFile;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

pub struct MetadataCommand {
    instruction: Instruction,
    root: PathBuf,
    volumes: Vec<PathBuf>,
}

impl MetadataCommand {
    pub fn new(instruction: Instruction, ctx: &CommandContext) -> Self {
        Self { instruction, root: ctx.root.clone(), volumes: Vec::new() }
    }
}

#[async_trait]
impl DockerCommand for MetadataCommand {
    async fn execute(
        &mut self,
        config: &mut ConfigFile,
        build_args: &mut BuildArgs,
    ) -> Result<()> {
        debug!(instruction = %self.instruction, "applying config instruction");
        let env = config.config.env.clone();
        let sub = |value: &str, args: &BuildArgs| expand(value, &env, args);

        match &self.instruction {
            Instruction::Env { pairs } => {
                for (key, value) in pairs {
                    config.config.set_env(key, &sub(value, build_args));
                }
            }
            Instruction::Arg { name, default } => {
                let default = default.as_ref().map(|d| sub(d, build_args));
                build_args.declare(name, default);
            }
            Instruction::Label { pairs } => {
                for (key, value) in pairs {
                    config.config.labels.insert(key.clone(), sub(value, build_args));
                }
            }
            Instruction::Workdir { path } => {
                let path = sub(path, build_args);
                config.config.working_dir = if path.starts_with('/') {
                    path
                } else if config.config.working_dir.is_empty() {
                    format!("/{path}")
                } else {
                    format!("{}/{path}", config.config.working_dir.trim_end_matches('/'))
                };
            }
            Instruction::User { user } => {
                config.config.user = sub(user, build_args);
            }
            Instruction::Expose { ports } => {
                for port in ports {
                    let port = sub(port, build_args);
                    let (number, proto) = port
                        .split_once('/')
                        .unwrap_or((port.as_str(), "tcp"));
                    if number.parse::<u16>().is_err() || !matches!(proto, "tcp" | "udp") {
                        return Err(StrataError::InstructionExec {
                            instruction: self.created_by(),
                            reason: format!("invalid port specification: {port}"),
                        });
                    }
                    config.config.exposed_ports.insert(format!("{number}/{proto}"), Empty {});
                }
            }
            Instruction::Volume { paths } => {
                for path in paths {
                    let path = sub(path, build_args);
                    config.config.volumes.insert(path.clone(), Empty {});
                    let under_root =
                        self.root.join(path.trim_start_matches('/'));
                    self.volumes.push(under_root);
                }
            }
            Instruction::Cmd { command } => {
                config.config.cmd = Some(command_argv(command, &config.config.shell));
            }
            Instruction::Entrypoint { command } => {
                config.config.entrypoint = Some(command_argv(command, &config.config.shell));
            }
            Instruction::OnBuild { trigger } => {
                config.config.on_build.push(trigger.clone());
            }
            Instruction::Stopsignal { signal } => {
                config.config.stop_signal = sub(signal, build_args);
            }
            Instruction::Healthcheck { check } => {
                if check.test == ["NONE"] {
                    config.config.healthcheck = Some(HealthConfig {
                        test: vec!["NONE".to_string()],
                        ..Default::default()
                    });
                } else {
                    config.config.healthcheck = Some(HealthConfig {
                        test: check.test.clone(),
                        interval: parse_duration_ns(&check.interval, &self.instruction)?,
                        timeout: parse_duration_ns(&check.timeout, &self.instruction)?,
                        start_period: parse_duration_ns(&check.start_period, &self.instruction)?,
                        retries: check.retries,
                    });
                }
            }
            Instruction::Shell { shell } => {
                config.config.shell = Some(shell.clone());
            }
            Instruction::Maintainer { name } => {
                config.author = name.clone();
            }
            other => unreachable!("not a config-only instruction: {other}"),
        }
        Ok(())
    }

    fn created_by(&self) -> String {
        self.instruction.to_string()
    }

    fn pending_volumes(&self) -> Vec<PathBuf> {
        self.volumes.clone()
    }
}

/// CMD/ENTRYPOINT argv: exec form as-is, shell form wrapped in the config's
/// shell (default `/bin/sh -c`).
fn command_argv(command: &Command, shell: &Option<Vec<String>>) -> Vec<String> {
    match command {
        Command::Exec(argv) => argv.clone(),
        Command::Shell(cmd) => {
            let mut argv = shell
                .clone()
                .unwrap_or_else(|| vec!["/bin/sh".to_string(), "-c".to_string()]);
            argv.push(cmd.clone());
            argv
        }
    }
}

/// Parses a duration like `1m30s`, `45s` or `500ms` into nanoseconds.
fn parse_duration_ns(
    value: &Option<String>,
    instruction: &Instruction,
) -> Result<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let err = || StrataError::InstructionExec {
        instruction: instruction.to_string(),
        reason: format!("invalid duration: {value}"),
    };

    let mut total: i64 = 0;
    let mut number = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let amount: i64 = number.parse().map_err(|_| err())?;
        number.clear();
        let unit = match c {
            'h' => 3_600_000_000_000,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1_000_000
            }
            'm' => 60_000_000_000,
            's' => 1_000_000_000,
            _ => return Err(err()),
        };
        total += amount * unit;
    }
    if !number.is_empty() {
        return Err(err());
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::Healthcheck;
    use tempfile::TempDir;

    fn ctx() -> (TempDir, CommandContext) {
        let root = TempDir::new().unwrap();
        let ctx = CommandContext {
            root: root.path().to_path_buf(),
            context: PathBuf::from("/ctx"),
            work_dir: PathBuf::from("/work"),
        };
        (root, ctx)
    }

    async fn apply(instruction: Instruction, config: &mut ConfigFile) {
        let (_root, ctx) = ctx();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd = MetadataCommand::new(instruction, &ctx);
        cmd.execute(config, &mut args).await.unwrap();
    }

    #[tokio::test]
    async fn test_env_and_label() {
        let mut config = ConfigFile::default();
        apply(Instruction::Env { pairs: vec![("A".into(), "1".into())] }, &mut config).await;
        apply(Instruction::Label { pairs: vec![("b".into(), "c".into())] }, &mut config).await;
        assert_eq!(config.config.env, vec!["A=1"]);
        assert_eq!(config.config.labels.get("b").map(String::as_str), Some("c"));
    }

    #[tokio::test]
    async fn test_env_expansion_uses_previous_env() {
        let mut config = ConfigFile::default();
        apply(Instruction::Env { pairs: vec![("BASE".into(), "/opt".into())] }, &mut config)
            .await;
        apply(
            Instruction::Env { pairs: vec![("BIN".into(), "${BASE}/bin".into())] },
            &mut config,
        )
        .await;
        assert_eq!(config.config.get_env("BIN"), Some("/opt/bin"));
    }

    #[tokio::test]
    async fn test_workdir_relative_appends() {
        let mut config = ConfigFile::default();
        apply(Instruction::Workdir { path: "/app".into() }, &mut config).await;
        apply(Instruction::Workdir { path: "sub".into() }, &mut config).await;
        assert_eq!(config.config.working_dir, "/app/sub");
        apply(Instruction::Workdir { path: "/fresh".into() }, &mut config).await;
        assert_eq!(config.config.working_dir, "/fresh");
    }

    #[tokio::test]
    async fn test_cmd_shell_form_wraps_in_shell() {
        let mut config = ConfigFile::default();
        apply(Instruction::Cmd { command: Command::Shell("echo hi".into()) }, &mut config).await;
        assert_eq!(
            config.config.cmd,
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()])
        );

        apply(
            Instruction::Shell { shell: vec!["/bin/bash".into(), "-c".into()] },
            &mut config,
        )
        .await;
        apply(Instruction::Cmd { command: Command::Shell("echo hi".into()) }, &mut config).await;
        assert_eq!(
            config.config.cmd,
            Some(vec!["/bin/bash".to_string(), "-c".to_string(), "echo hi".to_string()])
        );
    }

    #[tokio::test]
    async fn test_volume_records_pending_whitelist_paths() {
        let root = TempDir::new().unwrap();
        let ctx = CommandContext {
            root: root.path().to_path_buf(),
            context: PathBuf::from("/ctx"),
            work_dir: PathBuf::from("/work"),
        };
        let mut config = ConfigFile::default();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd =
            MetadataCommand::new(Instruction::Volume { paths: vec!["/data".into()] }, &ctx);
        cmd.execute(&mut config, &mut args).await.unwrap();

        assert!(config.config.volumes.contains_key("/data"));
        assert_eq!(cmd.pending_volumes(), vec![root.path().join("data")]);
    }

    #[tokio::test]
    async fn test_expose_rejects_garbage() {
        let (_root, ctx) = ctx();
        let mut config = ConfigFile::default();
        let mut args = BuildArgs::new(&[], &[]).unwrap();
        let mut cmd = MetadataCommand::new(
            Instruction::Expose { ports: vec!["http/tcp".into()] },
            &ctx,
        );
        assert!(cmd.execute(&mut config, &mut args).await.is_err());
    }

    #[tokio::test]
    async fn test_healthcheck_durations() {
        let mut config = ConfigFile::default();
        apply(
            Instruction::Healthcheck {
                check: Healthcheck {
                    test: vec!["CMD-SHELL".into(), "true".into()],
                    interval: Some("1m30s".into()),
                    timeout: Some("500ms".into()),
                    start_period: None,
                    retries: Some(3),
                },
            },
            &mut config,
        )
        .await;
        let health = config.config.healthcheck.unwrap();
        assert_eq!(health.interval, Some(90_000_000_000));
        assert_eq!(health.timeout, Some(500_000_000));
        assert_eq!(health.start_period, None);
        assert_eq!(health.retries, Some(3));
    }

    #[tokio::test]
    async fn test_maintainer_sets_author() {
        let mut config = ConfigFile::default();
        apply(Instruction::Maintainer { name: "build team".into() }, &mut config).await;
        assert_eq!(config.author, "build team");
    }

    #[tokio::test]
    async fn test_onbuild_recorded() {
        let mut config = ConfigFile::default();
        apply(Instruction::OnBuild { trigger: "RUN echo hi".into() }, &mut config).await;
        assert_eq!(config.config.on_build, vec!["RUN echo hi"]);
    }
}
