//! Dockerfile model: stages, instructions, and stage resolution.
//!
//! The parser produces raw stages; `resolve_stages` turns them into the form
//! the executor consumes, with base references resolved, `--target` applied,
//! and the `final_stage` / `save_stage` flags computed.

pub mod args;
pub mod parser;

use crate::error::{Result, StrataError};
use std::fmt;

pub use parser::parse;

/// A parsed Dockerfile.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    /// ARG declarations before the first FROM, in order.
    pub global_args: Vec<(String, Option<String>)>,
    pub stages: Vec<RawStage>,
}

/// A stage as written: base reference still unexpanded, no flags yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStage {
    /// `FROM <base> AS <name>` stage name.
    pub name: Option<String>,
    /// The base reference text, possibly containing `${ARG}` forms.
    pub base: String,
    pub instructions: Vec<Instruction>,
}

/// Where a stage's base filesystem comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseImage {
    /// Pull (or load from the warm cache) a registry reference.
    Registry(String),
    /// Re-materialize a previously built stage.
    Stage(usize),
    /// The empty image.
    Scratch,
}

/// A stage ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub index: usize,
    pub name: Option<String>,
    pub base: BaseImage,
    pub instructions: Vec<Instruction>,
    /// True for the stage whose image is returned to the user.
    pub final_stage: bool,
    /// True if a later stage references this one and it must be persisted.
    pub save_stage: bool,
}

/// Shell or exec form of RUN / CMD / ENTRYPOINT.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Shell(String),
    Exec(Vec<String>),
}

impl Command {
    pub fn display_string(&self) -> String {
        match self {
            Command::Shell(s) => s.clone(),
            Command::Exec(argv) => {
                let quoted: Vec<String> = argv.iter().map(|a| format!("\"{a}\"")).collect();
                format!("[{}]", quoted.join(", "))
            }
        }
    }
}

/// HEALTHCHECK configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Healthcheck {
    /// Empty test means `HEALTHCHECK NONE`.
    pub test: Vec<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// A single Dockerfile instruction. Pure data; execution lives in
/// `crate::commands`.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Run { command: Command },
    Copy { sources: Vec<String>, dest: String, from: Option<String>, chown: Option<String> },
    Add { sources: Vec<String>, dest: String, chown: Option<String> },
    Env { pairs: Vec<(String, String)> },
    Arg { name: String, default: Option<String> },
    Label { pairs: Vec<(String, String)> },
    Workdir { path: String },
    User { user: String },
    Expose { ports: Vec<String> },
    Volume { paths: Vec<String> },
    Cmd { command: Command },
    Entrypoint { command: Command },
    OnBuild { trigger: String },
    Stopsignal { signal: String },
    Healthcheck { check: Healthcheck },
    Shell { shell: Vec<String> },
    Maintainer { name: String },
}

impl fmt::Display for Instruction {
    /// The canonical single-line form, used as the `created_by` history string
    /// and as a cache-key component.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Run { command } => write!(f, "RUN {}", command.display_string()),
            Instruction::Copy { sources, dest, from, chown } => {
                write!(f, "COPY")?;
                if let Some(from) = from {
                    write!(f, " --from={from}")?;
                }
                if let Some(chown) = chown {
                    write!(f, " --chown={chown}")?;
                }
                write!(f, " {} {}", sources.join(" "), dest)
            }
            Instruction::Add { sources, dest, chown } => {
                write!(f, "ADD")?;
                if let Some(chown) = chown {
                    write!(f, " --chown={chown}")?;
                }
                write!(f, " {} {}", sources.join(" "), dest)
            }
            Instruction::Env { pairs } => {
                write!(f, "ENV")?;
                for (k, v) in pairs {
                    write!(f, " {k}={v}")?;
                }
                Ok(())
            }
            Instruction::Arg { name, default } => match default {
                Some(d) => write!(f, "ARG {name}={d}"),
                None => write!(f, "ARG {name}"),
            },
            Instruction::Label { pairs } => {
                write!(f, "LABEL")?;
                for (k, v) in pairs {
                    write!(f, " {k}={v}")?;
                }
                Ok(())
            }
            Instruction::Workdir { path } => write!(f, "WORKDIR {path}"),
            Instruction::User { user } => write!(f, "USER {user}"),
            Instruction::Expose { ports } => write!(f, "EXPOSE {}", ports.join(" ")),
            Instruction::Volume { paths } => write!(f, "VOLUME {}", paths.join(" ")),
            Instruction::Cmd { command } => write!(f, "CMD {}", command.display_string()),
            Instruction::Entrypoint { command } => {
                write!(f, "ENTRYPOINT {}", command.display_string())
            }
            Instruction::OnBuild { trigger } => write!(f, "ONBUILD {trigger}"),
            Instruction::Stopsignal { signal } => write!(f, "STOPSIGNAL {signal}"),
            Instruction::Healthcheck { check } => {
                if check.test.is_empty() {
                    return write!(f, "HEALTHCHECK NONE");
                }
                write!(f, "HEALTHCHECK")?;
                if let Some(v) = &check.interval {
                    write!(f, " --interval={v}")?;
                }
                if let Some(v) = &check.timeout {
                    write!(f, " --timeout={v}")?;
                }
                if let Some(v) = &check.start_period {
                    write!(f, " --start-period={v}")?;
                }
                if let Some(v) = &check.retries {
                    write!(f, " --retries={v}")?;
                }
                write!(f, " CMD {}", check.test.join(" "))
            }
            Instruction::Shell { shell } => {
                let quoted: Vec<String> = shell.iter().map(|a| format!("\"{a}\"")).collect();
                write!(f, "SHELL [{}]", quoted.join(", "))
            }
            Instruction::Maintainer { name } => write!(f, "MAINTAINER {name}"),
        }
    }
}

/// Resolves raw stages into executable stages.
///
/// - Expands global ARGs in FROM references.
/// - Maps `FROM <name>` / `COPY --from=<name>` to stage indexes.
/// - Applies `--target`, truncating the stage list.
/// - Computes `final_stage` and `save_stage`.
pub fn resolve_stages(
    dockerfile: &Dockerfile,
    target: Option<&str>,
    cli_args: &[String],
) -> Result<Vec<Stage>> {
    let global = args::BuildArgs::new(cli_args, &dockerfile.global_args)?;

    // Expand base references with the global ARG scope, then cut at --target.
    let mut raw: Vec<(Option<String>, String, Vec<Instruction>)> = Vec::new();
    for stage in &dockerfile.stages {
        let base = args::expand(&stage.base, &[], &global);
        raw.push((stage.name.clone(), base, stage.instructions.clone()));
    }

    let last = match target {
        Some(name) => raw
            .iter()
            .position(|(n, _, _)| n.as_deref() == Some(name))
            .ok_or_else(|| StrataError::TargetNotFound { target: name.to_string() })?,
        None => raw.len().saturating_sub(1),
    };
    raw.truncate(last + 1);

    let stage_index = |name_or_index: &str, upto: usize| -> Option<usize> {
        if let Ok(idx) = name_or_index.parse::<usize>() {
            return (idx < upto).then_some(idx);
        }
        raw[..upto].iter().position(|(n, _, _)| n.as_deref() == Some(name_or_index))
    };

    let mut stages = Vec::with_capacity(raw.len());
    let mut saved = vec![false; raw.len()];

    for (index, (name, base, mut instructions)) in raw.clone().into_iter().enumerate() {
        let base = if base.eq_ignore_ascii_case("scratch") {
            BaseImage::Scratch
        } else if let Some(dep) = stage_index(&base, index) {
            saved[dep] = true;
            BaseImage::Stage(dep)
        } else {
            BaseImage::Registry(base)
        };

        // Canonicalize --from references to indexes so the executor never
        // deals with stage names.
        for instruction in &mut instructions {
            if let Instruction::Copy { from: Some(from), .. } = instruction {
                let dep = stage_index(from, index).ok_or_else(|| {
                    StrataError::InvalidStageReference {
                        reason: format!("COPY --from={from} does not name an earlier stage"),
                    }
                })?;
                saved[dep] = true;
                *from = dep.to_string();
            }
        }

        stages.push(Stage {
            index,
            name,
            base,
            instructions,
            final_stage: index == last,
            save_stage: false,
        });
    }

    for stage in &mut stages {
        stage.save_stage = saved[stage.index] && !stage.final_stage;
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI: &str = "\
FROM alpine:3.12 AS build
COPY x /x

FROM scratch
COPY --from=build /x /x
";

    #[test]
    fn test_resolve_flags() {
        let df = parse(MULTI).unwrap();
        let stages = resolve_stages(&df, None, &[]).unwrap();
        assert_eq!(stages.len(), 2);
        assert!(!stages[0].final_stage);
        assert!(stages[0].save_stage);
        assert!(stages[1].final_stage);
        assert!(!stages[1].save_stage);
        assert_eq!(stages[1].base, BaseImage::Scratch);
    }

    #[test]
    fn test_resolve_copy_from_name_to_index() {
        let df = parse(MULTI).unwrap();
        let stages = resolve_stages(&df, None, &[]).unwrap();
        match &stages[1].instructions[0] {
            Instruction::Copy { from, .. } => assert_eq!(from.as_deref(), Some("0")),
            other => panic!("expected COPY, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_from_named_stage_base() {
        let df = parse("FROM alpine AS base\nFROM base\nRUN true\n").unwrap();
        let stages = resolve_stages(&df, None, &[]).unwrap();
        assert_eq!(stages[1].base, BaseImage::Stage(0));
        assert!(stages[0].save_stage);
    }

    #[test]
    fn test_resolve_target_truncates() {
        let df = parse(MULTI).unwrap();
        let stages = resolve_stages(&df, Some("build"), &[]).unwrap();
        assert_eq!(stages.len(), 1);
        assert!(stages[0].final_stage);
        assert!(!stages[0].save_stage);
    }

    #[test]
    fn test_resolve_unknown_target() {
        let df = parse(MULTI).unwrap();
        assert!(resolve_stages(&df, Some("missing"), &[]).is_err());
    }

    #[test]
    fn test_resolve_global_arg_in_from() {
        let df = parse("ARG TAG=3.12\nFROM alpine:${TAG}\n").unwrap();
        let stages = resolve_stages(&df, None, &[]).unwrap();
        assert_eq!(stages[0].base, BaseImage::Registry("alpine:3.12".to_string()));

        let stages =
            resolve_stages(&df, None, &["TAG=edge".to_string()]).unwrap();
        assert_eq!(stages[0].base, BaseImage::Registry("alpine:edge".to_string()));
    }

    #[test]
    fn test_created_by_strings() {
        assert_eq!(
            Instruction::Run { command: Command::Shell("echo hi".into()) }.to_string(),
            "RUN echo hi"
        );
        assert_eq!(
            Instruction::Env { pairs: vec![("A".into(), "1".into())] }.to_string(),
            "ENV A=1"
        );
        assert_eq!(
            Instruction::Copy {
                sources: vec!["foo".into()],
                dest: "/foo".into(),
                from: None,
                chown: None
            }
            .to_string(),
            "COPY foo /foo"
        );
        assert_eq!(
            Instruction::Cmd { command: Command::Exec(vec!["nginx".into()]) }.to_string(),
            "CMD [\"nginx\"]"
        );
    }
}
