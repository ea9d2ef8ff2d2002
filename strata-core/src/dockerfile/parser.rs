//! Dockerfile text parser.
//!
//! Produces the raw stage list consumed by `resolve_stages`. Handles line
//! continuations, comments, global ARGs before the first FROM, and both shell
//! and exec forms of RUN / CMD / ENTRYPOINT.

use crate::dockerfile::{Command, Dockerfile, Healthcheck, Instruction, RawStage};
use crate::error::{Result, StrataError};

/// Parses a Dockerfile from a string.
pub fn parse(content: &str) -> Result<Dockerfile> {
    let lines = preprocess(content);
    let mut pos = 0;

    // Global ARGs before the first FROM.
    let mut global_args = Vec::new();
    while pos < lines.len() {
        let (line_num, line) = &lines[pos];
        let keyword = instruction_keyword(line);
        if keyword.eq_ignore_ascii_case("FROM") {
            break;
        }
        if keyword.eq_ignore_ascii_case("ARG") {
            match parse_line(*line_num, line)? {
                Instruction::Arg { name, default } => global_args.push((name, default)),
                _ => unreachable!(),
            }
            pos += 1;
        } else {
            return Err(StrataError::Parse {
                line: *line_num,
                message: format!("expected ARG or FROM before the first stage, found {keyword}"),
            });
        }
    }

    let mut stages = Vec::new();
    while pos < lines.len() {
        let (stage, next) = parse_stage(&lines, pos)?;
        stages.push(stage);
        pos = next;
    }

    if stages.is_empty() {
        return Err(StrataError::Parse {
            line: 1,
            message: "Dockerfile must contain at least one FROM instruction".to_string(),
        });
    }

    Ok(Dockerfile { global_args, stages })
}

/// Parses one instruction line, e.g. an ONBUILD trigger from a base image.
pub fn parse_line(line_num: usize, line: &str) -> Result<Instruction> {
    let keyword = instruction_keyword(line);
    let rest = line[keyword.len()..].trim();
    let tokens = tokenize(rest);

    let err = |message: String| StrataError::Parse { line: line_num, message };

    match keyword.to_uppercase().as_str() {
        "RUN" => {
            if rest.is_empty() {
                return Err(err("RUN requires a command".to_string()));
            }
            Ok(Instruction::Run { command: parse_command(rest) })
        }
        "COPY" => parse_copy(line_num, &tokens, true),
        "ADD" => parse_copy(line_num, &tokens, false),
        "ENV" => parse_env(line_num, &tokens),
        "ARG" => {
            let first = tokens
                .first()
                .ok_or_else(|| err("ARG requires a name".to_string()))?;
            let (name, default) = match first.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(unquote(value))),
                None => (first.clone(), None),
            };
            Ok(Instruction::Arg { name, default })
        }
        "LABEL" => {
            let mut pairs = Vec::new();
            for token in &tokens {
                let (k, v) = token
                    .split_once('=')
                    .ok_or_else(|| err(format!("LABEL expects key=value, found {token}")))?;
                pairs.push((unquote(k), unquote(v)));
            }
            if pairs.is_empty() {
                return Err(err("LABEL requires at least one key=value".to_string()));
            }
            Ok(Instruction::Label { pairs })
        }
        "EXPOSE" => {
            if tokens.is_empty() {
                return Err(err("EXPOSE requires at least one port".to_string()));
            }
            let ports = tokens
                .iter()
                .map(|t| {
                    if t.contains('/') {
                        t.clone()
                    } else {
                        format!("{t}/tcp")
                    }
                })
                .collect();
            Ok(Instruction::Expose { ports })
        }
        "WORKDIR" => Ok(Instruction::Workdir { path: rest.to_string() }),
        "USER" => Ok(Instruction::User { user: rest.to_string() }),
        "VOLUME" => {
            let paths = if rest.starts_with('[') {
                parse_json_array(rest)
                    .ok_or_else(|| err("VOLUME has a malformed JSON array".to_string()))?
            } else {
                tokens.clone()
            };
            if paths.is_empty() {
                return Err(err("VOLUME requires at least one path".to_string()));
            }
            Ok(Instruction::Volume { paths })
        }
        "CMD" => Ok(Instruction::Cmd { command: parse_command(rest) }),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint { command: parse_command(rest) }),
        "ONBUILD" => {
            if rest.is_empty() {
                return Err(err("ONBUILD requires a trigger instruction".to_string()));
            }
            let trigger_keyword = instruction_keyword(rest);
            if trigger_keyword.eq_ignore_ascii_case("ONBUILD")
                || trigger_keyword.eq_ignore_ascii_case("FROM")
            {
                return Err(err(format!("ONBUILD may not trigger {trigger_keyword}")));
            }
            Ok(Instruction::OnBuild { trigger: rest.to_string() })
        }
        "STOPSIGNAL" => Ok(Instruction::Stopsignal { signal: rest.to_string() }),
        "HEALTHCHECK" => parse_healthcheck(line_num, rest, &tokens),
        "SHELL" => {
            let shell = parse_json_array(rest)
                .ok_or_else(|| err("SHELL requires JSON array form".to_string()))?;
            Ok(Instruction::Shell { shell })
        }
        "MAINTAINER" => Ok(Instruction::Maintainer { name: rest.to_string() }),
        other => Err(err(format!("unknown instruction: {other}"))),
    }
}

fn parse_stage(lines: &[(usize, String)], mut pos: usize) -> Result<(RawStage, usize)> {
    let (line_num, line) = &lines[pos];
    let keyword = instruction_keyword(line);
    if !keyword.eq_ignore_ascii_case("FROM") {
        return Err(StrataError::Parse {
            line: *line_num,
            message: format!("expected FROM to open a stage, found {keyword}"),
        });
    }

    // FROM [--platform=..] <base> [AS <name>]
    let tokens = tokenize(line[keyword.len()..].trim());
    let mut iter = tokens.iter().skip_while(|t| t.starts_with("--platform="));
    let base = iter
        .next()
        .ok_or_else(|| StrataError::Parse {
            line: *line_num,
            message: "FROM requires an image reference".to_string(),
        })?
        .clone();
    let name = match iter.next() {
        Some(kw) if kw.eq_ignore_ascii_case("AS") => {
            Some(iter.next().cloned().ok_or_else(|| StrataError::Parse {
                line: *line_num,
                message: "FROM ... AS requires a stage name".to_string(),
            })?)
        }
        Some(other) => {
            return Err(StrataError::Parse {
                line: *line_num,
                message: format!("unexpected token after FROM image: {other}"),
            })
        }
        None => None,
    };
    pos += 1;

    let mut instructions = Vec::new();
    while pos < lines.len() {
        let (line_num, line) = &lines[pos];
        if instruction_keyword(line).eq_ignore_ascii_case("FROM") {
            break;
        }
        instructions.push(parse_line(*line_num, line)?);
        pos += 1;
    }

    Ok((RawStage { name, base, instructions }, pos))
}

fn parse_copy(line_num: usize, tokens: &[String], is_copy: bool) -> Result<Instruction> {
    let mut from = None;
    let mut chown = None;
    let mut operand_start = 0;

    for (i, token) in tokens.iter().enumerate() {
        if let Some(value) = token.strip_prefix("--from=") {
            if !is_copy {
                return Err(StrataError::Parse {
                    line: line_num,
                    message: "ADD does not support --from".to_string(),
                });
            }
            from = Some(value.to_string());
            operand_start = i + 1;
        } else if let Some(value) = token.strip_prefix("--chown=") {
            chown = Some(value.to_string());
            operand_start = i + 1;
        } else {
            break;
        }
    }

    let operands = &tokens[operand_start..];
    if operands.len() < 2 {
        let name = if is_copy { "COPY" } else { "ADD" };
        return Err(StrataError::Parse {
            line: line_num,
            message: format!("{name} requires at least one source and a destination"),
        });
    }

    let sources = operands[..operands.len() - 1].to_vec();
    let dest = operands.last().cloned().unwrap_or_default();

    if is_copy {
        Ok(Instruction::Copy { sources, dest, from, chown })
    } else {
        Ok(Instruction::Add { sources, dest, chown })
    }
}

fn parse_env(line_num: usize, tokens: &[String]) -> Result<Instruction> {
    let first = tokens.first().ok_or_else(|| StrataError::Parse {
        line: line_num,
        message: "ENV requires at least one key=value".to_string(),
    })?;

    let mut pairs = Vec::new();
    if first.contains('=') {
        for token in tokens {
            let (k, v) = token.split_once('=').ok_or_else(|| StrataError::Parse {
                line: line_num,
                message: format!("ENV expects key=value, found {token}"),
            })?;
            pairs.push((k.to_string(), unquote(v)));
        }
    } else {
        // Legacy `ENV key value with spaces` form: one pair only.
        if tokens.len() < 2 {
            return Err(StrataError::Parse {
                line: line_num,
                message: "ENV requires a value".to_string(),
            });
        }
        pairs.push((first.clone(), tokens[1..].join(" ")));
    }
    Ok(Instruction::Env { pairs })
}

fn parse_healthcheck(line_num: usize, rest: &str, tokens: &[String]) -> Result<Instruction> {
    if rest.eq_ignore_ascii_case("NONE") {
        return Ok(Instruction::Healthcheck {
            check: Healthcheck {
                test: vec!["NONE".to_string()],
                interval: None,
                timeout: None,
                start_period: None,
                retries: None,
            },
        });
    }

    let mut interval = None;
    let mut timeout = None;
    let mut start_period = None;
    let mut retries = None;
    let mut cmd_start = None;

    for (i, token) in tokens.iter().enumerate() {
        if let Some(v) = token.strip_prefix("--interval=") {
            interval = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("--timeout=") {
            timeout = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("--start-period=") {
            start_period = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("--retries=") {
            retries = Some(v.parse::<u32>().map_err(|_| StrataError::Parse {
                line: line_num,
                message: format!("invalid --retries value: {v}"),
            })?);
        } else if token.eq_ignore_ascii_case("CMD") {
            cmd_start = Some(i + 1);
            break;
        } else {
            return Err(StrataError::Parse {
                line: line_num,
                message: format!("unexpected HEALTHCHECK token: {token}"),
            });
        }
    }

    let cmd_start = cmd_start.ok_or_else(|| StrataError::Parse {
        line: line_num,
        message: "HEALTHCHECK requires CMD or NONE".to_string(),
    })?;

    // Docker encodes the test as ["CMD-SHELL", cmd] or ["CMD", argv...].
    let cmd_tokens = &tokens[cmd_start..];
    let test = match parse_command(&cmd_tokens.join(" ")) {
        Command::Exec(argv) => {
            let mut test = vec!["CMD".to_string()];
            test.extend(argv);
            test
        }
        Command::Shell(cmd) => vec!["CMD-SHELL".to_string(), cmd],
    };

    Ok(Instruction::Healthcheck {
        check: Healthcheck { test, interval, timeout, start_period, retries },
    })
}

/// Shell form unless the operand is a JSON array.
fn parse_command(rest: &str) -> Command {
    if rest.starts_with('[') {
        if let Some(argv) = parse_json_array(rest) {
            return Command::Exec(argv);
        }
    }
    Command::Shell(rest.to_string())
}

fn parse_json_array(s: &str) -> Option<Vec<String>> {
    serde_json::from_str::<Vec<String>>(s).ok()
}

/// Combines continuation lines and strips comments and blanks.
/// Returns `(line_number, content)` pairs with 1-based numbering.
fn preprocess(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut current_num = 0;
    let mut continuation = false;

    for (idx, raw) in content.lines().enumerate() {
        let line_num = idx + 1;
        let trimmed = raw.trim();

        // Full-line comments don't terminate a continuation.
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() && !continuation {
            continue;
        }

        let (piece, continues) = match trimmed.strip_suffix('\\') {
            Some(head) => (head.trim(), true),
            None => (trimmed, false),
        };

        if continuation {
            if !piece.is_empty() {
                current.push(' ');
                current.push_str(piece);
            }
        } else {
            current_num = line_num;
            current = piece.to_string();
        }
        continuation = continues;

        if !continuation && !current.is_empty() {
            result.push((current_num, std::mem::take(&mut current)));
        }
    }

    if !current.is_empty() {
        result.push((current_num, current));
    }

    result
}

fn instruction_keyword(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && (s.starts_with('"') && s.ends_with('"')
        || s.starts_with('\'') && s.ends_with('\''))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// What the operand lexer is currently inside of.
enum Lex {
    /// Whitespace between tokens.
    Gap,
    /// A bare word; whitespace ends it.
    Word,
    /// A double-quoted span of a word; only the closing quote ends it.
    Quoted,
    /// A JSON array, kept whole as one token; tracks bracket nesting.
    Array(u32),
}

/// Splits an operand string on whitespace while keeping double-quoted spans
/// and JSON arrays intact.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = Lex::Gap;

    for c in s.chars() {
        if matches!(state, Lex::Gap | Lex::Word) && c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            state = Lex::Gap;
            continue;
        }

        current.push(c);
        state = match state {
            Lex::Gap if c == '[' => Lex::Array(1),
            Lex::Gap | Lex::Word if c == '"' => Lex::Quoted,
            Lex::Gap => Lex::Word,
            Lex::Word => Lex::Word,
            Lex::Quoted if c == '"' => Lex::Word,
            Lex::Quoted => Lex::Quoted,
            Lex::Array(depth) => match c {
                '[' => Lex::Array(depth + 1),
                ']' if depth > 1 => Lex::Array(depth - 1),
                ']' => {
                    tokens.push(std::mem::take(&mut current));
                    Lex::Gap
                }
                _ => Lex::Array(depth),
            },
        };
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
