//! Build-argument scoping and shell-style variable expansion.
//!
//! ARG values are visible only within the stage after their declaration; ENV
//! overrides ARG during expansion; an unset ARG expands to the empty string.

use crate::error::{Result, StrataError};
use std::collections::HashMap;

/// ARG state for one build, reset per stage.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    /// `--build-arg KEY=VALUE` overrides.
    cli: HashMap<String, String>,
    /// Defaults declared before the first FROM.
    global_defaults: HashMap<String, Option<String>>,
    /// ARGs declared so far in the current stage, with effective values.
    declared: HashMap<String, Option<String>>,
}

impl BuildArgs {
    pub fn new(cli_args: &[String], global: &[(String, Option<String>)]) -> Result<Self> {
        let mut cli = HashMap::new();
        for raw in cli_args {
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                StrataError::InvalidConfig {
                    reason: format!("build-arg `{raw}` is not in KEY=VALUE form"),
                }
            })?;
            cli.insert(key.to_string(), value.to_string());
        }

        let global_defaults = global.iter().cloned().collect();

        // Global ARGs are in scope for FROM expansion immediately.
        let mut args = Self { cli, global_defaults, declared: HashMap::new() };
        for (name, default) in global {
            args.declare(name, default.clone());
        }
        Ok(args)
    }

    /// Drops stage-local declarations at a stage boundary. Global ARGs must be
    /// re-declared inside a stage to become visible again, per Dockerfile
    /// semantics.
    pub fn begin_stage(&mut self) {
        self.declared.clear();
    }

    /// Records an ARG declaration. The CLI override wins over the declared
    /// default; a global default fills in when neither is present.
    pub fn declare(&mut self, name: &str, default: Option<String>) {
        let value = self
            .cli
            .get(name)
            .cloned()
            .or(default)
            .or_else(|| self.global_defaults.get(name).cloned().flatten());
        self.declared.insert(name.to_string(), value);
    }

    /// The effective value of a declared ARG.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.declared.get(name).and_then(|v| v.as_deref())
    }

    /// `KEY=VALUE` strings for every declared ARG with a value, injected into
    /// the environment of RUN commands.
    pub fn replacement_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .declared
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}={v}")))
            .collect();
        env.sort();
        env
    }
}

/// Expands `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR:+alt}` in `input`.
///
/// `env` entries (`KEY=VALUE`) shadow ARG values. Unknown variables expand to
/// the empty string; `\$` escapes a literal dollar.
pub fn expand(input: &str, env: &[String], args: &BuildArgs) -> String {
    let lookup = |name: &str| -> Option<String> {
        for entry in env {
            if let Some((k, v)) = entry.split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
        args.get(name).map(str::to_string)
    };

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '$' {
                    out.push('$');
                    chars.next();
                    continue;
                }
            }
            out.push(c);
            continue;
        }
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    // Unterminated brace; emit as written.
                    out.push_str("${");
                    out.push_str(&body);
                    continue;
                }
                out.push_str(&expand_braced(&body, &lookup));
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(value) = lookup(&name) {
                    out.push_str(&value);
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

fn expand_braced(body: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some((name, default)) = body.split_once(":-") {
        return lookup(name).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string());
    }
    if let Some((name, alt)) = body.split_once(":+") {
        return match lookup(name).filter(|v| !v.is_empty()) {
            Some(_) => alt.to_string(),
            None => String::new(),
        };
    }
    lookup(body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cli: &[&str], global: &[(&str, Option<&str>)]) -> BuildArgs {
        let cli: Vec<String> = cli.iter().map(|s| s.to_string()).collect();
        let global: Vec<(String, Option<String>)> = global
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect();
        BuildArgs::new(&cli, &global).unwrap()
    }

    #[test]
    fn test_cli_overrides_default() {
        let mut a = args(&["V=cli"], &[]);
        a.declare("V", Some("default".into()));
        assert_eq!(a.get("V"), Some("cli"));
    }

    #[test]
    fn test_undeclared_is_invisible() {
        let a = args(&["V=cli"], &[]);
        // begin_stage clears global declarations too
        let mut a2 = a.clone();
        a2.begin_stage();
        assert_eq!(a2.get("V"), None);
    }

    #[test]
    fn test_global_default_fills_redeclaration() {
        let mut a = args(&[], &[("V", Some("global"))]);
        a.begin_stage();
        a.declare("V", None);
        assert_eq!(a.get("V"), Some("global"));
    }

    #[test]
    fn test_expand_simple_and_braced() {
        let mut a = args(&[], &[]);
        a.declare("NAME", Some("world".into()));
        assert_eq!(expand("hello $NAME", &[], &a), "hello world");
        assert_eq!(expand("hello ${NAME}!", &[], &a), "hello world!");
        assert_eq!(expand("hello $MISSING.", &[], &a), "hello .");
    }

    #[test]
    fn test_expand_env_overrides_arg() {
        let mut a = args(&[], &[]);
        a.declare("V", Some("from-arg".into()));
        let env = vec!["V=from-env".to_string()];
        assert_eq!(expand("$V", &env, &a), "from-env");
    }

    #[test]
    fn test_expand_default_and_alt_forms() {
        let mut a = args(&[], &[]);
        a.declare("SET", Some("yes".into()));
        assert_eq!(expand("${SET:-fallback}", &[], &a), "yes");
        assert_eq!(expand("${UNSET:-fallback}", &[], &a), "fallback");
        assert_eq!(expand("${SET:+alt}", &[], &a), "alt");
        assert_eq!(expand("${UNSET:+alt}", &[], &a), "");
    }

    #[test]
    fn test_expand_escape() {
        let a = args(&[], &[]);
        assert_eq!(expand("cost: \\$5", &[], &a), "cost: $5");
    }

    #[test]
    fn test_replacement_env_sorted() {
        let mut a = args(&[], &[]);
        a.declare("B", Some("2".into()));
        a.declare("A", Some("1".into()));
        a.declare("C", None);
        assert_eq!(a.replacement_env(), vec!["A=1".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn test_invalid_cli_arg() {
        assert!(BuildArgs::new(&["NOEQUALS".to_string()], &[]).is_err());
    }
}
