//! `{...}` substitution in command arguments and variable values.
//!
//! Supported forms:
//!
//! - `{name}`: a named variable (`root`, `workdir`, `tmpdir`,
//!   `coverage_file`, `env_name`, or any extra variable supplied by the caller)
//! - `{env:KEY}` / `{env:KEY:default}`: a process environment variable;
//!   the default may itself contain substitutions
//! - `{posargs}` / `{posargs:default words}`: caller-supplied positional
//!   arguments; an argument consisting only of this form expands to zero or
//!   more arguments
//!
//! Unknown names and unbalanced braces are left untouched so literal braces
//! in inline scripts survive.
use std::collections::BTreeMap;

/// Values available to substitutions.
#[derive(Debug, Clone, Default)]
pub struct Vars<'a> {
    /// Named variables.
    pub named: BTreeMap<&'a str, String>,
    /// Process environment visible to `{env:...}`.
    pub env: Option<&'a BTreeMap<String, String>>,
    /// Positional arguments from the caller; `None` selects defaults.
    pub posargs: Option<&'a [String]>,
}

impl<'a> Vars<'a> {
    /// Empty variable set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named variable.
    #[must_use]
    pub fn with(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.named.insert(name, value.into());
        self
    }

    /// Use `env` for `{env:...}` lookups.
    #[must_use]
    pub const fn with_env(mut self, env: &'a BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Use `posargs` for `{posargs}`.
    #[must_use]
    pub const fn with_posargs(mut self, posargs: Option<&'a [String]>) -> Self {
        self.posargs = posargs;
        self
    }
}

/// Expand every substitution in a single string.
#[must_use]
pub fn expand(input: &str, vars: &Vars<'_>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        let (before, tail) = rest.split_at(open);
        out.push_str(before);
        match matching_close(tail) {
            Some(close) => {
                let inner = tail.get(1..close).unwrap_or_default();
                match substitute(inner, vars) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(tail.get(..=close).unwrap_or_default()),
                }
                rest = tail.get(close + 1..).unwrap_or_default();
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand an argument vector.
///
/// An element that is exactly `{posargs}` or `{posargs:...}` splices the
/// positional arguments (or the whitespace-split default) in place.
#[must_use]
pub fn expand_argv(argv: &[String], vars: &Vars<'_>) -> Vec<String> {
    let mut out = Vec::with_capacity(argv.len());
    for arg in argv {
        if let Some(default) = standalone_posargs(arg) {
            match vars.posargs {
                Some(given) => out.extend(given.iter().cloned()),
                None => out.extend(
                    expand(default, vars)
                        .split_whitespace()
                        .map(str::to_string),
                ),
            }
        } else {
            out.push(expand(arg, vars));
        }
    }
    out
}

/// If `arg` is a lone posargs substitution, return its default text.
fn standalone_posargs(arg: &str) -> Option<&str> {
    let inner = arg.strip_prefix('{')?.strip_suffix('}')?;
    if matching_close(arg) != Some(arg.len() - 1) {
        return None;
    }
    if inner == "posargs" {
        return Some("");
    }
    inner.strip_prefix("posargs:")
}

/// Index of the `}` closing the `{` at position 0, honouring nesting.
fn matching_close(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn substitute(inner: &str, vars: &Vars<'_>) -> Option<String> {
    if let Some(spec) = inner.strip_prefix("env:") {
        let (key, default) = spec
            .split_once(':')
            .map_or((spec, None), |(k, d)| (k, Some(d)));
        let found = vars.env.and_then(|env| env.get(key)).cloned();
        return Some(found.unwrap_or_else(|| default.map(|d| expand(d, vars)).unwrap_or_default()));
    }
    if inner == "posargs" || inner.starts_with("posargs:") {
        let default = inner.strip_prefix("posargs").unwrap_or_default();
        let default = default.strip_prefix(':').unwrap_or(default);
        return Some(vars.posargs.map_or_else(
            || expand(default, vars),
            |given| given.join(" "),
        ));
    }
    vars.named.get(inner).cloned()
}
