// Shared helpers for integration tests.
//
// Provides a temporary-directory-backed repository with its own
// `envmatrix.toml` and a scripted executor so each integration test can run
// environments without starting real processes.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

use envmatrix_cli::config::Config;
use envmatrix_cli::engine::{CancelToken, Engine, RunOptions};
use envmatrix_cli::exec::{ExecResult, Executor, Invocation};
use envmatrix_cli::platform::{Os, Platform};

/// Coverage data written by the scripted `cover` program.
pub const COVERAGE_JSON: &str =
    r#"{"files":{"src/pkg/core.py":{"lines":{"1":1,"2":1,"3":0},"branches":{"2:0":1,"2:1":0}}}}"#;

/// What the measuring tool's `json` command reports for one database.
pub const TOOL_REPORT: &str = r#"{"meta":{"format":3},"files":{"src/pkg/net.py":{"executed_lines":[1,2],"missing_lines":[5],"executed_branches":[],"missing_branches":[]}}}"#;

/// A small configuration exercising actions, wrapping, coverage and failure.
pub const CONFIG: &str = r#"
envlist = ["unit", "unit-cov"]

[base]
action = { name = "test-run", argv = ["runner", "{env_name}", "{posargs:all}"] }

[base.setenv]
SUITE_ROOT = "{root}"

[factors.unit]
skip_install = true

[factors.cov]
coverage = true
wrap = { name = "coverage", prefix = ["cover", "-m"], strip = 0 }

[factors.broken]
skip_install = true
action = { name = "boom", argv = ["boom"] }

[factors.posix]
platforms = ["linux", "macos"]
commands = [{ stage = "notice", name = "posix-notice", argv = ["notice"] }]

[coverage]
dir = "cov"

[matrix]
interpreters = ["3.11", "3.12"]
envs = ["unit"]
arch = ["x86_64"]
include = [{ interpreter = "3.12", env = "broken", arch = "x86_64" }]

[ci]
primary_branch = "trunk"
workflow = "ci"
"#;

/// An isolated repository backed by a [`tempfile::TempDir`].
pub struct TestRepo {
    /// Temporary directory containing the repository.
    pub root: tempfile::TempDir,
}

impl TestRepo {
    /// Create a repository whose `envmatrix.toml` is `config`.
    pub fn new(config: &str) -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        std::fs::write(root.path().join("envmatrix.toml"), config).expect("write config");
        Self { root }
    }

    /// Path to the repository root.
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Load the repository configuration from disk.
    pub fn config(&self) -> Config {
        Config::load(self.root.path(), None).expect("load config")
    }
}

/// Linux on x86-64, independent of the host running the tests.
pub fn linux() -> Platform {
    Platform::new(Os::Linux, "x86_64")
}

/// An engine bound to `config` and `executor` with a fixed platform and an
/// empty caller environment.
pub fn engine<'a>(config: &'a Config, executor: &'a dyn Executor, options: RunOptions) -> Engine<'a> {
    Engine::new(config, executor, CancelToken::new(), options)
        .with_platform(linux())
        .with_system_env(BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]))
}

/// Replays canned exit codes keyed by a substring of the command line.
///
/// Commands run as `cover` write [`COVERAGE_JSON`] to the file named by
/// `ENVMATRIX_COVERAGE_FILE`, and `coverage json ... -o FILE` writes
/// [`TOOL_REPORT`] to `FILE`, like the real tools would.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    codes: Vec<(String, i32)>,
    missing: BTreeSet<String>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose line contains `needle` exit with `code`.
    pub fn exit(mut self, needle: &str, code: i32) -> Self {
        self.codes.push((needle.to_string(), code));
        self
    }

    /// `program` is not on `PATH`.
    pub fn missing(mut self, program: &str) -> Self {
        self.missing.insert(program.to_string());
        self
    }

    /// Command lines executed so far.
    pub fn lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(Invocation::display)
            .collect()
    }

    /// Process environments of the executed commands.
    pub fn envs(&self) -> Vec<BTreeMap<String, String>> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|i| i.env.clone())
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        _cancel: &CancelToken,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Result<ExecResult> {
        let line = invocation.display();
        self.calls.lock().expect("calls lock").push(invocation.clone());
        sink(&format!("ran {line}"));
        if invocation.program == "cover"
            && let Some(path) = invocation.env.get("ENVMATRIX_COVERAGE_FILE")
        {
            std::fs::write(path, COVERAGE_JSON)?;
        }
        if invocation.program == "coverage"
            && invocation.args.first().is_some_and(|a| a == "json")
            && let Some(output) = invocation.args.iter().skip_while(|a| *a != "-o").nth(1)
        {
            std::fs::write(output, TOOL_REPORT)?;
        }
        let code = self
            .codes
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map_or(0, |(_, code)| *code);
        Ok(ExecResult {
            success: code == 0,
            code: Some(code),
            ..ExecResult::default()
        })
    }

    fn which(&self, program: &str, _env: &BTreeMap<String, String>, _cwd: &Path) -> bool {
        !self.missing.contains(program)
    }
}
