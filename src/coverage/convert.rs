//! Decoding the measuring tool's native data files through its own
//! `json` report.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::store::Convert;
use super::{CoverageData, FileCoverage};
use crate::config::Config;
use crate::engine::CancelToken;
use crate::error::CoverageError;
use crate::exec::{Executor, Invocation};
use crate::template::{self, Vars};

/// Runs the configured conversion command for each native database.
#[derive(Debug)]
pub struct ToolConverter<'a> {
    executor: &'a dyn Executor,
    command: &'a [String],
    root: &'a Path,
    env: BTreeMap<String, String>,
    cancel: CancelToken,
}

impl<'a> ToolConverter<'a> {
    /// A converter using `config.coverage.convert`, run from the repository
    /// root with the current process environment.
    #[must_use]
    pub fn new(config: &'a Config, executor: &'a dyn Executor) -> Self {
        Self {
            executor,
            command: &config.coverage.convert,
            root: &config.root,
            env: std::env::vars().collect(),
            cancel: CancelToken::new(),
        }
    }

    /// Replace the environment the command runs with.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn failure(database: &Path, message: impl Into<String>) -> CoverageError {
        CoverageError::Conversion {
            path: database.display().to_string(),
            message: message.into(),
        }
    }
}

impl Convert for ToolConverter<'_> {
    fn convert(&self, database: &Path) -> Result<CoverageData, CoverageError> {
        let scratch = tempfile::tempdir().map_err(|e| Self::failure(database, e.to_string()))?;
        let output: PathBuf = scratch.path().join("report.json");
        let vars = Vars::new()
            .with("artifact", database.display().to_string())
            .with("output", output.display().to_string())
            .with("root", self.root.display().to_string());
        let argv = template::expand_argv(self.command, &vars);
        let invocation = Invocation::from_argv(&argv, self.root, self.env.clone())
            .ok_or_else(|| Self::failure(database, "no conversion command configured"))?;

        let result = self
            .executor
            .execute(&invocation, &self.cancel, &|line| tracing::debug!("{line}"))
            .map_err(|e| Self::failure(database, format!("{e:#}")))?;
        if !result.success {
            return Err(Self::failure(
                database,
                format!("{} exited {}", invocation.program, result.exit_code()),
            ));
        }

        let report = fs::read_to_string(&output)
            .map_err(|e| Self::failure(database, format!("no report written: {e}")))?;
        parse_tool_report(&report).map_err(|e| Self::failure(database, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ToolReport {
    files: BTreeMap<String, ToolFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolFile {
    executed_lines: Vec<u32>,
    missing_lines: Vec<u32>,
    executed_branches: Vec<(i64, i64)>,
    missing_branches: Vec<(i64, i64)>,
}

/// Read the tool's JSON report. Executed lines and branch arms count one
/// hit, missing ones zero; arms are keyed `"from:to"`.
///
/// # Errors
///
/// Returns the decoder error for anything that is not such a report.
pub fn parse_tool_report(text: &str) -> Result<CoverageData, serde_json::Error> {
    let report: ToolReport = serde_json::from_str(text)?;
    let files = report
        .files
        .into_iter()
        .map(|(path, file)| {
            let mut coverage = FileCoverage::default();
            coverage.lines.extend(file.missing_lines.iter().map(|l| (*l, 0)));
            coverage.lines.extend(file.executed_lines.iter().map(|l| (*l, 1)));
            let arm = |(from, to): &(i64, i64)| format!("{from}:{to}");
            coverage.branches.extend(file.missing_branches.iter().map(|b| (arm(b), 0)));
            coverage.branches.extend(file.executed_branches.iter().map(|b| (arm(b), 1)));
            (path, coverage)
        })
        .collect();
    Ok(CoverageData { files })
}
