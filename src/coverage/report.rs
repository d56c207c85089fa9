use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use super::{CoverageData, Totals, line_ranges};
use crate::error::CoverageError;

/// LCOV export file name.
pub const LCOV_FILE: &str = "coverage.lcov";

/// JSON export file name.
pub const JSON_REPORT_FILE: &str = "coverage-report.json";

/// Render `data` in LCOV tracefile format.
///
/// Branch arms recorded as `"line:arm"` become `BRDA` records; keys that do
/// not parse as two numbers are left out.
#[must_use]
pub fn to_lcov(data: &CoverageData) -> String {
    let mut out = String::new();
    for (path, file) in &data.files {
        let _ = writeln!(out, "TN:");
        let _ = writeln!(out, "SF:{path}");

        let mut arms: Vec<(u32, u32, u64)> = file
            .branches
            .iter()
            .filter_map(|(key, hits)| {
                let (line, arm) = key.split_once(':')?;
                Some((line.parse().ok()?, arm.parse().ok()?, *hits))
            })
            .collect();
        arms.sort_unstable();
        for (line, arm, hits) in &arms {
            let _ = writeln!(out, "BRDA:{line},0,{arm},{hits}");
        }
        if !arms.is_empty() {
            let taken = arms.iter().filter(|(_, _, h)| *h > 0).count();
            let _ = writeln!(out, "BRF:{}", arms.len());
            let _ = writeln!(out, "BRH:{taken}");
        }

        for (line, hits) in &file.lines {
            let _ = writeln!(out, "DA:{line},{hits}");
        }
        let _ = writeln!(out, "LF:{}", file.statements());
        let _ = writeln!(
            out,
            "LH:{}",
            file.statements() - file.missed_lines().len()
        );
        let _ = writeln!(out, "end_of_record");
    }
    out
}

/// Write the LCOV and JSON exports into `dir`, returning the written paths.
///
/// # Errors
///
/// Returns [`CoverageError::Io`] if `dir` cannot be created or written.
pub fn write_reports(dir: &Path, data: &CoverageData) -> Result<Vec<PathBuf>, CoverageError> {
    let io = |path: &Path| {
        let path = path.display().to_string();
        move |source: std::io::Error| CoverageError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io(dir))?;

    let lcov = dir.join(LCOV_FILE);
    fs::write(&lcov, to_lcov(data)).map_err(io(&lcov))?;

    let totals = data.totals();
    let report = serde_json::json!({
        "percent": totals.percent(),
        "totals": totals,
        "files": data.files,
    });
    let json = dir.join(JSON_REPORT_FILE);
    let body = serde_json::to_string_pretty(&report).map_err(|e| CoverageError::Corrupt {
        path: json.display().to_string(),
        message: e.to_string(),
    })?;
    fs::write(&json, body).map_err(io(&json))?;

    Ok(vec![lcov, json])
}

/// One file in the summary table.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// Source path.
    pub name: String,
    /// Executable lines.
    pub statements: usize,
    /// Lines never executed.
    pub missed: usize,
    /// Covered percentage, lines and branch arms together.
    pub percent: f64,
    /// Missed lines as compressed ranges.
    pub missing: String,
    /// Every line and branch arm was hit.
    pub complete: bool,
}

/// Human-readable coverage table.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Shown rows in path order.
    pub rows: Vec<SummaryRow>,
    /// Totals over every file, including hidden ones.
    pub totals: Totals,
    /// Fully covered files left out because of `skip_covered`.
    pub hidden: usize,
}

impl Summary {
    /// Build the table for `data`.
    #[must_use]
    pub fn new(data: &CoverageData, skip_covered: bool) -> Self {
        let mut hidden = 0;
        let rows = data
            .files
            .iter()
            .filter_map(|(name, file)| {
                let complete = file.is_complete();
                if complete && skip_covered {
                    hidden += 1;
                    return None;
                }
                let single = CoverageData {
                    files: std::iter::once((name.clone(), file.clone())).collect(),
                };
                Some(SummaryRow {
                    name: name.clone(),
                    statements: file.statements(),
                    missed: file.missed_lines().len(),
                    percent: single.totals().percent(),
                    missing: line_ranges(&file.missed_lines()),
                    complete,
                })
            })
            .collect();
        Self {
            rows,
            totals: data.totals(),
            hidden,
        }
    }

    /// Table lines; incomplete rows are highlighted in yellow.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .chain(["Name".len(), "TOTAL".len()])
            .max()
            .unwrap_or(0);
        let row = |name: &str, stmts: &str, miss: &str, cover: &str, missing: &str| {
            format!("{name:<width$}  {stmts:>6}  {miss:>6}  {cover:>7}  {missing}")
                .trim_end()
                .to_string()
        };

        let header = row("Name", "Stmts", "Miss", "Cover", "Missing");
        let rule = "-".repeat(header.len());
        let mut lines = vec![header, rule.clone()];
        for r in &self.rows {
            let line = row(
                &r.name,
                &r.statements.to_string(),
                &r.missed.to_string(),
                &format!("{:.1}%", r.percent),
                &r.missing,
            );
            if r.complete {
                lines.push(line);
            } else {
                lines.push(format!("\x1b[33m{line}\x1b[0m"));
            }
        }
        lines.push(rule);
        lines.push(row(
            "TOTAL",
            &self.totals.statements.to_string(),
            &self.totals.missed.to_string(),
            &format!("{:.1}%", self.totals.percent()),
            "",
        ));
        match self.hidden {
            0 => {}
            1 => lines.push("1 file skipped due to complete coverage.".to_string()),
            n => lines.push(format!("{n} files skipped due to complete coverage.")),
        }
        lines
    }
}
