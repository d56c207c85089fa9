//! Coverage artifacts: per-run data files, combination, reports, uploads.
mod convert;
mod report;
mod store;
mod upload;

pub use convert::{ToolConverter, parse_tool_report};
pub use report::{Summary, SummaryRow, to_lcov, write_reports};
pub use store::{ArtifactStore, COMBINED_FILE, CombineResult, Convert};
pub use upload::{HttpTransport, Transport, UploadReport, upload_all};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hit counts for one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCoverage {
    /// Executable line → times executed (`0` = missed).
    pub lines: BTreeMap<u32, u64>,
    /// `"line:arm"` → times taken (`0` = missed).
    pub branches: BTreeMap<String, u64>,
}

impl FileCoverage {
    /// Add `other`'s hit counts into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (line, hits) in &other.lines {
            let entry = self.lines.entry(*line).or_insert(0);
            *entry = entry.saturating_add(*hits);
        }
        for (arm, hits) in &other.branches {
            let entry = self.branches.entry(arm.clone()).or_insert(0);
            *entry = entry.saturating_add(*hits);
        }
    }

    /// Number of executable lines.
    #[must_use]
    pub fn statements(&self) -> usize {
        self.lines.len()
    }

    /// Lines never executed, ascending.
    #[must_use]
    pub fn missed_lines(&self) -> Vec<u32> {
        self.lines
            .iter()
            .filter(|&(_, hits)| *hits == 0)
            .map(|(line, _)| *line)
            .collect()
    }

    /// Number of branch arms never taken.
    #[must_use]
    pub fn missed_branches(&self) -> usize {
        self.branches.values().filter(|h| **h == 0).count()
    }

    /// Whether every line and branch arm was hit.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missed_lines().is_empty() && self.missed_branches() == 0
    }
}

/// Coverage for a whole run or a combination of runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageData {
    /// Source path → hit counts.
    pub files: BTreeMap<String, FileCoverage>,
}

impl CoverageData {
    /// Add `other` into `self`; combining is commutative and associative.
    pub fn merge(&mut self, other: &Self) {
        for (path, file) in &other.files {
            self.files.entry(path.clone()).or_default().merge(file);
        }
    }

    /// Whether no file has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Aggregate counts over all files.
    #[must_use]
    pub fn totals(&self) -> Totals {
        self.files.values().fold(Totals::default(), |acc, f| Totals {
            statements: acc.statements + f.statements(),
            missed: acc.missed + f.missed_lines().len(),
            branches: acc.branches + f.branches.len(),
            missed_branches: acc.missed_branches + f.missed_branches(),
        })
    }
}

/// Aggregate line and branch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    /// Executable lines.
    pub statements: usize,
    /// Lines never executed.
    pub missed: usize,
    /// Branch arms.
    pub branches: usize,
    /// Branch arms never taken.
    pub missed_branches: usize,
}

impl Totals {
    /// Percent of lines and branch arms covered; `100.0` when there is
    /// nothing to cover.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        let total = self.statements + self.branches;
        if total == 0 {
            return 100.0;
        }
        let hit = total - self.missed - self.missed_branches;
        hit as f64 * 100.0 / total as f64
    }
}

/// Compress ascending line numbers into `"3-5, 9"` ranges.
#[must_use]
pub fn line_ranges(lines: &[u32]) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &line in lines {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == line => *end = line,
            _ => ranges.push((line, line)),
        }
    }
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
