//! CI matrix: job expansion, per-job execution, the aggregate gate, trigger
//! filtering and concurrency groups.
mod concurrency;
mod gate;
mod runner;
mod trigger;

pub use concurrency::{GroupGuard, GroupLock};
pub use gate::{Gate, JobOutcome, JobStatus};
pub use runner::{run_job, run_matrix};
pub use trigger::{ConcurrencyPolicy, Event, Trigger, current_branch};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::MatrixConfig;

/// One cell of the matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixJob {
    /// Interpreter version.
    pub interpreter: String,
    /// Environment name.
    pub env: String,
    /// Run with IPv6 disabled.
    #[serde(default)]
    pub noipv6: bool,
    /// Target architecture; empty means the host.
    #[serde(default)]
    pub arch: String,
}

impl MatrixJob {
    /// Stable identifier used in logs and summaries.
    #[must_use]
    pub fn id(&self) -> String {
        let mut id = format!("{}-{}-{}", self.interpreter, self.env, self.arch);
        if self.noipv6 {
            id.push_str("-noipv6");
        }
        id
    }
}

/// Removes jobs from the product; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobFilter {
    /// Interpreter version.
    pub interpreter: Option<String>,
    /// Environment name.
    pub env: Option<String>,
    /// IPv6 mode.
    pub noipv6: Option<bool>,
    /// Architecture.
    pub arch: Option<String>,
}

impl JobFilter {
    /// Whether every set field equals the job's.
    #[must_use]
    pub fn matches(&self, job: &MatrixJob) -> bool {
        self.interpreter.as_ref().is_none_or(|i| *i == job.interpreter)
            && self.env.as_ref().is_none_or(|e| *e == job.env)
            && self.noipv6.is_none_or(|n| n == job.noipv6)
            && self.arch.as_ref().is_none_or(|a| *a == job.arch)
    }
}

/// Expand the axes into jobs in matrix order.
///
/// The product iterates interpreters, then environments, then IPv6 modes,
/// then architectures. Excluded jobs are dropped, `include` jobs are
/// appended, and duplicates keep their first position. An empty `arch` axis
/// (or an include without `arch`) means `host_arch`.
#[must_use]
pub fn expand(config: &MatrixConfig, host_arch: &str) -> Vec<MatrixJob> {
    let host = [host_arch.to_string()];
    let arches: &[String] = if config.arch.is_empty() {
        &host
    } else {
        &config.arch
    };
    let noipv6: &[bool] = if config.noipv6.is_empty() {
        &[false]
    } else {
        &config.noipv6
    };

    let mut product = Vec::new();
    for interpreter in &config.interpreters {
        for env in &config.envs {
            for &ipv6_off in noipv6 {
                for arch in arches {
                    product.push(MatrixJob {
                        interpreter: interpreter.clone(),
                        env: env.clone(),
                        noipv6: ipv6_off,
                        arch: arch.clone(),
                    });
                }
            }
        }
    }
    product.retain(|job| !config.exclude.iter().any(|f| f.matches(job)));

    let includes = config.include.iter().map(|job| {
        let mut job = job.clone();
        if job.arch.is_empty() {
            job.arch = host_arch.to_string();
        }
        job
    });

    let mut seen = HashSet::new();
    product
        .into_iter()
        .chain(includes)
        .filter(|job| seen.insert(job.clone()))
        .collect()
}
