use std::time::Duration;

use super::MatrixJob;
use crate::error::{EXIT_CANCELLED, EXIT_CONFIG};
use crate::logging::EntryStatus;

/// How one matrix job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Every fatal step succeeded.
    Passed,
    /// Steps were printed, not executed.
    DryRun,
    /// A step (or the emulation command) failed with this code.
    Failed {
        /// Exit code, kept verbatim.
        code: i32,
        /// What failed.
        detail: String,
    },
    /// Cancelled by the user or superseded by a newer run.
    Cancelled,
    /// The job could not start: bad environment name, missing tool.
    Config(String),
}

impl JobStatus {
    /// Process exit code for this status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed | Self::DryRun => 0,
            Self::Failed { code, .. } => *code,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Config(_) => i32::from(EXIT_CONFIG),
        }
    }

    /// Whether the job counts as passed for the gate.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Passed | Self::DryRun)
    }

    /// Summary status and detail for the logger.
    #[must_use]
    pub fn summary(&self) -> (EntryStatus, Option<String>) {
        match self {
            Self::Passed => (EntryStatus::Passed, None),
            Self::DryRun => (EntryStatus::DryRun, None),
            Self::Failed { code, detail } => {
                (EntryStatus::Failed, Some(format!("{detail} (exit {code})")))
            }
            Self::Cancelled => (EntryStatus::Cancelled, None),
            Self::Config(message) => (EntryStatus::Failed, Some(message.clone())),
        }
    }
}

/// One finished job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The job.
    pub job: MatrixJob,
    /// How it ended.
    pub status: JobStatus,
    /// Wall-clock time.
    pub duration: Duration,
}

/// Aggregate of every job, in matrix order.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    outcomes: Vec<JobOutcome>,
}

impl Gate {
    /// Build the gate from outcomes in matrix order.
    #[must_use]
    pub const fn new(outcomes: Vec<JobOutcome>) -> Self {
        Self { outcomes }
    }

    /// Every outcome.
    #[must_use]
    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    /// Passes iff every job passed. An empty matrix passes.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    /// Jobs that did not pass.
    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    /// Exit code of the first failing job in matrix order, or `0`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.failures().next().map_or(0, |o| o.status.exit_code())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn outcome(env: &str, status: JobStatus) -> JobOutcome {
        JobOutcome {
            job: MatrixJob {
                interpreter: "3.12".into(),
                env: env.into(),
                noipv6: false,
                arch: "x86_64".into(),
            },
            status,
            duration: Duration::ZERO,
        }
    }

    fn failed(code: i32) -> JobStatus {
        JobStatus::Failed {
            code,
            detail: "test-run".into(),
        }
    }

    #[test]
    fn all_passed_gate_passes() {
        let gate = Gate::new(vec![
            outcome("a", JobStatus::Passed),
            outcome("b", JobStatus::DryRun),
        ]);
        assert!(gate.passed());
        assert_eq!(gate.exit_code(), 0);
    }

    #[test]
    fn first_failure_in_matrix_order_sets_the_code() {
        let gate = Gate::new(vec![
            outcome("a", JobStatus::Passed),
            outcome("b", failed(4)),
            outcome("c", failed(9)),
        ]);
        assert!(!gate.passed());
        assert_eq!(gate.exit_code(), 4);
        assert_eq!(gate.failures().count(), 2);
    }

    #[test]
    fn cancelled_and_config_codes() {
        assert_eq!(
            Gate::new(vec![outcome("a", JobStatus::Cancelled)]).exit_code(),
            130
        );
        assert_eq!(
            Gate::new(vec![outcome("a", JobStatus::Config("unknown factor".into()))]).exit_code(),
            78
        );
    }

    #[test]
    fn empty_gate_passes() {
        assert!(Gate::default().passed());
    }
}
