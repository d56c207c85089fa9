//! Summary entries, their status, and the [`Log`] trait.

/// One line of the end-of-command summary: an environment run or a
/// matrix job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    /// Environment name or job id.
    pub name: String,
    /// Final status.
    pub status: EntryStatus,
    /// Optional detail (failing step, skip reason, duration).
    pub message: Option<String>,
}

/// Final status of a summarized run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Every fatal step succeeded.
    Passed,
    /// A fatal step failed or the run could not start.
    Failed,
    /// Not run (ignored trigger, filtered job).
    Skipped,
    /// Printed only, nothing executed.
    DryRun,
    /// Stopped by Ctrl-C, deadline or a superseding run.
    Cancelled,
}

impl EntryStatus {
    /// Whether the entry counts against the command's success.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// Abstraction over logging backends.
///
/// [`Logger`](super::logger::Logger) writes immediately;
/// [`BufferedLog`](super::buffered::BufferedLog) holds output back so that
/// concurrent runs do not interleave on the console.
pub trait Log: Send + Sync {
    /// Log a stage header.
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (console only with `-v`).
    fn debug(&self, msg: &str);
    /// Log a warning.
    fn warn(&self, msg: &str);
    /// Log an error.
    fn error(&self, msg: &str);
    /// Log a step that would run in dry-run mode.
    fn dry_run(&self, msg: &str);
    /// Log one line of child process output.
    fn output(&self, line: &str);
    /// Record a run result for the summary.
    fn record(&self, name: &str, status: EntryStatus, message: Option<&str>);
}
