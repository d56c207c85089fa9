//! Console and file logger with summary collection.
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use super::subscriber::EventKind;
use super::types::{EntryStatus, Log, SummaryEntry};
use super::utils::{log_file_path, terminal_columns};

/// Forward the `fn(&self, &str)` methods of [`Log`] to inherent methods of
/// the same name.
macro_rules! forward_log_methods {
    ($($method:ident),+ $(,)?) => {
        $(
            fn $method(&self, msg: &str) {
                self.$method(msg);
            }
        )+
    };
}

/// Logger that emits through [`tracing`] and collects one summary entry
/// per run.
///
/// Every event also lands in `$XDG_CACHE_HOME/envmatrix/<command>.log`
/// (see [`init_subscriber`](super::subscriber::init_subscriber)).
#[derive(Debug)]
pub struct Logger {
    entries: Mutex<Vec<SummaryEntry>>,
    log_file: Option<PathBuf>,
    /// Serializes console replay of buffered runs.
    pub(super) flush_lock: Mutex<()>,
    /// Names of runs currently executing.
    pub(super) active_runs: Mutex<Vec<String>>,
    /// `1` while a progress line is on screen, else `0`.
    pub(super) progress_rows: Mutex<u16>,
}

impl Logger {
    /// Create a logger for `command`.
    ///
    /// Only remembers the log file path for the summary; the file itself is
    /// opened by the subscriber.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            log_file: log_file_path(command),
            flush_lock: Mutex::new(()),
            active_runs: Mutex::new(Vec::new()),
            progress_rows: Mutex::new(0),
        }
    }

    /// Return the log file path, if available.
    #[cfg(test)]
    pub const fn log_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    /// Snapshot of the recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<SummaryEntry> {
        self.entries.lock().map_or_else(|_| vec![], |g| g.clone())
    }

    #[cfg(test)]
    pub(crate) fn progress_rows_count(&self) -> u16 {
        *self
            .progress_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Log an error message.
    pub fn error(&self, msg: &str) {
        EventKind::Error.emit(msg, None);
    }

    /// Log a warning message.
    pub fn warn(&self, msg: &str) {
        EventKind::Warn.emit(msg, None);
    }

    /// Log a stage header.
    pub fn stage(&self, msg: &str) {
        EventKind::Stage.emit(msg, None);
    }

    /// Log an informational message.
    pub fn info(&self, msg: &str) {
        EventKind::Info.emit(msg, None);
    }

    /// Log a debug message.
    pub fn debug(&self, msg: &str) {
        EventKind::Debug.emit(msg, None);
    }

    /// Log a dry-run message.
    pub fn dry_run(&self, msg: &str) {
        EventKind::DryRun.emit(msg, None);
    }

    /// Log a line of child output.
    pub fn output(&self, line: &str) {
        EventKind::Output.emit(line, None);
    }

    /// Record a run result for the summary.
    pub fn record(&self, name: &str, status: EntryStatus, message: Option<&str>) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push(SummaryEntry {
                name: name.to_string(),
                status,
                message: message.map(String::from),
            });
        }
    }

    /// Number of failed or cancelled entries.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.entries.lock().map_or(0, |guard| {
            guard.iter().filter(|e| e.status.is_failure()).count()
        })
    }

    /// Print the summary of all recorded runs.
    pub fn print_summary(&self) {
        let entries = self.entries();
        if entries.is_empty() {
            return;
        }

        println!();
        self.stage("Summary");

        let (mut passed, mut failed, mut skipped, mut dry_run, mut cancelled) = (0u32, 0u32, 0u32, 0u32, 0u32);
        for entry in &entries {
            let (icon, color) = match entry.status {
                EntryStatus::Passed => {
                    passed += 1;
                    ("✓", "\x1b[32m")
                }
                EntryStatus::Failed => {
                    failed += 1;
                    ("✗", "\x1b[31m")
                }
                EntryStatus::Skipped => {
                    skipped += 1;
                    ("○", "\x1b[33m")
                }
                EntryStatus::DryRun => {
                    dry_run += 1;
                    ("~", "\x1b[37m")
                }
                EntryStatus::Cancelled => {
                    cancelled += 1;
                    ("⊘", "\x1b[35m")
                }
            };
            let suffix = entry
                .message
                .as_ref()
                .map_or_else(String::new, |msg| format!(" ({msg})"));
            self.info(&format!("{color}{icon} {}{suffix}\x1b[0m", entry.name));
        }

        println!();
        let total = entries.len();
        self.info(&format!(
            "{total} runs: \x1b[32m{passed} passed\x1b[0m, \x1b[31m{failed} failed\x1b[0m, \x1b[35m{cancelled} cancelled\x1b[0m, \x1b[33m{skipped} skipped\x1b[0m, \x1b[37m{dry_run} dry-run\x1b[0m"
        ));
        if let Some(path) = &self.log_file {
            self.info(&format!("\x1b[2mlog: {}\x1b[0m", path.display()));
        }
    }

    /// Erase the progress line. Caller holds `flush_lock`.
    pub(super) fn clear_progress(&self) {
        let mut guard = self
            .progress_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *guard > 0 {
            print!("\r\x1b[K");
            std::io::stdout().flush().ok();
            *guard = 0;
        }
    }

    /// Draw a single-row progress line listing active runs. Caller holds
    /// `flush_lock`.
    pub(super) fn draw_progress(&self, names: &str) {
        let max_chars = terminal_columns().saturating_sub(4);
        let shown = if names.chars().count() > max_chars {
            let head: String = names.chars().take(max_chars.saturating_sub(1)).collect();
            format!("{head}…")
        } else {
            names.to_string()
        };
        print!("  \x1b[2m▹ {shown}\x1b[0m");
        std::io::stdout().flush().ok();
        *self
            .progress_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = 1;
    }

    /// Mark a concurrent run as started and redraw the progress line.
    pub fn notify_run_start(&self, name: &str) {
        let _guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.clear_progress();
        let names = self.active_runs.lock().map_or_else(
            |_| name.to_string(),
            |mut active| {
                active.push(name.to_string());
                active.join(", ")
            },
        );
        self.draw_progress(&names);
    }
}

impl Log for Logger {
    forward_log_methods!(stage, info, debug, warn, error, dry_run, output);

    fn record(&self, name: &str, status: EntryStatus, message: Option<&str>) {
        self.record(name, status, message);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::logging::isolated_logger;
    use std::fs;

    fn log_contents(log: &Logger) -> String {
        fs::read_to_string(log.log_path().expect("log path")).unwrap()
    }

    #[test]
    fn starts_without_entries() {
        let (log, _tmp, _guard) = isolated_logger();
        assert!(log.entries().is_empty());
        assert_eq!(log.failure_count(), 0);
    }

    #[test]
    fn record_keeps_order_and_message() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record("lint", EntryStatus::Passed, None);
        log.record("alldeps-withcov-posix", EntryStatus::Failed, Some("test-run exited 2"));
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "lint");
        assert_eq!(entries[1].message.as_deref(), Some("test-run exited 2"));
    }

    #[test]
    fn failure_count_includes_cancelled() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record("a", EntryStatus::Passed, None);
        log.record("b", EntryStatus::Failed, None);
        log.record("c", EntryStatus::Cancelled, None);
        log.record("d", EntryStatus::Skipped, None);
        assert_eq!(log.failure_count(), 2);
    }

    #[test]
    fn log_trait_delegates_to_logger() {
        let (log, _tmp, _guard) = isolated_logger();
        let log_ref: &dyn Log = &log;
        log_ref.record("via-trait", EntryStatus::Passed, None);
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn log_file_is_created() {
        let (log, _tmp, _guard) = isolated_logger();
        assert!(log.log_path().expect("log path").exists());
    }

    #[test]
    fn levels_are_tagged_in_file() {
        let (log, _tmp, _guard) = isolated_logger();
        let pid = std::process::id();
        log.stage(&format!("stage-{pid}"));
        log.warn(&format!("warn-{pid}"));
        log.error(&format!("error-{pid}"));
        log.debug(&format!("debug-{pid}"));
        log.dry_run(&format!("dry-{pid}"));
        let contents = log_contents(&log);
        assert!(contents.contains(&format!("==> stage-{pid}")));
        assert!(contents.contains(&format!("[warn] warn-{pid}")));
        assert!(contents.contains(&format!("[error] error-{pid}")));
        assert!(contents.contains(&format!("[debug] debug-{pid}")));
        assert!(contents.contains(&format!("[dry run] dry-{pid}")));
    }

    #[test]
    fn output_lines_are_marked_in_file() {
        let (log, _tmp, _guard) = isolated_logger();
        let marker = format!("child-output-{}", std::process::id());
        log.output(&marker);
        assert!(log_contents(&log).contains(&format!("| {marker}")));
    }

    #[test]
    fn notify_run_start_shows_progress() {
        let (log, _tmp, _guard) = isolated_logger();
        assert_eq!(log.progress_rows_count(), 0);
        log.notify_run_start("lint");
        assert_eq!(log.progress_rows_count(), 1);
        assert!(log.active_runs.lock().unwrap().contains(&"lint".to_string()));
    }

    #[test]
    fn long_progress_line_stays_one_row() {
        let (log, _tmp, _guard) = isolated_logger();
        log.draw_progress(&"a".repeat(500));
        assert_eq!(log.progress_rows_count(), 1);
    }
}
