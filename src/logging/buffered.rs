//! Per-run buffered logger for concurrent environment runs.
use std::sync::{Arc, Mutex, PoisonError};

use super::logger::Logger;
use super::subscriber::EventKind;
use super::types::{EntryStatus, Log};

/// Holds one run's output in memory and replays it in one block when the
/// run finishes, so concurrent runs never interleave line by line.
///
/// Replayed events carry the run name; summary records go straight to the
/// backing [`Logger`].
#[derive(Debug)]
pub struct BufferedLog {
    inner: Arc<Logger>,
    run: String,
    held: Mutex<Vec<(EventKind, String)>>,
}

impl BufferedLog {
    /// Create a buffer for the run named `run`, backed by `inner`.
    #[must_use]
    pub fn new(inner: Arc<Logger>, run: &str) -> Self {
        Self {
            inner,
            run: run.to_string(),
            held: Mutex::new(Vec::new()),
        }
    }

    fn hold(&self, kind: EventKind, msg: &str) {
        if let Ok(mut held) = self.held.lock() {
            held.push((kind, msg.to_string()));
        }
    }

    fn replay(&self) {
        let held = match self.held.lock() {
            Ok(mut held) => std::mem::take(&mut *held),
            Err(_) => return,
        };
        for (kind, msg) in &held {
            kind.emit(msg, Some(&self.run));
        }
    }

    /// Replay the buffer under the logger's flush lock and drop this run
    /// from the progress line.
    pub fn flush_and_complete(&self) {
        let _guard = self
            .inner
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.clear_progress();
        self.replay();
        let remaining = self.inner.active_runs.lock().ok().and_then(|mut active| {
            active.retain(|name| *name != self.run);
            (!active.is_empty()).then(|| active.join(", "))
        });
        if let Some(names) = remaining {
            self.inner.draw_progress(&names);
        }
    }
}

impl Log for BufferedLog {
    fn stage(&self, msg: &str) {
        self.hold(EventKind::Stage, msg);
    }

    fn info(&self, msg: &str) {
        self.hold(EventKind::Info, msg);
    }

    fn debug(&self, msg: &str) {
        self.hold(EventKind::Debug, msg);
    }

    fn warn(&self, msg: &str) {
        self.hold(EventKind::Warn, msg);
    }

    fn error(&self, msg: &str) {
        self.hold(EventKind::Error, msg);
    }

    fn dry_run(&self, msg: &str) {
        self.hold(EventKind::DryRun, msg);
    }

    fn output(&self, line: &str) {
        self.hold(EventKind::Output, line);
    }

    fn record(&self, name: &str, status: EntryStatus, message: Option<&str>) {
        self.inner.record(name, status, message);
    }
}
