//! Per-group coordination between CI runs on one machine.
//!
//! Every concurrency group owns two files under the group directory:
//! `<key>.lock`, held by a queued run for its whole duration, and
//! `<key>.owner`, naming the most recent superseding run. Unrelated groups
//! never touch each other's files. A lock whose holder process is gone,
//! or that is older than [`MAX_LOCK_AGE`], is stale and gets removed.
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};

use super::ConcurrencyPolicy;
use crate::engine::CancelToken;
use crate::logging::Log;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// No CI run holds a group this long.
pub const MAX_LOCK_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// Group files for one concurrency key.
#[derive(Debug, Clone)]
pub struct GroupLock {
    lock_path: PathBuf,
    owner_path: PathBuf,
    key: String,
}

impl GroupLock {
    /// Files for `key` under `dir`.
    #[must_use]
    pub fn new(dir: &Path, key: &str) -> Self {
        let file_stem: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        Self {
            lock_path: dir.join(format!("{file_stem}.lock")),
            owner_path: dir.join(format!("{file_stem}.owner")),
            key: key.to_string(),
        }
    }

    /// Enter the group under `policy`.
    ///
    /// `Queue` blocks until no other queued run holds the group.
    /// `CancelInProgress` claims the group at once; a run that held it
    /// notices and cancels its own token.
    ///
    /// # Errors
    ///
    /// Returns an error if the group directory is not writable.
    pub fn enter(
        &self,
        policy: ConcurrencyPolicy,
        cancel: &CancelToken,
        log: &dyn Log,
    ) -> Result<GroupGuard> {
        if let Some(dir) = self.lock_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating group directory {}", dir.display()))?;
        }
        match policy {
            ConcurrencyPolicy::Queue => self.queue(cancel, log),
            ConcurrencyPolicy::CancelInProgress => self.supersede(cancel, log),
        }
    }

    fn queue(&self, cancel: &CancelToken, log: &dyn Log) -> Result<GroupGuard> {
        let mut announced = false;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    // Removes the lock again if the pid cannot be written.
                    let guard = GroupGuard::Queued {
                        lock_path: self.lock_path.clone(),
                    };
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("writing {}", self.lock_path.display()))?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if cancel.is_cancelled() {
                        return Ok(GroupGuard::Abandoned);
                    }
                    if let Some(holder) = self.stale_holder() {
                        log.warn(&format!(
                            "removing stale lock of group {} ({holder})",
                            self.key
                        ));
                        self.remove_if_unchanged(&holder);
                        continue;
                    }
                    if !announced {
                        log.info(&format!(
                            "waiting for the in-flight run of group {}",
                            self.key
                        ));
                        announced = true;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("locking {}", self.lock_path.display()));
                }
            }
        }
    }

    /// Why the current lock is stale, or `None` while its holder is live.
    fn stale_holder(&self) -> Option<String> {
        let contents = fs::read_to_string(&self.lock_path).ok()?;
        let pid = contents.trim();
        if pid.parse::<i32>().is_ok_and(|pid| !process_alive(pid)) {
            return Some(format!("pid {pid} has exited"));
        }
        let age = fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())?;
        (age > MAX_LOCK_AGE).then(|| format!("held for {}s", age.as_secs()))
    }

    fn remove_if_unchanged(&self, holder: &str) {
        if self.stale_holder().as_deref() == Some(holder) {
            let _ = fs::remove_file(&self.lock_path);
        }
    }

    fn supersede(&self, cancel: &CancelToken, log: &dyn Log) -> Result<GroupGuard> {
        let id = owner_id();
        if self.owner_path.exists() {
            log.info(&format!("superseding the in-flight run of group {}", self.key));
        }
        let dir = self.owner_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("claiming group {}", self.key))?;
        tmp.write_all(id.as_bytes())?;
        tmp.persist(&self.owner_path)
            .with_context(|| format!("writing {}", self.owner_path.display()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let stop = Arc::clone(&stop);
            let cancel = cancel.clone();
            let owner_path = self.owner_path.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if fs::read_to_string(&owner_path).is_ok_and(|current| current != id) {
                        tracing::warn!("superseded by a newer run; cancelling");
                        cancel.cancel();
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
        };

        Ok(GroupGuard::Superseding {
            owner_path: self.owner_path.clone(),
            id,
            stop,
            watcher: Some(watcher),
        })
    }
}

/// Membership in a concurrency group, released on drop.
#[derive(Debug)]
pub enum GroupGuard {
    /// Holds the group lock.
    Queued {
        /// Lock file removed on drop.
        lock_path: PathBuf,
    },
    /// Claimed the group; watches for being superseded in turn.
    Superseding {
        /// Owner file, removed on drop if still ours.
        owner_path: PathBuf,
        /// Our owner id.
        id: String,
        /// Stops the watcher.
        stop: Arc<AtomicBool>,
        /// Watcher thread.
        watcher: Option<JoinHandle<()>>,
    },
    /// Cancelled while waiting; holds nothing.
    Abandoned,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        match self {
            Self::Queued { lock_path } => {
                let _ = fs::remove_file(lock_path);
            }
            Self::Superseding {
                owner_path,
                id,
                stop,
                watcher,
            } => {
                stop.store(true, Ordering::Relaxed);
                if let Some(handle) = watcher.take() {
                    let _ = handle.join();
                }
                if fs::read_to_string(&*owner_path).is_ok_and(|current| current == *id) {
                    let _ = fs::remove_file(&*owner_path);
                }
            }
            Self::Abandoned => {}
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    pid > 0 && !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
const fn process_alive(_pid: i32) -> bool {
    true
}

fn owner_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{}-{nanos}", std::process::id())
}
