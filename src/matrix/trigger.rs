use std::path::Path;

use clap::ValueEnum;

/// Event that started a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Event {
    /// Commits pushed to a branch.
    Push,
    /// A pull request opened or updated.
    PullRequest,
}

/// What happens to an in-flight run of the same concurrency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Wait for it to finish.
    Queue,
    /// Cancel it and start immediately.
    CancelInProgress,
}

/// The triggering event and the refs it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Event kind.
    pub event: Event,
    /// Pushed branch, or the pull request's source branch.
    pub branch: String,
    /// Pull request target branch.
    pub base: Option<String>,
}

impl Trigger {
    /// Whether the matrix should run: a push to `primary`, or a pull
    /// request targeting it.
    #[must_use]
    pub fn accepts(&self, primary: &str) -> bool {
        match self.event {
            Event::Push => self.branch == primary,
            Event::PullRequest => self.base.as_deref() == Some(primary),
        }
    }

    /// Runs on the primary branch queue; everything else supersedes.
    #[must_use]
    pub fn policy(&self, primary: &str) -> ConcurrencyPolicy {
        if self.event == Event::Push && self.branch == primary {
            ConcurrencyPolicy::Queue
        } else {
            ConcurrencyPolicy::CancelInProgress
        }
    }

    /// Concurrency group key, `<workflow>-<ref>`.
    #[must_use]
    pub fn group_key(&self, workflow: &str) -> String {
        format!("{workflow}-{}", self.branch)
    }
}

/// Checked-out branch of the repository containing `root`.
///
/// `None` outside a repository or on a detached HEAD.
#[must_use]
pub fn current_branch(root: &Path) -> Option<String> {
    let repo = git2::Repository::discover(root).ok()?;
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(String::from)
}
