use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::cli::{GlobalOpts, MatrixOpts};
use crate::coverage::{ArtifactStore, ToolConverter};
use crate::engine::{CancelToken, Engine, RunOptions};
use crate::exec::SystemExecutor;
use crate::logging::Logger;
use crate::matrix::{GroupLock, Trigger, current_branch, expand, run_matrix};

/// Run the matrix command.
///
/// # Errors
///
/// Returns an error if configuration fails to load, the branch cannot be
/// determined, or the concurrency group cannot be entered.
pub fn run(
    global: &GlobalOpts,
    opts: &MatrixOpts,
    log: &Arc<Logger>,
    cancel: &CancelToken,
) -> Result<i32> {
    if opts.list {
        let setup = super::CommandSetup::load(global)?;
        for job in expand(&setup.config.matrix, &setup.platform.arch) {
            println!("{}", job.id());
        }
        return Ok(0);
    }

    let setup = super::CommandSetup::init(global, &**log)?;
    let config = &setup.config;
    let trigger = trigger(opts, &config.root)?;
    let primary = &config.ci.primary_branch;
    if !trigger.accepts(primary) {
        log.info(&format!(
            "{:?} on '{}' does not target '{primary}', nothing to run",
            trigger.event, trigger.branch
        ));
        return Ok(0);
    }

    let key = trigger.group_key(&config.ci.workflow);
    let _guard = if global.dry_run {
        log.dry_run(&format!("would enter concurrency group {key}"));
        None
    } else {
        let lock = GroupLock::new(&config.groups_dir(), &key);
        Some(lock.enter(trigger.policy(primary), cancel, &**log)?)
    };

    let jobs = expand(&config.matrix, &setup.platform.arch);
    log.stage(&format!("Running {} matrix job(s)", jobs.len()));
    let options = RunOptions {
        dry_run: global.dry_run,
        ..RunOptions::default()
    };
    let executor = SystemExecutor;
    let engine = Engine::new(config, &executor, cancel.clone(), options);
    let gate = run_matrix(&engine, &jobs, super::job_count(global, opts.jobs), log);
    log.print_summary();

    let store = ArtifactStore::new(config.coverage_dir());
    if !global.dry_run && !store.artifacts()?.is_empty() {
        super::coverage::combine(config, &ToolConverter::new(config, &executor), &**log)?;
    }

    if gate.passed() {
        log.info("all matrix jobs passed");
    } else {
        log.error(&format!(
            "{} of {} matrix job(s) failed",
            gate.failures().count(),
            gate.outcomes().len()
        ));
    }
    Ok(gate.exit_code())
}

/// Build the trigger from the command line, falling back to the checked-out
/// branch.
///
/// # Errors
///
/// Returns an error if no branch was given and none is checked out.
pub fn trigger(opts: &MatrixOpts, root: &Path) -> Result<Trigger> {
    let branch = match &opts.branch {
        Some(branch) => branch.clone(),
        None => current_branch(root)
            .context("cannot determine the branch; pass --branch")?,
    };
    Ok(Trigger {
        event: opts.event,
        branch,
        base: opts.base.clone(),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::matrix::{ConcurrencyPolicy, Event};

    fn opts(event: Event, branch: Option<&str>, base: Option<&str>) -> MatrixOpts {
        MatrixOpts {
            jobs: None,
            list: false,
            event,
            branch: branch.map(String::from),
            base: base.map(String::from),
        }
    }

    #[test]
    fn explicit_branch_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let t = trigger(&opts(Event::Push, Some("trunk"), None), dir.path()).unwrap();
        assert_eq!(t.branch, "trunk");
        assert!(t.accepts("trunk"));
        assert_eq!(t.policy("trunk"), ConcurrencyPolicy::Queue);
    }

    #[test]
    fn pull_request_keeps_base() {
        let dir = tempfile::tempdir().unwrap();
        let t = trigger(
            &opts(Event::PullRequest, Some("feature"), Some("trunk")),
            dir.path(),
        )
        .unwrap();
        assert!(t.accepts("trunk"));
        assert_eq!(t.policy("trunk"), ConcurrencyPolicy::CancelInProgress);
        assert_eq!(t.group_key("ci"), "ci-feature");
    }

    #[test]
    fn branch_falls_back_to_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let commit = repo.commit(None, &sig, &sig, "init", &tree, &[]).unwrap();
        let commit = repo.find_commit(commit).unwrap();
        repo.branch("topic", &commit, false).unwrap();
        repo.set_head("refs/heads/topic").unwrap();

        let t = trigger(&opts(Event::Push, None, None), dir.path()).unwrap();
        assert_eq!(t.branch, "topic");
        assert!(!t.accepts("trunk"));
    }
}
