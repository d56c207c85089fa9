//! Bounded-parallel execution of independent runs.
use std::sync::Arc;

use anyhow::Result;

use super::{Engine, RunOutcome};
use crate::environment::ResolvedEnvironment;
use crate::error::ConfigError;
use crate::logging::{BufferedLog, EntryStatus, Log, Logger};

/// Run `work` over `items` on at most `jobs` threads.
///
/// Each item logs into its own [`BufferedLog`], replayed as one block when
/// the item finishes. Results come back in input order. With one job or one
/// item everything runs on the calling thread against `log` directly.
pub fn run_bounded<T, R>(
    items: &[T],
    jobs: usize,
    log: &Arc<Logger>,
    name: impl Fn(&T) -> String + Sync,
    work: impl Fn(&T, &dyn Log) -> R + Sync,
) -> Vec<R>
where
    T: Sync,
    R: Send,
{
    use rayon::prelude::*;

    let available = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let threads = jobs.min(available).min(items.len()).max(1);

    let sequential = || -> Vec<R> {
        items
            .iter()
            .map(|item| work(item, &**log))
            .collect()
    };
    if threads == 1 {
        return sequential();
    }

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool,
        Err(e) => {
            log.warn(&format!("thread pool unavailable ({e}), running sequentially"));
            return sequential();
        }
    };
    log.debug(&format!("running {} item(s) on {threads} threads", items.len()));

    pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                let item_name = name(item);
                log.notify_run_start(&item_name);
                let buffered = BufferedLog::new(Arc::clone(log), &item_name);
                let result = work(item, &buffered);
                buffered.flush_and_complete();
                result
            })
            .collect()
    })
}

/// Run every environment and record one summary entry each.
///
/// Every environment's programs are checked before the first process
/// starts. A run that still cannot start (unusable workspace) is recorded
/// as failed and returned as an error in its slot; the others still run.
///
/// # Errors
///
/// Returns [`ConfigError::MissingTool`] when any environment needs a
/// program that is not on `PATH`; nothing runs in that case.
pub fn run_all(
    engine: &Engine<'_>,
    envs: &[ResolvedEnvironment],
    jobs: usize,
    log: &Arc<Logger>,
) -> Result<Vec<Result<RunOutcome>>, ConfigError> {
    if !engine.options().dry_run
        && let Err(e) = engine.preflight_all(envs)
    {
        if let ConfigError::MissingTool { env, .. } = &e {
            let detail = format!("{}: {e}", e.kind());
            log.error(&format!("{env}: {detail}"));
            log.record(env, EntryStatus::Failed, Some(detail.as_str()));
        }
        return Err(e);
    }
    Ok(run_bounded(
        envs,
        jobs,
        log,
        |env| env.name.clone(),
        |env, log| {
            let result = engine.run(env, log);
            match &result {
                Ok(outcome) => {
                    let (status, detail) = outcome.summary();
                    log.record(&outcome.env, status, Some(detail.as_str()));
                }
                Err(e) => {
                    let detail = e
                        .downcast_ref::<ConfigError>()
                        .map_or_else(|| format!("{e:#}"), |c| format!("{}: {c}", c.kind()));
                    log.error(&format!("{}: {detail}", env.name));
                    log.record(&env.name, EntryStatus::Failed, Some(detail.as_str()));
                }
            }
            result
        },
    ))
}
