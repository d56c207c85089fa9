use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::{GlobalOpts, RunOpts};
use crate::config::Config;
use crate::coverage::ToolConverter;
use crate::engine::{CancelToken, Engine, RunOptions, RunOutcome, run_all};
use crate::environment::{ResolvedEnvironment, resolve_all};
use crate::error::{ConfigError, EXIT_CONFIG};
use crate::exec::SystemExecutor;
use crate::logging::Logger;

/// Run the run command.
///
/// # Errors
///
/// Returns an error if configuration fails to load, no environment was
/// requested, any requested name does not resolve, or any program is
/// missing. In the last two cases nothing is run.
pub fn run(
    global: &GlobalOpts,
    opts: &RunOpts,
    log: &Arc<Logger>,
    cancel: &CancelToken,
) -> Result<i32> {
    let setup = super::CommandSetup::init(global, &**log)?;
    let names = if opts.envs.is_empty() {
        setup.config.envlist.clone()
    } else {
        opts.envs.clone()
    };
    if names.is_empty() {
        bail!("no environments requested and the configuration has no envlist");
    }
    let envs = resolve_all(&names, &setup.config.base, &setup.config.registry)?;

    let options = RunOptions {
        posargs: (!opts.posargs.is_empty()).then(|| opts.posargs.clone()),
        keep_workdir: opts.keep_workdir,
        hermetic: opts.hermetic,
        timeout: opts.timeout.map(Duration::from_secs),
        dry_run: global.dry_run,
    };
    let executor = SystemExecutor;
    let engine = Engine::new(&setup.config, &executor, cancel.clone(), options);
    let jobs = super::job_count(global, opts.jobs);

    log.stage(&format!("Running {} environment(s)", envs.len()));
    let results = run_all(&engine, &envs, jobs, log)?;
    log.print_summary();

    if should_combine(&setup.config, &envs, opts, global.dry_run) {
        super::coverage::combine(
            &setup.config,
            &ToolConverter::new(&setup.config, &executor),
            &**log,
        )?;
    }
    Ok(exit_code(&results))
}

/// Whether pending coverage artifacts should be merged after the runs.
fn should_combine(
    config: &Config,
    envs: &[ResolvedEnvironment],
    opts: &RunOpts,
    dry_run: bool,
) -> bool {
    !opts.no_combine && !dry_run && envs.iter().any(|e| e.coverage) && config.coverage_dir().is_dir()
}

/// Exit code of a batch: the first non-zero result in request order.
#[must_use]
pub fn exit_code(results: &[Result<RunOutcome>]) -> i32 {
    results
        .iter()
        .map(|result| match result {
            Ok(outcome) => outcome.status.exit_code(),
            Err(e) if e.downcast_ref::<ConfigError>().is_some() => i32::from(EXIT_CONFIG),
            Err(_) => 1,
        })
        .find(|code| *code != 0)
        .unwrap_or(0)
}
