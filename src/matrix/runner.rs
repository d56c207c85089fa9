use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Gate, JobOutcome, JobStatus, MatrixJob};
use crate::engine::{Engine, JobContext, RunStatus, run_bounded};
use crate::environment::resolve;
use crate::error::ConfigError;
use crate::exec::Invocation;
use crate::logging::{Log, Logger};
use crate::template::{self, Vars};

/// Exit code recorded when the emulation command could not be started.
const EXIT_SPAWN_FAILED: i32 = 127;

/// Run every job with at most `jobs` in flight and gate on the results.
///
/// A failing job never stops the others. Host jobs with IPv6 disabled run
/// as a second batch between the `noipv6_hooks` disable and restore
/// commands, so the host change never overlaps the other jobs. Outcomes
/// keep matrix order.
pub fn run_matrix(
    engine: &Engine<'_>,
    matrix: &[MatrixJob],
    jobs: usize,
    log: &Arc<Logger>,
) -> Gate {
    let run = |batch: &[MatrixJob]| {
        run_bounded(batch, jobs, log, MatrixJob::id, |job, log| {
            let outcome = run_job(engine, job, log);
            record(&outcome, log);
            outcome
        })
    };

    let (hosted, others): (Vec<MatrixJob>, Vec<MatrixJob>) = matrix
        .iter()
        .cloned()
        .partition(|job| job.noipv6 && engine.platform().is_native_arch(&job.arch));
    let mut outcomes = run(&others);
    if !hosted.is_empty() {
        outcomes.extend(without_ipv6(engine, &hosted, &**log, &run));
    }
    outcomes.sort_by_key(|o| matrix.iter().position(|job| *job == o.job));
    Gate::new(outcomes)
}

fn record(outcome: &JobOutcome, log: &dyn Log) {
    let (status, detail) = outcome.status.summary();
    log.record(&outcome.job.id(), status, detail.as_deref());
}

fn without_ipv6(
    engine: &Engine<'_>,
    batch: &[MatrixJob],
    log: &dyn Log,
    run: &dyn Fn(&[MatrixJob]) -> Vec<JobOutcome>,
) -> Vec<JobOutcome> {
    let hooks = &engine.config().matrix.noipv6_hooks;
    if engine.options().dry_run {
        for argv in &hooks.disable {
            log.dry_run(&format!("disable-ipv6: {}", argv.join(" ")));
        }
        return run(batch);
    }

    let outcomes = match run_hooks(engine, &hooks.disable, "disable-ipv6", log) {
        Ok(()) => run(batch),
        Err(status) => batch
            .iter()
            .map(|job| {
                let outcome = JobOutcome {
                    job: job.clone(),
                    status: status.clone(),
                    duration: Duration::ZERO,
                };
                record(&outcome, log);
                outcome
            })
            .collect(),
    };
    if let Err(status) = run_hooks(engine, &hooks.restore, "restore-ipv6", log) {
        log.warn(&format!("IPv6 not restored (exit {})", status.exit_code()));
    }
    outcomes
}

/// Run host commands in order, stopping at the first failure.
fn run_hooks(
    engine: &Engine<'_>,
    commands: &[Vec<String>],
    label: &str,
    log: &dyn Log,
) -> Result<(), JobStatus> {
    let root = &engine.config().root;
    for argv in commands {
        let Some(invocation) = Invocation::from_argv(argv, root, engine.system_env().clone())
        else {
            continue;
        };
        log.info(&format!("{label}> {}", invocation.display()));
        let failed = |code| JobStatus::Failed {
            code,
            detail: label.to_string(),
        };
        match engine
            .executor()
            .execute(&invocation, engine.cancel_token(), &|line| log.output(line))
        {
            Ok(result) if result.cancelled => return Err(JobStatus::Cancelled),
            Ok(result) if !result.success => {
                log.error(&format!("{label} failed: {}", invocation.display()));
                return Err(failed(result.exit_code()));
            }
            Ok(_) => {}
            Err(e) => {
                log.error(&format!("{label}: {e:#}"));
                return Err(failed(EXIT_SPAWN_FAILED));
            }
        }
    }
    Ok(())
}

/// Run one job: in-process on the host architecture, otherwise through the
/// configured emulation command.
pub fn run_job(engine: &Engine<'_>, job: &MatrixJob, log: &dyn Log) -> JobOutcome {
    let start = Instant::now();
    let status = if engine.cancel_token().is_cancelled() {
        JobStatus::Cancelled
    } else if engine.platform().is_native_arch(&job.arch) {
        run_native(engine, job, log)
    } else {
        run_emulated(engine, job, log)
    };
    JobOutcome {
        job: job.clone(),
        status,
        duration: start.elapsed(),
    }
}

fn job_vars(job: &MatrixJob) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("MATRIX_INTERPRETER".to_string(), job.interpreter.clone()),
        ("MATRIX_NOIPV6".to_string(), job.noipv6.to_string()),
        ("MATRIX_ARCH".to_string(), job.arch.clone()),
    ])
}

fn config_failure(err: &ConfigError, log: &dyn Log) -> JobStatus {
    log.error(&err.to_string());
    JobStatus::Config(format!("{}: {err}", err.kind()))
}

fn run_native(engine: &Engine<'_>, job: &MatrixJob, log: &dyn Log) -> JobStatus {
    let config = engine.config();
    let env = match resolve(&job.env, &config.base, &config.registry) {
        Ok(env) => env,
        Err(e) => return config_failure(&e, log),
    };
    let context = JobContext {
        vars: job_vars(job),
        interpreter: job.interpreter.clone(),
        noipv6: job.noipv6,
    };
    match engine.run_with(&env, &context, log) {
        Ok(outcome) if outcome.dry_run => JobStatus::DryRun,
        Ok(outcome) => match outcome.status {
            RunStatus::Passed => JobStatus::Passed,
            RunStatus::Failed { step, code } => JobStatus::Failed { code, detail: step },
            RunStatus::Cancelled { .. } => JobStatus::Cancelled,
        },
        Err(e) => match e.downcast_ref::<ConfigError>() {
            Some(config_err) => config_failure(config_err, log),
            None => {
                log.error(&format!("{e:#}"));
                JobStatus::Failed {
                    code: 1,
                    detail: format!("{e:#}"),
                }
            }
        },
    }
}

fn run_emulated(engine: &Engine<'_>, job: &MatrixJob, log: &dyn Log) -> JobStatus {
    let config = engine.config();
    let emulation = &config.matrix.emulation;
    let axes = Vars::new()
        .with("interpreter", job.interpreter.as_str())
        .with("arch", job.arch.as_str());
    let image = template::expand(&emulation.image, &axes);
    let vars = axes
        .with("root", config.root.display().to_string())
        .with("noipv6", job.noipv6.to_string())
        .with("image", image)
        .with("env_name", job.env.as_str());
    let argv = template::expand_argv(&emulation.command, &vars);

    let mut env = engine.system_env().clone();
    env.extend(job_vars(job));
    let Some(mut invocation) = Invocation::from_argv(&argv, &config.root, env) else {
        log.error(&format!("no emulation command configured for arch {}", job.arch));
        return JobStatus::Config(format!("no emulation command for arch {}", job.arch));
    };

    if engine.options().dry_run {
        log.dry_run(&format!("{}: {}", job.id(), invocation.display()));
        return JobStatus::DryRun;
    }
    if !engine
        .executor()
        .which(&invocation.program, &invocation.env, &config.root)
    {
        let err = ConfigError::MissingTool {
            tool: invocation.program.clone(),
            env: job.env.clone(),
        };
        return config_failure(&err, log);
    }

    log.stage(&format!("{} (emulated {})", job.env, job.arch));
    log.info(&format!("emulate> {}", invocation.display()));
    invocation.deadline = engine.options().timeout.map(|t| Instant::now() + t);
    let result = match engine
        .executor()
        .execute(&invocation, engine.cancel_token(), &|line| log.output(line))
    {
        Ok(result) => result,
        Err(e) => {
            log.error(&format!("{e:#}"));
            return JobStatus::Failed {
                code: EXIT_SPAWN_FAILED,
                detail: "emulation".to_string(),
            };
        }
    };

    if result.cancelled {
        JobStatus::Cancelled
    } else if result.success {
        JobStatus::Passed
    } else {
        JobStatus::Failed {
            code: result.exit_code(),
            detail: "emulation".to_string(),
        }
    }
}
