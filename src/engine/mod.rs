//! Runs pipelines: one at a time in an isolated workspace, or many with
//! bounded parallelism.
mod cancel;
mod parallel;
mod process_env;
mod workspace;

pub use cancel::CancelToken;
pub use parallel::{run_all, run_bounded};
pub use workspace::Workspace;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use sha2::{Digest as _, Sha256};

use crate::config::Config;
use crate::coverage::ArtifactStore;
use crate::environment::ResolvedEnvironment;
use crate::error::{ConfigError, EXIT_CANCELLED};
use crate::exec::{ExecResult, Executor, Invocation};
use crate::logging::{EntryStatus, Log};
use crate::pipeline::{self, Pipeline, Step, StepPolicy};
use crate::platform::Platform;
use crate::template::Vars;

/// Exit code recorded when a step's program could not be started.
const EXIT_SPAWN_FAILED: i32 = 127;

/// Per-invocation run settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Positional arguments for `{posargs}`; `None` uses defaults.
    pub posargs: Option<Vec<String>>,
    /// Keep the working directory after the run.
    pub keep_workdir: bool,
    /// Forward only allow-listed caller variables.
    pub hermetic: bool,
    /// Per-run time limit.
    pub timeout: Option<Duration>,
    /// Print expanded steps without executing them.
    pub dry_run: bool,
}

/// Matrix coordinates a run executes under.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    /// Variables layered over the caller's environment.
    pub vars: BTreeMap<String, String>,
    /// `{interpreter}`: version suffix for interpreter commands; empty
    /// outside the matrix.
    pub interpreter: String,
    /// `{noipv6}`.
    pub noipv6: bool,
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Exited zero.
    Passed,
    /// Exited non-zero (or could not start) with this code.
    Failed(i32),
    /// Not applicable on this platform.
    Skipped,
    /// Printed only.
    DryRun,
    /// Killed by cancellation or deadline.
    Cancelled,
}

/// Record of an executed (or skipped) step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Step name.
    pub name: String,
    /// Failure policy the step ran under.
    pub policy: StepPolicy,
    /// What happened.
    pub state: StepState,
    /// Wall-clock time.
    pub duration: Duration,
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every fatal step succeeded.
    Passed,
    /// A fatal step failed; its exit code is kept verbatim.
    Failed {
        /// Failing step.
        step: String,
        /// Its exit code.
        code: i32,
    },
    /// Cancelled before or during `step`.
    Cancelled {
        /// Step that was running or about to run.
        step: String,
    },
}

impl RunStatus {
    /// Process exit code for this status.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed { code, .. } => *code,
            Self::Cancelled { .. } => EXIT_CANCELLED,
        }
    }

    /// Whether the run passed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Environment name.
    pub env: String,
    /// Unique run id.
    pub run_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Step records in execution order.
    pub steps: Vec<StepRecord>,
    /// Total duration.
    pub duration: Duration,
    /// Coverage data files the run left under its reserved artifact name.
    pub artifacts: Vec<PathBuf>,
    /// Working directory, when retained.
    pub workdir: Option<PathBuf>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl RunOutcome {
    /// Summary status and detail for the logger.
    #[must_use]
    pub fn summary(&self) -> (EntryStatus, String) {
        let secs = self.duration.as_secs_f64();
        match &self.status {
            _ if self.dry_run => (EntryStatus::DryRun, format!("{} steps", self.steps.len())),
            RunStatus::Passed => (EntryStatus::Passed, format!("{secs:.1}s")),
            RunStatus::Failed { step, code } => {
                (EntryStatus::Failed, format!("{step} exited {code}, {secs:.1}s"))
            }
            RunStatus::Cancelled { step } => (EntryStatus::Cancelled, format!("cancelled in {step}")),
        }
    }
}

/// Executes resolved environments against one configuration.
#[derive(Debug)]
pub struct Engine<'a> {
    config: &'a Config,
    executor: &'a dyn Executor,
    cancel: CancelToken,
    options: RunOptions,
    platform: Platform,
    system_env: BTreeMap<String, String>,
}

impl<'a> Engine<'a> {
    /// Create an engine for the host platform and the current process
    /// environment.
    #[must_use]
    pub fn new(
        config: &'a Config,
        executor: &'a dyn Executor,
        cancel: CancelToken,
        options: RunOptions,
    ) -> Self {
        let system_env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self {
            config,
            executor,
            cancel,
            options,
            platform: Platform::detect(),
            system_env,
        }
    }

    /// Replace the caller environment seen by runs.
    #[must_use]
    pub fn with_system_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.system_env = env;
        self
    }

    /// Pretend to run on `platform`.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// The configuration runs are executed against.
    #[must_use]
    pub const fn config(&self) -> &Config {
        self.config
    }

    /// The executor used for every step.
    #[must_use]
    pub const fn executor(&self) -> &dyn Executor {
        self.executor
    }

    /// Cancellation token shared by every run.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Host platform.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Run settings.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Caller environment seen by runs.
    #[must_use]
    pub const fn system_env(&self) -> &BTreeMap<String, String> {
        &self.system_env
    }

    /// Run one environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTool`] before any step starts when a
    /// program is not on `PATH`, or an I/O error when the workspace cannot be
    /// prepared. Step failures are reported in [`RunOutcome::status`].
    pub fn run(&self, env: &ResolvedEnvironment, log: &dyn Log) -> Result<RunOutcome> {
        self.run_with(env, &JobContext::default(), log)
    }

    /// Check the programs of every environment before any of them starts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTool`] for the first program, in
    /// request order, that is not on `PATH`.
    pub fn preflight_all(&self, envs: &[ResolvedEnvironment]) -> Result<(), ConfigError> {
        let job = JobContext::default();
        let scratch = self.config.workdir.clone().unwrap_or_else(std::env::temp_dir);
        for env in envs {
            let pipeline = pipeline::build(env);
            let named = self.named_vars(env, &job, &scratch, &scratch.join("tmp"), "preflight", None);
            let process_env = self.process_env(env, &job, &named, BTreeMap::new());
            let planned = self.plan(&pipeline, &named, &process_env);
            self.preflight(env, &planned, &process_env, &scratch)?;
        }
        Ok(())
    }

    /// Run one environment as a matrix job: `job` adds variables over the
    /// caller's environment and fills the axis placeholders.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_with(
        &self,
        env: &ResolvedEnvironment,
        job: &JobContext,
        log: &dyn Log,
    ) -> Result<RunOutcome> {
        let start = Instant::now();
        let run_id = new_run_id(&env.name);
        let pipeline = pipeline::build(env);
        let dry_run = self.options.dry_run;

        let store = ArtifactStore::new(self.config.coverage_dir());
        let artifact = if env.coverage && !dry_run {
            Some(store.allocate(&env.name, &run_id)?)
        } else {
            None
        };

        let workspace = Workspace::create(self.config.workdir.as_deref(), &env.name)?;
        let named = self.named_vars(
            env,
            job,
            workspace.path(),
            workspace.tmp(),
            &run_id,
            artifact.as_deref(),
        );

        let mut injected = BTreeMap::new();
        injected.insert("ENVMATRIX_ENV_NAME".to_string(), env.name.clone());
        injected.insert("ENVMATRIX_WORKDIR".to_string(), path_str(workspace.path()));
        injected.insert("ENVMATRIX_RUN_ID".to_string(), run_id.clone());
        if let Some(path) = &artifact {
            injected.insert("ENVMATRIX_COVERAGE_FILE".to_string(), path_str(path));
        }
        let process_env = self.process_env(env, job, &named, injected);
        let planned = self.plan(&pipeline, &named, &process_env);

        if !dry_run {
            self.preflight(env, &planned, &process_env, workspace.path())?;
        }

        log.stage(&format!("{} (run {run_id})", env.name));
        let deadline = self.options.timeout.map(|t| start + t);
        let (status, steps) = self.execute_steps(&planned, &process_env, &workspace, deadline, log);

        // The measuring tool may suffix the reserved name per process.
        let artifacts = match &artifact {
            Some(reserved) => store.produced_under(reserved)?,
            None => Vec::new(),
        };
        let workdir = if self.options.keep_workdir {
            let kept = workspace.keep();
            log.info(&format!("working directory kept at {}", kept.display()));
            Some(kept)
        } else {
            None
        };

        Ok(RunOutcome {
            env: env.name.clone(),
            run_id,
            status,
            steps,
            duration: start.elapsed(),
            artifacts,
            workdir,
            dry_run,
        })
    }

    fn named_vars(
        &self,
        env: &ResolvedEnvironment,
        job: &JobContext,
        workdir: &Path,
        tmpdir: &Path,
        run_id: &str,
        artifact: Option<&Path>,
    ) -> Vars<'static> {
        Vars::new()
            .with("root", path_str(&self.config.root))
            .with("workdir", path_str(workdir))
            .with("tmpdir", path_str(tmpdir))
            .with("env_name", env.name.clone())
            .with("run_id", run_id)
            .with("coverage_file", artifact.map(path_str).unwrap_or_default())
            .with("interpreter", job.interpreter.clone())
            .with("noipv6", job.noipv6.to_string())
    }

    /// The complete process environment of one run.
    fn process_env(
        &self,
        env: &ResolvedEnvironment,
        job: &JobContext,
        named: &Vars<'_>,
        injected: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let hermetic = self.options.hermetic || !env.passes_all_env();
        let serial = env.serial.then_some(&self.config.base.serial_env);
        process_env::build(env, hermetic, &self.system_env, &job.vars, named, serial, injected)
    }

    /// Expand every step against the run's variables.
    fn plan<'p>(
        &self,
        pipeline: &'p Pipeline,
        named: &Vars<'_>,
        process_env: &BTreeMap<String, String>,
    ) -> Vec<(&'p Step, Vec<String>)> {
        let vars = Vars {
            named: named.named.clone(),
            env: Some(process_env),
            posargs: self.options.posargs.as_deref(),
        };
        pipeline
            .steps
            .iter()
            .map(|step| (step, step.expand(&vars)))
            .collect()
    }

    /// Fail before any process starts if a program is missing.
    fn preflight(
        &self,
        env: &ResolvedEnvironment,
        planned: &[(&Step, Vec<String>)],
        process_env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<(), ConfigError> {
        for (step, argv) in planned {
            if !step.applies_to(&self.platform) {
                continue;
            }
            if let Some(program) = argv.first()
                && !self.executor.which(program, process_env, cwd)
            {
                return Err(ConfigError::MissingTool {
                    tool: program.clone(),
                    env: env.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn execute_steps(
        &self,
        planned: &[(&Step, Vec<String>)],
        process_env: &BTreeMap<String, String>,
        workspace: &Workspace,
        deadline: Option<Instant>,
        log: &dyn Log,
    ) -> (RunStatus, Vec<StepRecord>) {
        let mut records = Vec::with_capacity(planned.len());
        let record = |step: &Step, state, duration| StepRecord {
            name: step.name.clone(),
            policy: step.policy,
            state,
            duration,
        };

        for (step, argv) in planned {
            if self.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                log.warn(&format!("cancelled before {}", step.name));
                return (RunStatus::Cancelled { step: step.name.clone() }, records);
            }
            if !step.applies_to(&self.platform) {
                log.debug(&format!("{}: not applicable on {}", step.name, self.platform.os));
                records.push(record(step, StepState::Skipped, Duration::ZERO));
                continue;
            }
            let Some(mut invocation) =
                Invocation::from_argv(argv, workspace.path(), process_env.clone())
            else {
                log.warn(&format!("{}: empty command", step.name));
                records.push(record(step, StepState::Skipped, Duration::ZERO));
                continue;
            };
            invocation.deadline = deadline;

            if self.options.dry_run {
                log.dry_run(&format!("{}: {}", step.name, invocation.display()));
                records.push(record(step, StepState::DryRun, Duration::ZERO));
                continue;
            }

            log.info(&format!("{}> {}", step.name, invocation.display()));
            let result = self
                .executor
                .execute(&invocation, &self.cancel, &|line| log.output(line))
                .with_context(|| format!("step {}", step.name))
                .unwrap_or_else(|e| {
                    log.error(&format!("{e:#}"));
                    ExecResult {
                        code: Some(EXIT_SPAWN_FAILED),
                        ..ExecResult::default()
                    }
                });

            if result.cancelled {
                log.warn(&format!("{} cancelled", step.name));
                records.push(record(step, StepState::Cancelled, result.duration));
                return (RunStatus::Cancelled { step: step.name.clone() }, records);
            }
            if result.success {
                records.push(record(step, StepState::Passed, result.duration));
                continue;
            }

            let code = result.exit_code();
            records.push(record(step, StepState::Failed(code), result.duration));
            match step.policy {
                StepPolicy::Informational => {
                    log.warn(&format!("{} exited {code} (informational, continuing)", step.name));
                }
                StepPolicy::Fatal => {
                    log.error(&format!("{} failed with exit code {code}", step.name));
                    return (
                        RunStatus::Failed {
                            step: step.name.clone(),
                            code,
                        },
                        records,
                    );
                }
            }
        }
        (RunStatus::Passed, records)
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Collision-free run id: a hash of the environment name, process id,
/// wall clock and a process-wide counter.
fn new_run_id(env: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = Sha256::new();
    hasher.update(env.as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher
        .finalize()
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect()
}


#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::testing::ScriptedExecutor;
    use super::*;
    use crate::environment::resolve;
    use crate::logging::isolated_logger;
    use crate::platform::Os;

    const THREE_STEPS: &str = r#"
[base]
install = ["installer"]
action = { name = "third", argv = ["third-tool"] }

[factors.a]
skip_install = true
commands = [
    { stage = "notice", name = "first", argv = ["first-tool"] },
    { stage = "setup", name = "second", argv = ["second-tool", "{tmpdir}"] },
]
"#;

    fn setup(toml_src: &str) -> (Config, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = Config::from_toml(root.path(), toml_src).unwrap();
        cfg.workdir = Some(root.path().join("work"));
        (cfg, root)
    }

    fn engine<'a>(cfg: &'a Config, exec: &'a ScriptedExecutor, options: RunOptions) -> Engine<'a> {
        Engine::new(cfg, exec, CancelToken::new(), options)
            .with_system_env(BTreeMap::from([("PATH".to_string(), "/bin".to_string())]))
            .with_platform(Platform::new(Os::Linux, "x86_64"))
    }

    // -----------------------------------------------------------------------
    // Step sequencing
    // -----------------------------------------------------------------------

    #[test]
    fn all_steps_pass() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new();
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.status.exit_code(), 0);
        assert_eq!(exec.lines().len(), 3);
    }

    #[test]
    fn second_step_failure_stops_third_and_keeps_code() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new().exit("second-tool", 3);
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::Failed {
                step: "second".to_string(),
                code: 3
            }
        );
        assert_eq!(outcome.status.exit_code(), 3);
        let lines = exec.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| !l.contains("third-tool")));
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[1].state, StepState::Failed(3));
    }

    #[test]
    fn informational_failure_continues() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(
            "[base]\nintrospect = [{ name = \"versions\", argv = [\"pyversions\"] }]\n\
             action = { name = \"act\", argv = [\"act\"] }\n[factors.a]\nskip_install = true\n",
        );
        let exec = ScriptedExecutor::new().exit("pyversions", 1);
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.steps[0].state, StepState::Failed(1));
        assert_eq!(outcome.steps[1].state, StepState::Passed);
    }

    #[test]
    fn missing_tool_fails_before_any_process_starts() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new().missing("third-tool");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let err = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingTool { tool, .. }) if tool == "third-tool"
        ));
        assert!(exec.lines().is_empty());
    }

    #[test]
    fn cancellation_reports_130() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new().cancel_on("second-tool");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::Cancelled {
                step: "second".to_string()
            }
        );
        assert_eq!(outcome.status.exit_code(), 130);
    }

    #[test]
    fn pre_cancelled_token_runs_nothing() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new();
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let outcome = Engine::new(&cfg, &exec, token, RunOptions::default())
            .with_system_env(BTreeMap::new())
            .run(&env, &log)
            .unwrap();
        assert!(matches!(outcome.status, RunStatus::Cancelled { .. }));
        assert!(exec.lines().is_empty());
    }

    #[test]
    fn dry_run_executes_nothing() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new().missing("third-tool");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let outcome = engine(&cfg, &exec, options).run(&env, &log).unwrap();
        assert!(outcome.dry_run);
        assert!(outcome.steps.iter().all(|s| s.state == StepState::DryRun));
        assert!(exec.lines().is_empty());
        assert_eq!(outcome.summary().0, EntryStatus::DryRun);
    }

    // -----------------------------------------------------------------------
    // Platform gating
    // -----------------------------------------------------------------------

    #[test]
    fn platform_gated_steps_are_skipped_elsewhere() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(
            "[base]\naction = { name = \"act\", argv = [\"act\"] }\n\
             [factors.a]\nskip_install = true\nplatforms = [\"windows\"]\n\
             commands = [{ stage = \"setup\", name = \"win-only\", argv = [\"win-tool\"] }]\n",
        );
        let exec = ScriptedExecutor::new().missing("win-tool");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.steps[0].state, StepState::Skipped);
        assert_eq!(exec.lines(), ["act"]);
    }

    // -----------------------------------------------------------------------
    // Environment and workspace
    // -----------------------------------------------------------------------

    #[test]
    fn injected_variables_reach_every_step() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new();
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        for vars in exec.envs() {
            assert_eq!(vars["ENVMATRIX_ENV_NAME"], "a");
            assert_eq!(vars["ENVMATRIX_RUN_ID"], outcome.run_id);
            assert_eq!(vars["PATH"], "/bin");
        }
    }

    #[test]
    fn workspace_removed_unless_kept() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(THREE_STEPS);
        let exec = ScriptedExecutor::new();
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert!(outcome.workdir.is_none());
        let tmpdir_arg = exec.lines()[1].split(' ').nth(1).unwrap().to_string();
        assert!(!Path::new(&tmpdir_arg).exists());

        let options = RunOptions {
            keep_workdir: true,
            ..RunOptions::default()
        };
        let kept = engine(&cfg, &exec, options).run(&env, &log).unwrap();
        assert!(kept.workdir.unwrap().join("tmp").is_dir());
    }

    #[test]
    fn posargs_replace_action_defaults() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(
            "[base]\naction = { name = \"t\", argv = [\"trial\", \"{posargs:twisted}\"] }\n\
             [factors.a]\nskip_install = true\n",
        );
        let exec = ScriptedExecutor::new();
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        let options = RunOptions {
            posargs: Some(vec!["twisted.test.test_log".to_string()]),
            ..RunOptions::default()
        };
        engine(&cfg, &exec, options).run(&env, &log).unwrap();
        assert_eq!(exec.lines(), ["trial twisted.test.test_log"]);
    }

    #[test]
    fn coverage_run_gets_unique_artifact_path() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(
            "[base]\naction = { name = \"t\", argv = [\"trial\"] }\n\
             [factors.cov]\ncoverage = true\nskip_install = true\n\
             [factors.cov.setenv]\nCOVERAGE_FILE = \"{coverage_file}\"\n",
        );
        let exec = ScriptedExecutor::new();
        let env = resolve("cov", &cfg.base, &cfg.registry).unwrap();
        let eng = engine(&cfg, &exec, RunOptions::default());
        eng.run(&env, &log).unwrap();
        eng.run(&env, &log).unwrap();
        let envs = exec.envs();
        let first = &envs[0]["COVERAGE_FILE"];
        let second = &envs[1]["COVERAGE_FILE"];
        assert_ne!(first, second);
        assert!(first.contains(".coverage.cov."));
        assert_eq!(first, &envs[0]["ENVMATRIX_COVERAGE_FILE"]);
    }

    #[test]
    fn tool_suffixed_data_files_are_reported() {
        let (log, _tmp, _guard) = isolated_logger();
        let (cfg, _root) = setup(
            "[base]\naction = { name = \"t\", argv = [\"trial\"] }\n\
             [factors.cov]\ncoverage = true\nskip_install = true\n",
        );
        let exec = ScriptedExecutor::new().writes_coverage(".host.4242.XyZab");
        let env = resolve("cov", &cfg.base, &cfg.registry).unwrap();
        let outcome = engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert_eq!(outcome.artifacts.len(), 1);
        let name = outcome.artifacts[0].file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, format!(".coverage.cov.{}.host.4242.XyZab", outcome.run_id));
    }

    // -----------------------------------------------------------------------
    // Serial execution and matrix coordinates
    // -----------------------------------------------------------------------

    #[test]
    fn serial_factor_forces_one_job_in_the_action() {
        let (log, _tmp, _guard) = isolated_logger();
        let root = tempfile::tempdir().unwrap();
        let mut cfg = Config::builtin(root.path()).unwrap();
        cfg.workdir = Some(root.path().join("work"));
        let exec = ScriptedExecutor::new();
        let env = resolve("alldeps-nocov-windows", &cfg.base, &cfg.registry).unwrap();
        assert!(env.serial);
        engine(&cfg, &exec, RunOptions::default())
            .with_platform(Platform::new(Os::Windows, "x86_64"))
            .run(&env, &log)
            .unwrap();
        let action = exec.lines().pop().unwrap();
        assert!(action.ends_with("--jobs=1 twisted"), "{action}");
        assert_eq!(exec.envs().pop().unwrap()["TWISTED_FORCE_SERIAL_TESTS"], "1");
    }

    #[test]
    fn parallel_environment_keeps_default_jobs() {
        let (log, _tmp, _guard) = isolated_logger();
        let root = tempfile::tempdir().unwrap();
        let mut cfg = Config::builtin(root.path()).unwrap();
        cfg.workdir = Some(root.path().join("work"));
        let exec = ScriptedExecutor::new();
        let env = resolve("alldeps-nocov-posix", &cfg.base, &cfg.registry).unwrap();
        engine(&cfg, &exec, RunOptions::default()).run(&env, &log).unwrap();
        assert!(exec.lines().pop().unwrap().ends_with("--jobs=4 twisted"));
    }

    #[test]
    fn job_interpreter_selects_the_program() {
        let (log, _tmp, _guard) = isolated_logger();
        let root = tempfile::tempdir().unwrap();
        let mut cfg = Config::builtin(root.path()).unwrap();
        cfg.workdir = Some(root.path().join("work"));
        let env = resolve("nodeps-nocov-posix", &cfg.base, &cfg.registry).unwrap();

        let mut first_programs = Vec::new();
        for interpreter in ["3.8", "3.12"] {
            let exec = ScriptedExecutor::new();
            let job = JobContext {
                interpreter: interpreter.to_string(),
                ..JobContext::default()
            };
            engine(&cfg, &exec, RunOptions::default())
                .run_with(&env, &job, &log)
                .unwrap();
            first_programs.push(exec.lines()[0].split(' ').next().unwrap().to_string());
        }
        assert_eq!(first_programs, ["python3.8", "python3.12"]);
    }

    #[test]
    fn preflight_all_checks_every_environment_first() {
        let (cfg, _root) = setup(
            "[base]\naction = { name = \"t\", argv = [\"act\"] }\n\
             [factors.a]\nskip_install = true\n\
             [factors.b]\nskip_install = true\n\
             commands = [{ argv = [\"absent-tool\"] }]\n",
        );
        let exec = ScriptedExecutor::new().missing("absent-tool");
        let names = ["a", "b"].map(String::from);
        let envs = crate::environment::resolve_all(&names, &cfg.base, &cfg.registry).unwrap();
        let err = engine(&cfg, &exec, RunOptions::default())
            .preflight_all(&envs)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTool { ref env, .. } if env == "b"));
        assert!(exec.lines().is_empty());
    }

    #[test]
    fn run_ids_are_unique() {
        let ids: std::collections::BTreeSet<String> = (0..100).map(|_| new_run_id("x")).collect();
        assert_eq!(ids.len(), 100);
    }
}
