//! Process execution behind the [`Executor`] seam.
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead as _, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A fully expanded command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments after the program.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Complete process environment; nothing is inherited.
    pub env: BTreeMap<String, String>,
    /// Point in time after which the process is killed.
    pub deadline: Option<Instant>,
}

impl Invocation {
    /// Split an expanded argv into program and arguments.
    ///
    /// Returns `None` for an empty argv.
    #[must_use]
    pub fn from_argv(argv: &[String], cwd: &Path, env: BTreeMap<String, String>) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            env,
            deadline: None,
        })
    }

    /// The command line as a single display string.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    /// Whether the process was killed by cancellation or deadline.
    pub cancelled: bool,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecResult {
    /// Exit code to report: the real code, `128 + signal` for signal
    /// deaths, `1` when neither is known.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code
            .or_else(|| self.signal.map(|s| 128 + s))
            .unwrap_or(1)
    }
}

/// Runs processes. Implemented by [`SystemExecutor`] and by scripted fakes
/// in tests.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Run `invocation` to completion, forwarding each output line to
    /// `sink` as it arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Result<ExecResult>;

    /// Whether `program` can be found using the `PATH` in `env`.
    fn which(&self, program: &str, env: &BTreeMap<String, String>, cwd: &Path) -> bool;
}

/// [`Executor`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Result<ExecResult> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            // Own group, so a kill reaches whatever the command spawned.
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to execute: {}", invocation.program))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (waited, stdout, stderr) = thread::scope(|s| {
            let out = s.spawn(move || pump(stdout, sink));
            let err = s.spawn(move || pump(stderr, sink));
            let waited = wait(&mut child, invocation.deadline, cancel);
            (
                waited,
                out.join().unwrap_or_default(),
                err.join().unwrap_or_default(),
            )
        });
        let (status, cancelled) =
            waited.with_context(|| format!("failed to wait for: {}", invocation.program))?;

        Ok(ExecResult {
            stdout,
            stderr,
            success: status.success() && !cancelled,
            code: status.code(),
            signal: signal_of(status),
            cancelled,
            duration: start.elapsed(),
        })
    }

    fn which(&self, program: &str, env: &BTreeMap<String, String>, cwd: &Path) -> bool {
        let path = env.get("PATH").map(OsString::from);
        which::which_in(program, path, cwd).is_ok()
    }
}

/// Forward every line of `stream` to `sink` and return the whole text.
fn pump(stream: Option<impl Read>, sink: &(dyn Fn(&str) + Sync)) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut captured = String::new();
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    while reader.read_until(b'\n', &mut buf).is_ok_and(|n| n > 0) {
        let line = String::from_utf8_lossy(&buf);
        sink(line.trim_end_matches(['\r', '\n']));
        captured.push_str(&line);
        buf.clear();
    }
    captured
}

/// Poll `child` until it exits, killing its process group on cancellation
/// or deadline.
fn wait(
    child: &mut Child,
    deadline: Option<Instant>,
    cancel: &CancelToken,
) -> std::io::Result<(ExitStatus, bool)> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
            // The child may exit between the poll and the kill.
            kill_group(child);
            return Ok((child.wait()?, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let killed = i32::try_from(child.id())
        .is_ok_and(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok());
    if !killed {
        child.kill().ok();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    child.kill().ok();
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
const fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn system_env() -> BTreeMap<String, String> {
        std::env::vars().collect()
    }

    fn sh(script: &str) -> Invocation {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        Invocation::from_argv(&argv, &std::env::temp_dir(), system_env()).unwrap()
    }

    fn run(inv: &Invocation) -> (ExecResult, Vec<String>) {
        let lines = Mutex::new(Vec::new());
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
        let result = SystemExecutor.execute(inv, &CancelToken::new(), &sink).unwrap();
        (result, lines.into_inner().unwrap())
    }

    #[test]
    fn streams_lines_and_captures() {
        let (result, lines) = run(&sh("echo one; echo two"));
        assert!(result.success);
        assert_eq!(result.code, Some(0));
        assert_eq!(result.stdout, "one\ntwo\n");
        assert_eq!(lines, ["one", "two"]);
    }

    #[test]
    fn exit_code_is_preserved() {
        let (result, _) = run(&sh("echo oops >&2; exit 7"));
        assert!(!result.success);
        assert_eq!(result.exit_code(), 7);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let (result, _) = run(&sh("kill -TERM $$"));
        assert_eq!(result.code, None);
        assert_eq!(result.exit_code(), 128 + 15);
    }

    #[test]
    fn environment_is_exactly_the_given_map() {
        let mut env = BTreeMap::new();
        env.insert("ONLY_THIS".to_string(), "yes".to_string());
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap());
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo ${ONLY_THIS}-${HOME:-unset}".to_string()];
        let inv = Invocation::from_argv(&argv, &std::env::temp_dir(), env).unwrap();
        let (result, _) = run(&inv);
        assert_eq!(result.stdout.trim(), "yes-unset");
    }

    #[test]
    fn deadline_kills_the_process() {
        let mut inv = sh("exec sleep 5");
        inv.deadline = Some(Instant::now() + Duration::from_millis(100));
        let (result, _) = run(&inv);
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[test]
    fn deadline_kills_grandchildren_holding_the_pipes() {
        let mut inv = sh("sleep 5; echo done");
        inv.deadline = Some(Instant::now() + Duration::from_millis(200));
        let start = Instant::now();
        let (result, lines) = run(&inv);
        assert!(result.cancelled);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(lines.is_empty());
    }

    #[test]
    fn cancelled_token_kills_the_process() {
        let token = CancelToken::new();
        token.cancel();
        let result = SystemExecutor
            .execute(&sh("exec sleep 5"), &token, &|_| {})
            .unwrap();
        assert!(result.cancelled);
    }

    #[test]
    fn missing_program_is_an_error() {
        let argv = vec!["this-program-does-not-exist-12345".to_string()];
        let inv = Invocation::from_argv(&argv, &std::env::temp_dir(), system_env()).unwrap();
        assert!(SystemExecutor.execute(&inv, &CancelToken::new(), &|_| {}).is_err());
    }

    #[test]
    fn which_uses_path_from_env() {
        let env = system_env();
        let cwd = std::env::temp_dir();
        assert!(SystemExecutor.which("sh", &env, &cwd));
        assert!(!SystemExecutor.which("this-program-does-not-exist-12345", &env, &cwd));
        assert!(!SystemExecutor.which("sh", &BTreeMap::new(), &cwd));
    }

    #[test]
    fn empty_argv_has_no_invocation() {
        assert!(Invocation::from_argv(&[], Path::new("/"), BTreeMap::new()).is_none());
    }
}
