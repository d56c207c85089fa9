use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::matrix::Event;

/// Top-level CLI entry point for the environment orchestrator.
#[derive(Parser, Debug)]
#[command(
    name = "envmatrix",
    about = "Factor-composed test environments, coverage aggregation and CI matrix runs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Parser, Debug, Clone)]
pub struct GlobalOpts {
    /// Override repository root discovery
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Configuration file (default: <root>/envmatrix.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print what would run without executing anything
    #[arg(short = 'd', long, global = true)]
    pub dry_run: bool,

    /// Run environments and matrix jobs one at a time (parallel is enabled by default)
    #[arg(long = "no-parallel", global = true, action = clap::ArgAction::SetFalse)]
    pub parallel: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one or more environments
    Run(RunOpts),
    /// Show how an environment resolves
    Show(ShowOpts),
    /// List configured factors and environments
    List,
    /// Combine coverage artifacts, report and upload
    Coverage(CoverageOpts),
    /// Run the CI matrix
    Matrix(MatrixOpts),
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
    /// Print version information
    Version,
}

/// Options for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunOpts {
    /// Environments to run (default: the configured envlist)
    #[arg(short, long = "env", value_delimiter = ',')]
    pub envs: Vec<String>,

    /// Maximum concurrent runs (default: available parallelism)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Per-run time limit in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Keep each run's working directory
    #[arg(long)]
    pub keep_workdir: bool,

    /// Forward only allow-listed environment variables
    #[arg(long)]
    pub hermetic: bool,

    /// Leave coverage artifacts uncombined
    #[arg(long)]
    pub no_combine: bool,

    /// Positional arguments substituted for {posargs}
    #[arg(last = true)]
    pub posargs: Vec<String>,
}

/// Options for the `show` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct ShowOpts {
    /// Environment to resolve
    #[arg(short, long = "env")]
    pub env: String,

    /// Print the resolved environment as JSON
    #[arg(long)]
    pub json: bool,
}

/// Options for the `coverage` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct CoverageOpts {
    /// Hide fully covered files in the summary
    #[arg(long)]
    pub skip_covered: bool,

    /// Do not upload to configured destinations
    #[arg(long)]
    pub no_upload: bool,

    /// Directory for the LCOV and JSON exports (default: the artifact directory)
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

/// Options for the `matrix` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct MatrixOpts {
    /// Maximum concurrent jobs (default: available parallelism)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Print the expanded jobs and exit
    #[arg(long)]
    pub list: bool,

    /// Triggering event
    #[arg(long, value_enum, default_value = "push")]
    pub event: Event,

    /// Branch being built (default: the checked-out branch)
    #[arg(long, value_name = "REF")]
    pub branch: Option<String>,

    /// Pull request target branch
    #[arg(long, value_name = "REF")]
    pub base: Option<String>,
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_with_envs() {
        let cli = Cli::parse_from(["envmatrix", "run", "-e", "lint,alldeps-withcov-posix"]);
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.envs, vec!["lint", "alldeps-withcov-posix"]);
        assert!(opts.posargs.is_empty());
    }

    #[test]
    fn parse_run_posargs() {
        let cli = Cli::parse_from(["envmatrix", "run", "--", "twisted.test.test_foo", "-x"]);
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.posargs, vec!["twisted.test.test_foo", "-x"]);
    }

    #[test]
    fn parse_run_options() {
        let cli = Cli::parse_from([
            "envmatrix",
            "run",
            "-j",
            "3",
            "--timeout",
            "60",
            "--keep-workdir",
            "--hermetic",
            "--no-combine",
        ]);
        let Command::Run(opts) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(opts.jobs, Some(3));
        assert_eq!(opts.timeout, Some(60));
        assert!(opts.keep_workdir && opts.hermetic && opts.no_combine);
    }

    #[test]
    fn parse_global_options() {
        let cli = Cli::parse_from([
            "envmatrix",
            "-d",
            "--no-parallel",
            "--root",
            "/repo",
            "list",
        ]);
        assert!(cli.global.dry_run);
        assert!(!cli.global.parallel);
        assert_eq!(cli.global.root, Some(PathBuf::from("/repo")));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn parallel_by_default() {
        let cli = Cli::parse_from(["envmatrix", "list"]);
        assert!(cli.global.parallel);
    }

    #[test]
    fn show_requires_env() {
        assert!(Cli::try_parse_from(["envmatrix", "show"]).is_err());
        let cli = Cli::parse_from(["envmatrix", "show", "-e", "lint", "--json"]);
        assert!(matches!(cli.command, Command::Show(ShowOpts { json: true, .. })));
    }

    #[test]
    fn parse_matrix_pull_request() {
        let cli = Cli::parse_from([
            "envmatrix",
            "matrix",
            "--event",
            "pull-request",
            "--branch",
            "feature",
            "--base",
            "trunk",
        ]);
        let Command::Matrix(opts) = cli.command else {
            panic!("expected matrix");
        };
        assert_eq!(opts.event, Event::PullRequest);
        assert_eq!(opts.base.as_deref(), Some("trunk"));
    }

    #[test]
    fn parse_coverage() {
        let cli = Cli::parse_from(["envmatrix", "coverage", "--skip-covered", "--no-upload"]);
        let Command::Coverage(opts) = cli.command else {
            panic!("expected coverage");
        };
        assert!(opts.skip_covered && opts.no_upload);
        assert_eq!(opts.output, None);
    }

    #[test]
    fn parse_version() {
        let cli = Cli::parse_from(["envmatrix", "version"]);
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn parse_verbose() {
        let cli = Cli::parse_from(["envmatrix", "-v", "list"]);
        assert!(cli.verbose);
    }
}
