//! Factor-composed test environment orchestrator.
//!
//! Environment names such as `alldeps-withcov-posix` are split into factors,
//! each factor contributes extras, dependencies, variables and commands, and
//! the resolved environment is turned into an ordered pipeline that runs in
//! an isolated working directory. Coverage runs leave per-run artifacts that
//! are combined, reported and uploaded afterwards, and a CI matrix fans jobs
//! out over interpreters and architectures behind a single pass/fail gate.
//!
//! The public API is organised into layers:
//!
//! - **[`config`]**: load `envmatrix.toml` and the factor registry
//! - **[`environment`]**: parse environment names and fold factors into a
//!   [`ResolvedEnvironment`](environment::ResolvedEnvironment)
//! - **[`pipeline`]**: order a resolved environment into steps
//! - **[`engine`]**: execute pipelines, one or many at a time
//! - **[`coverage`]**: combine artifacts, report and upload
//! - **[`matrix`]**: expand and run the CI matrix
//! - **[`commands`]**: top-level subcommand orchestration
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod coverage;
pub mod engine;
pub mod environment;
pub mod error;
pub mod exec;
pub mod logging;
pub mod matrix;
pub mod pipeline;
pub mod platform;
pub mod template;
