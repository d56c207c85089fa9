//! Environment resolution: environment name + base settings + factor
//! registry → an immutable [`ResolvedEnvironment`].
mod name;
mod resolve;

pub use name::EnvName;
pub use resolve::{resolve, resolve_all};

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::Stage;
use crate::pipeline::StepPolicy;
use crate::platform::Os;

/// A command in its final position within an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCommand {
    /// Step name.
    pub name: String,
    /// Stage the command was declared in.
    pub stage: Stage,
    /// Whether a failure aborts the pipeline.
    pub policy: StepPolicy,
    /// Unexpanded argument vector.
    pub argv: Vec<String>,
    /// Platforms the command applies to; `None` for all.
    pub platforms: Option<Vec<Os>>,
    /// `base` or the contributing factor.
    pub origin: String,
}

/// Concrete, ready-to-build configuration of one environment.
///
/// A pure function of the environment name, the base settings and the
/// registry: resolving the same name twice yields equal values and
/// byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEnvironment {
    /// Environment name as requested.
    pub name: String,
    /// Factor tokens in declaration order.
    pub factors: Vec<String>,
    /// Union of all extras.
    pub extras: BTreeSet<String>,
    /// Requirements installed separately, first occurrence order.
    pub deps: Vec<String>,
    /// Merged environment variables (unexpanded).
    pub setenv: BTreeMap<String, String>,
    /// Variables forwarded from the caller; `*` forwards all.
    pub passenv: Vec<String>,
    /// Installer argument prefix.
    pub install: Vec<String>,
    /// True if any factor skips package installation.
    pub skip_install: bool,
    /// True if any factor forces serial execution inside the action.
    pub serial: bool,
    /// True if the run produces a coverage artifact.
    pub coverage: bool,
    /// Final ordered command list.
    pub commands: Vec<ResolvedCommand>,
}

impl ResolvedEnvironment {
    /// Names of the resolved commands, in order.
    #[must_use]
    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether every caller variable is forwarded.
    #[must_use]
    pub fn passes_all_env(&self) -> bool {
        self.passenv.iter().any(|p| p == "*")
    }
}
