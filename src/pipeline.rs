//! Ordered step list for one resolved environment.
use serde::Serialize;

use crate::config::Stage;
use crate::environment::{ResolvedCommand, ResolvedEnvironment};
use crate::platform::{Os, Platform};
use crate::template::{self, Vars};

/// How a step failure affects the rest of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPolicy {
    /// A non-zero exit stops the pipeline and becomes the run's exit code.
    Fatal,
    /// A non-zero exit is logged as a warning and the pipeline continues.
    Informational,
}

/// What a step is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Prints interpreter or tool versions.
    Introspect,
    /// Prints a notice for the user.
    Notice,
    /// Prepares state before the action.
    Setup,
    /// Installs extra requirements.
    InstallDeps,
    /// Installs the project under test with its extras.
    InstallPackage,
    /// The primary action.
    Action,
}

impl From<Stage> for StepKind {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Introspect => Self::Introspect,
            Stage::Notice => Self::Notice,
            Stage::Setup => Self::Setup,
            Stage::Action => Self::Action,
        }
    }
}

/// A single command in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    /// Display name, unique within the pipeline.
    pub name: String,
    /// Purpose of the step.
    pub kind: StepKind,
    /// Failure policy.
    pub policy: StepPolicy,
    /// Argument template; expanded right before execution.
    pub argv: Vec<String>,
    /// Platform gate; `None` runs everywhere.
    pub platforms: Option<Vec<Os>>,
}

impl Step {
    fn from_command(cmd: &ResolvedCommand) -> Self {
        Self {
            name: cmd.name.clone(),
            kind: cmd.stage.into(),
            policy: cmd.policy,
            argv: cmd.argv.clone(),
            platforms: cmd.platforms.clone(),
        }
    }

    /// Whether the step runs on `platform`.
    #[must_use]
    pub fn applies_to(&self, platform: &Platform) -> bool {
        platform.allows(self.platforms.as_deref())
    }

    /// Expand the argument template.
    #[must_use]
    pub fn expand(&self, vars: &Vars<'_>) -> Vec<String> {
        template::expand_argv(&self.argv, vars)
    }
}

/// The full ordered step list of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    /// Environment the pipeline belongs to.
    pub env: String,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Step names in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Build the pipeline of a resolved environment.
///
/// Introspection comes first, then dependency installation, then package
/// installation (unless skipped), then the remaining commands in resolved
/// order ending with the action.
#[must_use]
pub fn build(env: &ResolvedEnvironment) -> Pipeline {
    let (introspect, rest): (Vec<_>, Vec<_>) = env
        .commands
        .iter()
        .partition(|c| c.stage == Stage::Introspect);

    let mut steps: Vec<Step> = introspect.into_iter().map(Step::from_command).collect();

    if !env.deps.is_empty() {
        let mut argv = env.install.clone();
        argv.extend(env.deps.iter().cloned());
        steps.push(Step {
            name: "install-deps".to_string(),
            kind: StepKind::InstallDeps,
            policy: StepPolicy::Fatal,
            argv,
            platforms: None,
        });
    }

    if !env.skip_install {
        let mut argv = env.install.clone();
        argv.push(package_spec(env));
        steps.push(Step {
            name: "install-package".to_string(),
            kind: StepKind::InstallPackage,
            policy: StepPolicy::Fatal,
            argv,
            platforms: None,
        });
    }

    steps.extend(rest.into_iter().map(Step::from_command));

    Pipeline {
        env: env.name.clone(),
        steps,
    }
}

fn package_spec(env: &ResolvedEnvironment) -> String {
    if env.extras.is_empty() {
        "{root}".to_string()
    } else {
        let extras: Vec<&str> = env.extras.iter().map(String::as_str).collect();
        format!("{{root}}[{}]", extras.join(","))
    }
}
