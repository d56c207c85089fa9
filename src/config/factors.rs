//! Factor definitions and the registry that resolves factor names.
//!
//! A factor is a flat record of contributions. Factors never reference each
//! other, so resolving an environment is a single fold over its tokens.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::platform::Os;

/// Where a command sits in the pipeline relative to the primary action.
///
/// Commands are ordered by stage first and declaration order second, so the
/// order of factor tokens in an environment name never reorders stages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Interpreter/environment diagnostics; never fatal.
    Introspect,
    /// Informational notices (e.g. which platform the run targets).
    Notice,
    /// Preparation before the action (e.g. resetting coverage data).
    #[default]
    Setup,
    /// The primary action and anything declared alongside it.
    Action,
}

/// A value assigned to an environment variable.
///
/// Plain strings overwrite earlier assignments; `{ value, append = true }`
/// concatenates onto whatever earlier factors set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// Later assignment wins.
    Plain(String),
    /// Assignment with an explicit merge mode.
    Detailed {
        /// Value to assign or append.
        value: String,
        /// Concatenate onto the earlier value instead of replacing it.
        #[serde(default)]
        append: bool,
    },
}

impl EnvValue {
    /// The raw (unexpanded) value.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Plain(v) | Self::Detailed { value: v, .. } => v,
        }
    }

    /// Whether this assignment appends.
    #[must_use]
    pub const fn is_append(&self) -> bool {
        matches!(self, Self::Detailed { append: true, .. })
    }
}

/// A command fragment contributed by the base configuration or a factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    /// Pipeline stage.
    #[serde(default)]
    pub stage: Stage,
    /// Step name shown in logs; derived from the program when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Argument vector; entries may contain `{...}` substitutions.
    pub argv: Vec<String>,
    /// Log a failure instead of aborting the pipeline.
    #[serde(default)]
    pub informational: bool,
}

/// The primary action of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    /// Step name (e.g. `test-run`, `lint`).
    pub name: String,
    /// Argument vector.
    pub argv: Vec<String>,
}

/// Wraps the primary action in another program (e.g. a coverage runner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapSpec {
    /// Wrapper name; the wrapped action is named `<name>-wrapped-<action>`.
    pub name: String,
    /// Arguments placed in front of the action.
    pub prefix: Vec<String>,
    /// Number of leading action arguments the prefix replaces.
    #[serde(default)]
    pub strip: usize,
}

/// Everything a single factor contributes to an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactorDef {
    /// Factor identifier; filled in from the table key.
    #[serde(skip)]
    pub name: String,
    /// Package extras to install.
    pub extras: BTreeSet<String>,
    /// Requirements installed separately from the package.
    pub deps: Vec<String>,
    /// Environment variable assignments.
    pub setenv: BTreeMap<String, EnvValue>,
    /// Do not install the package under test.
    pub skip_install: bool,
    /// Force single-threaded execution inside the invoked action.
    pub serial: bool,
    /// The run produces a coverage artifact.
    pub coverage: bool,
    /// Commands from this factor only run on these platforms.
    pub platforms: Option<Vec<Os>>,
    /// Extra commands gated on the presence of this factor.
    pub commands: Vec<CommandSpec>,
    /// Replacement primary action.
    pub action: Option<ActionSpec>,
    /// Wrapper applied to the primary action.
    pub wrap: Option<WrapSpec>,
}

/// The set of known factors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactorRegistry {
    factors: BTreeMap<String, FactorDef>,
}

impl FactorRegistry {
    /// Build a registry from deserialized factor tables, naming each entry
    /// after its key.
    #[must_use]
    pub fn from_tables(tables: BTreeMap<String, FactorDef>) -> Self {
        let factors = tables
            .into_iter()
            .map(|(name, mut def)| {
                def.name.clone_from(&name);
                (name, def)
            })
            .collect();
        Self { factors }
    }

    /// Look up a factor by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFactor`] when `name` is not registered;
    /// `env` is the environment being resolved, for the message.
    pub fn lookup(&self, name: &str, env: &str) -> Result<&FactorDef, ConfigError> {
        self.factors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFactor {
                factor: name.to_string(),
                env: env.to_string(),
            })
    }

    /// Whether `name` is a registered factor.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factors.contains_key(name)
    }

    /// Iterate over factors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &FactorDef> {
        self.factors.values()
    }

    /// Number of registered factors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// Whether the registry has no factors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}
