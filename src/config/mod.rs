//! Repository configuration: environment base settings, the factor
//! registry, coverage destinations, the CI matrix and trigger policy.
pub mod factors;
pub mod toml_loader;
pub mod validation;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::matrix::{JobFilter, MatrixJob};
use crate::platform::Platform;

pub use factors::{ActionSpec, CommandSpec, EnvValue, FactorDef, FactorRegistry, Stage, WrapSpec};

/// File name looked up at the repository root.
pub const CONFIG_FILE_NAME: &str = "envmatrix.toml";

/// Definitions used when a repository ships no configuration file.
const BUILTIN_CONFIG: &str = include_str!("default.toml");

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A file on disk.
    File(PathBuf),
    /// The embedded default definitions.
    Builtin,
}

/// Settings every environment starts from before factors are applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseConfig {
    /// Extras installed for every environment.
    pub extras: BTreeSet<String>,
    /// Requirements installed for every environment.
    pub deps: Vec<String>,
    /// Default environment variable assignments.
    pub setenv: BTreeMap<String, EnvValue>,
    /// Variables forwarded from the caller; `*` forwards everything.
    pub passenv: Vec<String>,
    /// Installer argument prefix; packages are appended.
    pub install: Vec<String>,
    /// Diagnostic commands run first; failures never abort a pipeline.
    pub introspect: Vec<CommandSpec>,
    /// Commands run in every environment.
    pub commands: Vec<CommandSpec>,
    /// Default primary action.
    pub action: Option<ActionSpec>,
    /// Variables set after `setenv` when any factor requests serial
    /// execution; they force the action's own concurrency down to one.
    pub serial_env: BTreeMap<String, String>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            extras: BTreeSet::new(),
            deps: Vec::new(),
            setenv: BTreeMap::new(),
            passenv: vec!["*".to_string()],
            install: ["python", "-m", "pip", "install"]
                .map(String::from)
                .to_vec(),
            introspect: Vec::new(),
            commands: Vec::new(),
            action: None,
            serial_env: BTreeMap::from([("TRIAL_JOBS".to_string(), "1".to_string())]),
        }
    }
}

/// An external service that receives the combined coverage report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadTarget {
    /// Destination name used in logs.
    pub name: String,
    /// Endpoint receiving the report.
    pub url: String,
    /// A failed upload fails the command; otherwise it is only a warning.
    #[serde(default)]
    pub required: bool,
    /// Environment variable holding the access token.
    #[serde(default)]
    pub token_env: Option<String>,
}

/// Coverage aggregation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverageConfig {
    /// Artifact directory, relative to the repository root.
    pub dir: String,
    /// Hide fully covered files in the summary table.
    pub skip_covered: bool,
    /// Upload destinations.
    pub upload: Vec<UploadTarget>,
    /// Command turning one measuring-tool database into a JSON report;
    /// `{artifact}` is the database and `{output}` the report to write.
    pub convert: Vec<String>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        let convert = [
            "coverage",
            "json",
            "--ignore-errors",
            "--data-file={artifact}",
            "-o",
            "{output}",
        ];
        Self {
            dir: ".envmatrix/coverage".to_string(),
            skip_covered: false,
            upload: Vec::new(),
            convert: convert.map(String::from).to_vec(),
        }
    }
}

/// How foreign-architecture jobs are executed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulationConfig {
    /// Container image; may reference `{interpreter}` and `{arch}`.
    pub image: String,
    /// Command template running one job inside the emulated container.
    pub command: Vec<String>,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        let command = [
            "docker",
            "run",
            "--rm",
            "--platform",
            "linux/{arch}",
            "--volume",
            "{root}:/workspace",
            "--workdir",
            "/workspace",
            "--env",
            "MATRIX_INTERPRETER={interpreter}",
            "--env",
            "MATRIX_NOIPV6={noipv6}",
            "--env",
            "MATRIX_ARCH={arch}",
            "{image}",
            "envmatrix",
            "run",
            "--env",
            "{env_name}",
        ];
        Self {
            image: "python:{interpreter}".to_string(),
            command: command.map(String::from).to_vec(),
        }
    }
}

/// Host commands bracketing the IPv6-disabled jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ipv6Config {
    /// Run before the first IPv6-disabled job; a failure fails those jobs.
    pub disable: Vec<Vec<String>>,
    /// Run after the last IPv6-disabled job; failures are warnings.
    pub restore: Vec<Vec<String>>,
}

/// Matrix axes and adjustments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatrixConfig {
    /// Interpreter versions.
    pub interpreters: Vec<String>,
    /// Environment names.
    pub envs: Vec<String>,
    /// IPv6-disabled modes.
    pub noipv6: Vec<bool>,
    /// Architectures; empty means the host architecture only.
    pub arch: Vec<String>,
    /// Extra jobs appended after the product.
    pub include: Vec<MatrixJob>,
    /// Filters removing jobs from the product.
    pub exclude: Vec<JobFilter>,
    /// Foreign-architecture execution.
    pub emulation: EmulationConfig,
    /// How IPv6 is switched off for `noipv6` jobs.
    pub noipv6_hooks: Ipv6Config,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            interpreters: Vec::new(),
            envs: Vec::new(),
            noipv6: vec![false],
            arch: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            emulation: EmulationConfig::default(),
            noipv6_hooks: Ipv6Config::default(),
        }
    }
}

/// CI trigger and concurrency settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CiConfig {
    /// Integration branch: pushes to it and pull requests against it run.
    pub primary_branch: String,
    /// Workflow name, used in concurrency group keys.
    pub workflow: String,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            primary_branch: "trunk".to_string(),
            workflow: "ci".to_string(),
        }
    }
}

/// On-disk layout of `envmatrix.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    envlist: Vec<String>,
    workdir: Option<String>,
    base: BaseConfig,
    factors: BTreeMap<String, FactorDef>,
    coverage: CoverageConfig,
    matrix: MatrixConfig,
    ci: CiConfig,
}

/// All loaded configuration for a repository.
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository root; `{root}` in templates.
    pub root: PathBuf,
    /// Where the configuration was read from.
    pub source: ConfigSource,
    /// Environments run when none are requested.
    pub envlist: Vec<String>,
    /// Parent directory for per-run working directories.
    pub workdir: Option<PathBuf>,
    /// Base environment settings.
    pub base: BaseConfig,
    /// Known factors.
    pub registry: FactorRegistry,
    /// Coverage settings.
    pub coverage: CoverageConfig,
    /// CI matrix.
    pub matrix: MatrixConfig,
    /// CI trigger policy.
    pub ci: CiConfig,
}

impl Config {
    /// Load configuration for the repository at `root`.
    ///
    /// Reads `explicit` when given, otherwise `<root>/envmatrix.toml`, and
    /// falls back to the built-in definitions when that file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit.map_or_else(|| root.join(CONFIG_FILE_NAME), Path::to_path_buf);
        match toml_loader::load_file::<ConfigFile>(&path)? {
            Some(file) => Ok(Self::from_file(root, file, ConfigSource::File(path))),
            None if explicit.is_some() => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            }),
            None => Self::builtin(root),
        }
    }

    /// The embedded default configuration rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the embedded document is invalid.
    pub fn builtin(root: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml_loader::parse_str(BUILTIN_CONFIG, "<built-in>")?;
        Ok(Self::from_file(root, file, ConfigSource::Builtin))
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not a valid configuration.
    pub fn from_toml(root: &Path, content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml_loader::parse_str(content, CONFIG_FILE_NAME)?;
        Ok(Self::from_file(
            root,
            file,
            ConfigSource::File(root.join(CONFIG_FILE_NAME)),
        ))
    }

    fn from_file(root: &Path, file: ConfigFile, source: ConfigSource) -> Self {
        Self {
            root: root.to_path_buf(),
            source,
            envlist: file.envlist,
            workdir: file.workdir.map(|w| root.join(w)),
            base: file.base,
            registry: FactorRegistry::from_tables(file.factors),
            coverage: file.coverage,
            matrix: file.matrix,
            ci: file.ci,
        }
    }

    /// Absolute coverage artifact directory.
    #[must_use]
    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join(&self.coverage.dir)
    }

    /// Check for problems that would otherwise surface only when a run or
    /// matrix job reaches them.
    #[must_use]
    pub fn validate(&self, platform: &Platform) -> Vec<validation::ValidationWarning> {
        validation::validate_all(self, platform)
    }

    /// Directory holding concurrency group files.
    #[must_use]
    pub fn groups_dir(&self) -> PathBuf {
        self.root.join(".envmatrix").join("groups")
    }
}
