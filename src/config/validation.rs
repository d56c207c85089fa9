use std::collections::BTreeSet;

use crate::environment::resolve;
use crate::matrix;
use crate::platform::Platform;

/// A validation warning detected during configuration loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// The configuration section (e.g., "envlist", "coverage.upload").
    pub source: String,
    /// The specific item that triggered the warning.
    pub item: String,
    /// Human-readable warning message.
    pub message: String,
}

impl ValidationWarning {
    /// Build a warning.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            item: item.into(),
            message: message.into(),
        }
    }
}

/// Trait for configuration validators.
///
/// Implementations report problems that would only surface later, when a
/// run or matrix job reaches them.
pub trait ConfigValidator {
    /// Validate the configuration and return any warnings found.
    fn validate(&self, config: &super::Config, platform: &Platform) -> Vec<ValidationWarning>;

    /// Return a human-readable name for this validator.
    fn name(&self) -> &'static str;
}

/// Environment names in `envlist` and the matrix must resolve.
#[derive(Debug)]
pub struct EnvNameValidator;

impl ConfigValidator for EnvNameValidator {
    fn validate(&self, config: &super::Config, _platform: &Platform) -> Vec<ValidationWarning> {
        let named = config
            .envlist
            .iter()
            .map(|name| ("envlist", name))
            .chain(config.matrix.envs.iter().map(|name| ("matrix.envs", name)))
            .chain(
                config
                    .matrix
                    .include
                    .iter()
                    .map(|job| ("matrix.include", &job.env)),
            );

        let mut seen = BTreeSet::new();
        named
            .filter(|(source, name)| seen.insert((*source, (*name).clone())))
            .filter_map(|(source, name)| {
                resolve(name, &config.base, &config.registry)
                    .err()
                    .map(|e| ValidationWarning::new(source, name, e.to_string()))
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "environments"
    }
}

/// Foreign-architecture jobs need an emulation command.
#[derive(Debug)]
pub struct EmulationValidator;

impl ConfigValidator for EmulationValidator {
    fn validate(&self, config: &super::Config, platform: &Platform) -> Vec<ValidationWarning> {
        if !config.matrix.emulation.command.is_empty() {
            return Vec::new();
        }
        let foreign: BTreeSet<String> = matrix::expand(&config.matrix, &platform.arch)
            .into_iter()
            .filter(|job| !platform.is_native_arch(&job.arch))
            .map(|job| job.arch)
            .collect();
        foreign
            .into_iter()
            .map(|arch| {
                ValidationWarning::new(
                    "matrix.emulation",
                    &arch,
                    format!("jobs for {arch} need emulation, but no emulation command is configured"),
                )
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "emulation"
    }
}

/// Upload destinations need a URL and a unique name.
#[derive(Debug)]
pub struct UploadValidator;

impl ConfigValidator for UploadValidator {
    fn validate(&self, config: &super::Config, _platform: &Platform) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        let mut names = BTreeSet::new();
        for target in &config.coverage.upload {
            if target.url.trim().is_empty() {
                warnings.push(ValidationWarning::new(
                    "coverage.upload",
                    &target.name,
                    "destination has an empty URL",
                ));
            }
            if !names.insert(target.name.as_str()) {
                warnings.push(ValidationWarning::new(
                    "coverage.upload",
                    &target.name,
                    "destination name is used more than once",
                ));
            }
        }
        warnings
    }

    fn name(&self) -> &'static str {
        "uploads"
    }
}

/// Validate all configuration and return collected warnings.
#[must_use]
pub fn validate_all(config: &super::Config, platform: &Platform) -> Vec<ValidationWarning> {
    let validators: Vec<Box<dyn ConfigValidator>> = vec![
        Box::new(EnvNameValidator),
        Box::new(EmulationValidator),
        Box::new(UploadValidator),
    ];

    let mut all_warnings = Vec::new();
    for validator in validators {
        let warnings = validator.validate(config, platform);
        tracing::debug!("{}: {} warning(s)", validator.name(), warnings.len());
        all_warnings.extend(warnings);
    }

    all_warnings
}
