pub mod coverage;
pub mod list;
pub mod matrix;
pub mod run;
pub mod show;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::cli::GlobalOpts;
use crate::config::{CONFIG_FILE_NAME, Config, ConfigSource};
use crate::logging::Log;
use crate::platform::Platform;

/// Shared state produced by the common command setup sequence.
///
/// Encapsulates root discovery, platform detection and configuration
/// loading so that each command does not have to repeat the boilerplate.
#[derive(Debug)]
pub struct CommandSetup {
    pub platform: Platform,
    pub config: Config,
}

impl CommandSetup {
    /// Locate the repository, load its configuration and report warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be determined or the
    /// configuration fails to load.
    pub fn init(global: &GlobalOpts, log: &dyn Log) -> Result<Self> {
        log.stage("Loading configuration");
        let Self { platform, config } = Self::load(global)?;
        match &config.source {
            ConfigSource::File(path) => log.info(&format!("config: {}", path.display())),
            ConfigSource::Builtin => {
                log.info(&format!("no {CONFIG_FILE_NAME} found, using built-in definitions"));
            }
        }
        log.debug(&format!("root: {}", config.root.display()));
        log.debug(&format!("{} factors", config.registry.len()));
        log.debug(&format!("platform: {} {}", platform.os, platform.arch));

        let warnings = config.validate(&platform);
        if !warnings.is_empty() {
            log.warn(&format!(
                "found {} configuration warning(s):",
                warnings.len()
            ));
            for warning in &warnings {
                log.warn(&format!(
                    "  {} [{}]: {}",
                    warning.source, warning.item, warning.message
                ));
            }
        }

        Ok(Self { platform, config })
    }

    /// Locate the repository and load its configuration without logging.
    ///
    /// # Errors
    ///
    /// See [`init`](Self::init).
    pub fn load(global: &GlobalOpts) -> Result<Self> {
        let platform = Platform::detect();
        let root = resolve_root(global)?;
        let config = Config::load(&root, global.config.as_deref())?;
        Ok(Self { platform, config })
    }
}

/// Resolve the repository root.
///
/// Order: `--root`, `ENVMATRIX_ROOT`, the nearest ancestor of the current
/// directory containing `envmatrix.toml`, then the current directory itself.
///
/// # Errors
///
/// Returns an error if an explicit root does not exist or the current
/// directory is unavailable.
pub fn resolve_root(global: &GlobalOpts) -> Result<PathBuf> {
    let explicit = global
        .root
        .clone()
        .or_else(|| std::env::var_os("ENVMATRIX_ROOT").map(PathBuf::from));
    if let Some(root) = explicit {
        return dunce::canonicalize(&root)
            .with_context(|| format!("repository root {} does not exist", root.display()));
    }

    let cwd = std::env::current_dir().context("cannot read the current directory")?;
    let cwd = dunce::canonicalize(&cwd).unwrap_or(cwd);
    Ok(find_root(&cwd).unwrap_or(cwd))
}

/// Nearest ancestor of `start` (inclusive) containing `envmatrix.toml`.
#[must_use]
pub fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE_NAME).is_file())
        .map(Path::to_path_buf)
}

/// Number of concurrent runs: 1 with `--no-parallel`, otherwise `requested`
/// or the available parallelism.
#[must_use]
pub fn job_count(global: &GlobalOpts, requested: Option<usize>) -> usize {
    if !global.parallel {
        return 1;
    }
    requested
        .unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
        .max(1)
}
