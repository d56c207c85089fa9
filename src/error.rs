//! Domain-specific error types for the environment orchestrator.
//!
//! Library modules return typed errors built with [`thiserror`]; command
//! handlers at the CLI boundary convert them to [`anyhow::Error`] with `?`
//! and `main` maps them back to process exit codes.
//!
//! # Error hierarchy
//!
//! ```text
//! EnvmatrixError
//! ├── Config(ConfigError)     : unknown factor, malformed name, missing tool, bad TOML
//! ├── Coverage(CoverageError) : artifact directory I/O
//! └── Upload(UploadError)     : required coverage destination failed
//! ```
//!
//! A pipeline step exiting non-zero is not an error: it is a
//! [`RunStatus`](crate::engine::RunStatus) carried to the orchestrator.

use thiserror::Error;

/// Exit code used when a failure is a configuration problem rather than a
/// step failure (`EX_CONFIG` from `sysexits.h`).
pub const EXIT_CONFIG: u8 = 78;

/// Exit code reported for a cancelled or timed-out run.
pub const EXIT_CANCELLED: i32 = 130;

/// Top-level error type for the orchestrator.
#[derive(Error, Debug)]
pub enum EnvmatrixError {
    /// Configuration error; detected before any process starts.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Coverage artifact store error.
    #[error("Coverage error: {0}")]
    Coverage(#[from] CoverageError),

    /// Coverage upload error for a required destination.
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

/// Errors raised while loading configuration or resolving environments.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment name references a factor the registry does not define.
    #[error("unknown factor '{factor}' in environment '{env}'")]
    UnknownFactor {
        /// The offending token.
        factor: String,
        /// The full environment name being resolved.
        env: String,
    },

    /// The environment name does not match `factor[-factor]*`.
    #[error("invalid environment name '{name}': {reason}")]
    MalformedEnvName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A program required by a pipeline step is not on `PATH`.
    #[error("environment '{env}' requires '{tool}', which was not found on PATH")]
    MissingTool {
        /// Program name as written in the step.
        tool: String,
        /// Environment whose pipeline needs it.
        env: String,
    },

    /// The configuration file is not valid TOML or has unexpected fields.
    #[error("invalid configuration in {file}: {message}")]
    InvalidSyntax {
        /// File that failed to parse.
        file: String,
        /// Parser message.
        message: String,
    },

    /// An I/O error occurred while reading a configuration file.
    #[error("IO error reading config file {path}: {source}")]
    Io {
        /// Path to the file that could not be read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Errors from the coverage artifact store.
#[derive(Error, Debug)]
pub enum CoverageError {
    /// Reading or writing inside the artifact directory failed.
    #[error("coverage store I/O on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An artifact could not be decoded.
    #[error("corrupt coverage artifact {path}: {message}")]
    Corrupt {
        /// Path of the artifact.
        path: String,
        /// Decoder message.
        message: String,
    },

    /// The measuring tool could not turn its database into a report.
    #[error("cannot convert coverage database {path}: {message}")]
    Conversion {
        /// Path of the database.
        path: String,
        /// What went wrong.
        message: String,
    },
}

/// Errors from uploading coverage to an external destination.
#[derive(Error, Debug)]
pub enum UploadError {
    /// The request could not be delivered.
    #[error("upload to {destination} failed: {message}")]
    Transport {
        /// Destination name from the configuration.
        destination: String,
        /// Transport message.
        message: String,
    },

    /// The destination answered with a non-success status.
    #[error("upload to {destination} rejected with HTTP {status}")]
    Rejected {
        /// Destination name from the configuration.
        destination: String,
        /// HTTP status code.
        status: u16,
    },

    /// The destination requires a token that is not set.
    #[error("upload to {destination} needs ${var}, which is not set")]
    MissingToken {
        /// Destination name from the configuration.
        destination: String,
        /// Environment variable holding the token.
        var: String,
    },
}

impl ConfigError {
    /// Short classification used in run summaries.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownFactor { .. } => "unknown factor",
            Self::MalformedEnvName { .. } => "invalid environment name",
            Self::MissingTool { .. } => "missing tool",
            Self::InvalidSyntax { .. } | Self::Io { .. } => "invalid configuration",
        }
    }
}

/// Map an error that reached `main` to the process exit code.
///
/// Configuration errors anywhere in the chain get [`EXIT_CONFIG`]; everything
/// else is a generic failure.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    let is_config = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<EnvmatrixError>(),
                Some(EnvmatrixError::Config(_))
            )
    });
    if is_config { EXIT_CONFIG } else { 1 }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    // -----------------------------------------------------------------------
    // ConfigError
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_factor_display() {
        let e = ConfigError::UnknownFactor {
            factor: "withcoverage".to_string(),
            env: "alldeps-withcoverage".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "unknown factor 'withcoverage' in environment 'alldeps-withcoverage'"
        );
        assert_eq!(e.kind(), "unknown factor");
    }

    #[test]
    fn malformed_name_display() {
        let e = ConfigError::MalformedEnvName {
            name: "a--b".to_string(),
            reason: "empty factor".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "invalid environment name 'a--b': empty factor"
        );
    }

    #[test]
    fn missing_tool_display() {
        let e = ConfigError::MissingTool {
            tool: "coverage".to_string(),
            env: "withcov".to_string(),
        };
        assert!(e.to_string().contains("'coverage'"));
        assert_eq!(e.kind(), "missing tool");
    }

    #[test]
    fn config_io_has_source() {
        use std::error::Error as StdError;
        let e = ConfigError::Io {
            path: "envmatrix.toml".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // UploadError
    // -----------------------------------------------------------------------

    #[test]
    fn upload_rejected_display() {
        let e = UploadError::Rejected {
            destination: "codecov".to_string(),
            status: 503,
        };
        assert_eq!(e.to_string(), "upload to codecov rejected with HTTP 503");
    }

    #[test]
    fn upload_missing_token_display() {
        let e = UploadError::MissingToken {
            destination: "codecov".to_string(),
            var: "CODECOV_TOKEN".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "upload to codecov needs $CODECOV_TOKEN, which is not set"
        );
    }

    // -----------------------------------------------------------------------
    // Exit code mapping
    // -----------------------------------------------------------------------

    #[test]
    fn config_error_maps_to_exit_config() {
        let err: anyhow::Error = ConfigError::UnknownFactor {
            factor: "x".to_string(),
            env: "x".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn wrapped_config_error_maps_to_exit_config() {
        let err = anyhow::Error::from(ConfigError::MalformedEnvName {
            name: "-".to_string(),
            reason: "empty factor".to_string(),
        })
        .context("resolving environments");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn aggregated_config_error_maps_to_exit_config() {
        let err: anyhow::Error = EnvmatrixError::from(ConfigError::MissingTool {
            tool: "docker".to_string(),
            env: "alldeps".to_string(),
        })
        .into();
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn other_errors_map_to_one() {
        let err: anyhow::Error = UploadError::Transport {
            destination: "codecov".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&err), 1);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<EnvmatrixError>();
        assert_send_sync::<ConfigError>();
        assert_send_sync::<CoverageError>();
        assert_send_sync::<UploadError>();
    }
}
