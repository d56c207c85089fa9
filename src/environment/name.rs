//! Parsing of `factor[-factor]*` environment names.
use std::fmt;

use crate::error::ConfigError;

/// A parsed environment name: an ordered, duplicate-free list of factors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvName {
    raw: String,
    factors: Vec<String>,
}

impl EnvName {
    /// Parse an environment name, left to right.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedEnvName`] for an empty name, an empty
    /// factor (`a--b`, leading or trailing `-`), a factor with characters
    /// other than ASCII letters, digits and `_`, or a repeated factor.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::MalformedEnvName {
            name: raw.to_string(),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(malformed("name is empty".to_string()));
        }

        let mut factors: Vec<String> = Vec::new();
        for token in raw.split('-') {
            if token.is_empty() {
                return Err(malformed("empty factor".to_string()));
            }
            if let Some(bad) = token
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
            {
                return Err(malformed(format!("invalid character '{bad}' in '{token}'")));
            }
            if factors.iter().any(|f| f == token) {
                return Err(malformed(format!("factor '{token}' repeated")));
            }
            factors.push(token.to_string());
        }

        Ok(Self {
            raw: raw.to_string(),
            factors,
        })
    }

    /// The name as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Factor tokens in declaration order.
    #[must_use]
    pub fn factors(&self) -> &[String] {
        &self.factors
    }
}

impl fmt::Display for EnvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
