//! TOML configuration file parsing.
use serde::de::DeserializeOwned;
use std::path::Path;

use crate::error::ConfigError;

/// Parse `content` as TOML into `T`.
///
/// `origin` names the source in error messages (a path, or `<built-in>`).
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSyntax`] if the document is not valid TOML
/// or does not match `T`.
pub fn parse_str<T: DeserializeOwned>(content: &str, origin: &str) -> Result<T, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::InvalidSyntax {
        file: origin.to_string(),
        message: e.message().to_string(),
    })
}

/// Load and deserialize a TOML file.
///
/// Returns `Ok(None)` when the file does not exist so callers can fall back
/// to built-in defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse_str(&content, &path.display().to_string()).map(Some)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<BTreeMap<String, String>> =
            load_file(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn existing_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.toml");
        std::fs::write(&path, "key = \"value\"\n").unwrap();
        let loaded: Option<BTreeMap<String, String>> = load_file(&path).unwrap();
        assert_eq!(loaded.unwrap().get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn syntax_error_names_the_origin() {
        let err = parse_str::<BTreeMap<String, String>>("key = ", "envmatrix.toml").unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidSyntax { ref file, .. } if file == "envmatrix.toml"),
            "unexpected error: {err}"
        );
    }
}
