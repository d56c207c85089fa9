use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tempfile::TempDir;

/// Isolated working directory of one run.
///
/// Removed when dropped, including after a failed or cancelled run, unless
/// [`keep`](Self::keep) is called.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    tmp: PathBuf,
}

impl Workspace {
    /// Create a fresh directory for `env` under `parent` (or the system
    /// temporary directory), with an empty `tmp/` inside.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn create(parent: Option<&Path>, env: &str) -> Result<Self> {
        let prefix = format!("envmatrix-{env}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .context("creating working directory")?;
        let tmp = dir.path().join("tmp");
        fs::create_dir(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        Ok(Self { dir, tmp })
    }

    /// The working directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Scratch directory; `{tmpdir}` in templates.
    #[must_use]
    pub fn tmp(&self) -> &Path {
        &self.tmp
    }

    /// Stop automatic removal and return the path.
    #[must_use]
    pub fn keep(self) -> PathBuf {
        self.dir.keep()
    }
}
