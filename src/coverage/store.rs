use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use super::CoverageData;
use crate::error::CoverageError;

/// Name of the combined data file inside the artifact directory.
pub const COMBINED_FILE: &str = "coverage.json";

const ARTIFACT_PREFIX: &str = ".coverage.";
const CORRUPT_SUFFIX: &str = ".corrupt";
/// First bytes of the measuring tool's native data files.
const TOOL_DATABASE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Turns one of the measuring tool's native data files into coverage data.
pub trait Convert {
    /// Decode `database`.
    ///
    /// # Errors
    ///
    /// Returns [`CoverageError::Conversion`] when the tool is unavailable or
    /// rejects the file.
    fn convert(&self, database: &Path) -> Result<CoverageData, CoverageError>;
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CoverageError + '_ {
    move |source| CoverageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Result of [`ArtifactStore::combine`].
#[derive(Debug, Clone, Default)]
pub struct CombineResult {
    /// Combined data, including anything combined earlier.
    pub data: CoverageData,
    /// Artifacts merged and deleted.
    pub consumed: Vec<PathBuf>,
    /// Undecodable artifacts, renamed with a `.corrupt` suffix.
    pub corrupt: Vec<PathBuf>,
    /// Native tool databases that could not be converted; left in place
    /// for a later combine.
    pub pending: Vec<PathBuf>,
}

/// The shared coverage artifact directory.
///
/// Runs only ever create files with unique names, so concurrent runs never
/// write the same path. Combination must happen after every contributing run
/// has finished.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// A store rooted at `dir` (created lazily).
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The artifact directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve the artifact path for one run, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns [`CoverageError::Io`] if the directory cannot be created.
    pub fn allocate(&self, env: &str, run_id: &str) -> Result<PathBuf, CoverageError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        Ok(self.dir.join(format!("{ARTIFACT_PREFIX}{env}.{run_id}")))
    }

    /// Data files written under the name reserved by [`allocate`]: the name
    /// itself and any `<name>.<suffix>` the measuring tool added.
    ///
    /// [`allocate`]: Self::allocate
    ///
    /// # Errors
    ///
    /// Returns [`CoverageError::Io`] if the directory cannot be listed.
    pub fn produced_under(&self, reserved: &Path) -> Result<Vec<PathBuf>, CoverageError> {
        let Some(reserved) = reserved.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(Vec::new());
        };
        let suffixed = format!("{reserved}.");
        Ok(self
            .artifacts()?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|name| name == reserved || name.starts_with(&suffixed))
            })
            .collect())
    }

    /// Uncombined artifacts, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoverageError::Io`] if the directory cannot be listed.
    pub fn artifacts(&self) -> Result<Vec<PathBuf>, CoverageError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(ARTIFACT_PREFIX)
                && !name.ends_with(CORRUPT_SUFFIX)
                && entry.path().is_file()
            {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Path of the combined data file.
    #[must_use]
    pub fn combined_path(&self) -> PathBuf {
        self.dir.join(COMBINED_FILE)
    }

    /// Previously combined data; empty when nothing was combined yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load_combined(&self) -> Result<CoverageData, CoverageError> {
        let path = self.combined_path();
        if !path.exists() {
            return Ok(CoverageData::default());
        }
        read_data(&path)
    }

    /// Merge every JSON artifact into the combined file and delete the
    /// merged artifacts. Native tool databases stay pending.
    ///
    /// # Errors
    ///
    /// See [`combine_with`](Self::combine_with).
    pub fn combine(&self) -> Result<CombineResult, CoverageError> {
        self.combine_with(None)
    }

    /// Merge every artifact into the combined file and delete the merged
    /// artifacts, decoding native tool databases with `converter`.
    ///
    /// Zero artifacts yields the existing (possibly empty) data and writes
    /// nothing, so calling this twice is harmless. Corrupt artifacts, and a
    /// corrupt combined file, are set aside with a `.corrupt` suffix; a
    /// database the converter cannot handle stays pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or written.
    pub fn combine_with(
        &self,
        converter: Option<&dyn Convert>,
    ) -> Result<CombineResult, CoverageError> {
        let mut result = CombineResult::default();
        match self.load_combined() {
            Ok(data) => result.data = data,
            Err(CoverageError::Corrupt { .. }) => {
                result.corrupt.push(set_aside(&self.combined_path())?);
            }
            Err(e) => return Err(e),
        }

        for path in self.artifacts()? {
            let decoded = if is_tool_database(&path)? {
                let Some(converter) = converter else {
                    result.pending.push(path);
                    continue;
                };
                converter.convert(&path)
            } else {
                read_data(&path)
            };
            match decoded {
                Ok(data) => {
                    result.data.merge(&data);
                    result.consumed.push(path);
                }
                Err(CoverageError::Corrupt { .. }) => result.corrupt.push(set_aside(&path)?),
                Err(CoverageError::Conversion { .. }) => result.pending.push(path),
                Err(e) => return Err(e),
            }
        }

        if result.consumed.is_empty() {
            return Ok(result);
        }

        self.write_combined(&result.data)?;
        for path in &result.consumed {
            fs::remove_file(path).map_err(io_error(path))?;
        }
        Ok(result)
    }

    /// Atomically replace the combined file.
    fn write_combined(&self, data: &CoverageData) -> Result<(), CoverageError> {
        let target = self.combined_path();
        let json = serde_json::to_vec_pretty(data).map_err(|e| CoverageError::Corrupt {
            path: target.display().to_string(),
            message: e.to_string(),
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_error(&self.dir))?;
        tmp.write_all(&json).map_err(io_error(tmp.path()))?;
        tmp.persist(&target)
            .map_err(|e| io_error(&target)(e.error))?;
        Ok(())
    }
}

/// Rename `path` with the corrupt suffix so later combines skip it.
fn set_aside(path: &Path) -> Result<PathBuf, CoverageError> {
    let mut renamed = path.to_path_buf().into_os_string();
    renamed.push(CORRUPT_SUFFIX);
    let renamed = PathBuf::from(renamed);
    fs::rename(path, &renamed).map_err(io_error(path))?;
    Ok(renamed)
}

fn is_tool_database(path: &Path) -> Result<bool, CoverageError> {
    let file = fs::File::open(path).map_err(io_error(path))?;
    let mut head = Vec::with_capacity(TOOL_DATABASE_MAGIC.len());
    file.take(TOOL_DATABASE_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .map_err(io_error(path))?;
    Ok(head == TOOL_DATABASE_MAGIC)
}

fn read_data(path: &Path) -> Result<CoverageData, CoverageError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&content).map_err(|e| CoverageError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
