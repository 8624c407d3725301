//! Applying a diff to a file inside the workspace root.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::patch::{self, ApplyMode, PatchError, PatchThresholds, SimilarPatcher};
use crate::core::path::{PathError, resolve_within_root};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("write {path}: {message}")]
    Write { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileApplyOutcome {
    pub path: PathBuf,
    pub mode: ApplyMode,
    /// The file did not exist before the patch.
    pub created: bool,
}

/// Limits applied to every file patch.
#[derive(Debug, Clone, Copy)]
pub struct PatchLimits {
    pub max_file_bytes: u64,
    pub thresholds: PatchThresholds,
}

/// Apply `diff` to `relative` under `root`.
///
/// The file is only rewritten after every hunk succeeded. A missing file is
/// treated as empty so pure-addition diffs can create it.
#[instrument(skip_all, fields(path = relative))]
pub fn apply_patch_file(
    root: &Path,
    relative: &str,
    diff: &str,
    limits: &PatchLimits,
) -> Result<FileApplyOutcome, ApplyError> {
    let path = resolve_within_root(root, relative)?;
    let display = path.display().to_string();

    let (original, created) = match fs::metadata(&path) {
        Ok(meta) => {
            if meta.len() > limits.max_file_bytes {
                warn!(size = meta.len(), "file too large to patch");
                return Err(ApplyError::TooLarge {
                    path: display,
                    size: meta.len(),
                    limit: limits.max_file_bytes,
                });
            }
            let contents = fs::read_to_string(&path).map_err(|source| ApplyError::Read {
                path: display.clone(),
                source,
            })?;
            (contents, false)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => (String::new(), true),
        Err(source) => {
            return Err(ApplyError::Read {
                path: display,
                source,
            });
        }
    };

    let patcher = SimilarPatcher::new(limits.thresholds);
    let outcome = patch::apply_diff(&original, diff, &path, &patcher)?;
    crate::io::write_atomic(&path, &outcome.content).map_err(|err| ApplyError::Write {
        path: display,
        message: format!("{err:#}"),
    })?;

    info!(mode = ?outcome.mode, created, "patch applied");
    Ok(FileApplyOutcome {
        path,
        mode: outcome.mode,
        created,
    })
}
