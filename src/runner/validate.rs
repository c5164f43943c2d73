//! Pre-spawn validation of commands and working directories.
//!
//! Everything here runs before a process exists; failures are
//! `ErrorClass::Validation` and are never retried.

use crate::errors::RunnerError;
use std::path::{Path, PathBuf};

/// Reject empty commands and any null byte in the command or its arguments.
///
/// The command itself is reported as index 0; arguments start at 1.
pub fn validate_command(command: &str, args: &[String]) -> Result<(), RunnerError> {
    if command.trim().is_empty() {
        return Err(RunnerError::EmptyCommand);
    }
    if command.contains('\0') {
        return Err(RunnerError::NullByte { index: 0 });
    }
    if let Some(pos) = args.iter().position(|a| a.contains('\0')) {
        return Err(RunnerError::NullByte { index: pos + 1 });
    }
    Ok(())
}

/// Canonicalize `dir` and make sure it lies inside `allowed_root`.
///
/// The root itself is accepted. With no root configured any existing
/// directory is accepted.
pub fn resolve_working_dir(dir: &Path, allowed_root: Option<&Path>) -> Result<PathBuf, RunnerError> {
    let canonical = dir
        .canonicalize()
        .map_err(|e| RunnerError::InvalidWorkingDir {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !canonical.is_dir() {
        return Err(RunnerError::InvalidWorkingDir {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    if let Some(root) = allowed_root {
        let root = root
            .canonicalize()
            .map_err(|e| RunnerError::InvalidWorkingDir {
                path: root.to_path_buf(),
                reason: format!("allowed root cannot be resolved: {}", e),
            })?;
        if !canonical.starts_with(&root) {
            return Err(RunnerError::InvalidWorkingDir {
                path: dir.to_path_buf(),
                reason: "outside the allowed root".to_string(),
            });
        }
    }

    Ok(canonical)
}
