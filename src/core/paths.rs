// src/core/paths.rs

//! On-disk paths a configuration declares: directories that must exist
//! before the cycle can serve, created with a configured mode and owner.

use crate::core::collections::Array;
use crate::core::errors::CycleError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::debug;

/// A directory to ensure-exists, with ownership and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub path: PathBuf,
    pub mode: Option<u32>,
}

/// Creates every configured path, applying the mode and chowning to the
/// configured user where set.
pub fn create_paths(paths: &Array<PathSpec>, user: Option<u32>) -> Result<(), CycleError> {
    for spec in paths.iter() {
        let fail = |source: std::io::Error| CycleError::Paths {
            path: spec.path.clone(),
            source,
        };

        fs::create_dir_all(&spec.path).map_err(fail)?;
        debug!("created path {:?}", spec.path);

        if let Some(mode) = spec.mode {
            fs::set_permissions(&spec.path, fs::Permissions::from_mode(mode)).map_err(fail)?;
        }
        if let Some(uid) = user {
            std::os::unix::fs::chown(&spec.path, Some(uid), None).map_err(fail)?;
        }
    }
    Ok(())
}
