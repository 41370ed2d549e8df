// src/core/reopen.rs

//! Signal-driven log rotation: re-opens every named open-file in place.
//!
//! Each file is handled independently. When any per-file step fails the
//! freshly opened descriptor is closed again and the old descriptor stays
//! installed, so a file is never left without a usable descriptor.

use crate::core::cycle::Cycle;
use crate::core::log::redirect_stderr;
use std::fs::{self, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, error};

/// Re-opens every registered open-file with a non-empty name, enforcing
/// the configured owner and user-read/write mode bits, then re-points the
/// standard-error stream at the (possibly new) error-log descriptor.
pub fn reopen_files(cycle: &Cycle, user: Option<u32>) {
    for file in cycle.open_files.iter() {
        let Some(name) = file.name() else {
            continue;
        };

        let new_fd = match OpenOptions::new()
            .create(true)
            .append(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&name)
        {
            Ok(f) => OwnedFd::from(f),
            Err(e) => {
                error!("reopen of {:?} failed: {}", name, e);
                continue;
            }
        };

        debug!(
            "reopen file {:?}, old: {:?} new: {}",
            name,
            file.fd().as_ref().map(|f| f.as_raw_fd()),
            new_fd.as_raw_fd()
        );

        if let Some(uid) = user
            && !enforce_owner(&name, uid)
        {
            // The old descriptor stays in place.
            drop(new_fd);
            continue;
        }

        file.install(new_fd);
    }

    redirect_stderr(&cycle.log);
}

/// Makes sure the file at `name` is owned by `uid` and user-readable and
/// -writable. Returns false when any step fails; the failure is logged.
fn enforce_owner(name: &Path, uid: u32) -> bool {
    let meta = match fs::metadata(name) {
        Ok(m) => m,
        Err(e) => {
            error!("stat() {:?} failed: {}", name, e);
            return false;
        }
    };

    if meta.uid() != uid
        && let Err(e) = std::os::unix::fs::chown(name, Some(uid), None)
    {
        error!("chown({:?}, {}) failed: {}", name, uid, e);
        return false;
    }

    let mode = meta.mode();
    let want = (libc::S_IRUSR | libc::S_IWUSR) as u32;
    if mode & want != want
        && let Err(e) = fs::set_permissions(name, fs::Permissions::from_mode(mode | want))
    {
        error!("chmod() {:?} failed: {}", name, e);
        return false;
    }

    true
}
