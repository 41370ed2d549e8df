// src/core/pidfile.rs

//! Pid-file lifecycle around reload. The file on disk names the currently
//! serving generation; a reload that keeps the same path leaves it alone.

use crate::core::cycle::Cycle;
use crate::core::errors::CycleError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Picks the pid path for a cycle: the `newpid` variant while running as
/// the child of a binary-upgrade parent, the plain path otherwise.
fn pid_path(inherited: bool, cycle: &Cycle) -> Option<PathBuf> {
    let ccf = cycle.core_conf()?;
    if inherited && std::os::unix::process::parent_id() > 1 {
        Some(ccf.newpid.clone())
    } else {
        Some(ccf.pid.clone())
    }
}

/// Writes the current process id to the configured pid file and removes
/// the predecessor's file.
///
/// No-ops: the predecessor is the bootstrap cycle (the daemonized pid is
/// not known yet), or the predecessor's configured path equals the new
/// one. In test-config mode the file is opened but neither truncated nor
/// written.
pub fn create_pidfile(
    test_config: bool,
    inherited: bool,
    cycle: &Cycle,
    old: Option<&Cycle>,
) -> Result<(), CycleError> {
    if !test_config && old.is_some_and(Cycle::is_bootstrap) {
        return Ok(());
    }

    let Some(path) = pid_path(inherited, cycle) else {
        return Ok(());
    };

    if !test_config
        && let Some(old) = old
        && let Some(old_ccf) = old.core_conf()
        && let Some(ccf) = cycle.core_conf()
        && old_ccf.pid == ccf.pid
    {
        // Same pid file name; nothing to rewrite.
        return Ok(());
    }

    let fail = |source: std::io::Error| CycleError::Pidfile {
        path: path.clone(),
        source,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(!test_config)
        .open(&path)
        .map_err(fail)?;

    if !test_config {
        writeln!(file, "{}", std::process::id()).map_err(fail)?;
        debug!("wrote pid file {:?}", path);
    }
    drop(file);

    if let Some(old) = old {
        delete_pidfile(inherited, old);
    }
    Ok(())
}

/// Removes the pid file configured on `cycle`, choosing the `newpid`
/// variant under the same inheritance condition as `create_pidfile`.
/// A bootstrap cycle has no pid file and is skipped.
pub fn delete_pidfile(inherited: bool, cycle: &Cycle) {
    if cycle.is_bootstrap() {
        return;
    }
    let Some(path) = pid_path(inherited, cycle) else {
        return;
    };
    remove(&path);
}

fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("could not delete pid file {:?}: {}", path, e);
    }
}
