// src/core/log.rs

//! The file-backed error log attached to a cycle.
//!
//! Structured logging goes through `tracing`; the error-log object exists
//! so the server owns a concrete descriptor that survives reloads, can be
//! rotated in place, and can be dup2'ed over stderr so that uncontrolled
//! writes from the process land in the log file.

use crate::core::cycle::OpenFile;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::error;

/// Severity attached to a cycle's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Emerg,
    Alert,
    Err,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "emerg" => Some(Self::Emerg),
            "alert" => Some(Self::Alert),
            "error" | "err" => Some(Self::Err),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

/// An error-log handle: an open-file entry plus a level.
///
/// Cloning shares the underlying file entry, which is how a new cycle
/// points at its predecessor's log while it is still being built.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    /// `None` means the log goes to stderr and owns no file.
    pub file: Option<Arc<OpenFile>>,
    pub level: Option<LogLevel>,
}

impl ErrorLog {
    /// A log with no backing file; writes stay on stderr.
    pub fn stderr() -> Self {
        Self {
            file: None,
            level: None,
        }
    }

    pub fn level_or_default(&self) -> LogLevel {
        self.level.unwrap_or(LogLevel::Err)
    }
}

/// Redirects the standard-error stream onto the log's descriptor, so that
/// libraries and the runtime writing to fd 2 land in the error log.
/// Returns false if the dup2 call itself failed.
pub fn redirect_stderr(log: &ErrorLog) -> bool {
    let Some(file) = &log.file else {
        return true;
    };
    let guard = file.fd();
    let Some(fd) = guard.as_ref().map(|f| f.as_raw_fd()) else {
        return true;
    };
    if fd == libc::STDERR_FILENO {
        return true;
    }
    let rc = unsafe { libc::dup2(fd, libc::STDERR_FILENO) };
    if rc == -1 {
        error!(
            "dup2(STDERR) failed: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}
