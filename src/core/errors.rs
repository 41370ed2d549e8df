// src/core/errors.rs

//! Defines the error type for the reload transaction.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a configuration reload.
///
/// Every variant maps to one abortable step of the transaction. Non-fatal
/// conditions (socket-option adjustments, per-file reopen failures) are
/// logged where they occur and never surface here; a module `init_module`
/// failure after commit terminates the process instead of returning.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("configuration parse error: {0}")]
    Parse(anyhow::Error),

    #[error("module '{module}' configuration failed: {reason}")]
    ModuleConf {
        module: &'static str,
        reason: anyhow::Error,
    },

    #[error("pid file '{path}' error: {source}")]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not set up path '{path}': {source}")]
    Paths {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not open '{path}': {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
}
