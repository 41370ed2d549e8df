// src/config.rs

//! Configuration loading: the TOML document, the core module's directive
//! surface, and the dispatch that hands the parsed document to every
//! registered module's `parse` hook.

use crate::core::cycle::Cycle;
use crate::core::listener::Listener;
use crate::core::log::LogLevel;
use crate::core::module::{ConfBlock, Module, ModuleKind, ModuleRegistry};
use crate::core::paths::PathSpec;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Compile-time default for the pid file, relative to the prefix.
pub const PID_PATH_DEFAULT: &str = "run/gyre.pid";

/// Compile-time default for the error log, relative to the prefix. This
/// entry is always registered and opened, even when `error_log` points the
/// log elsewhere.
pub const ERROR_LOG_DEFAULT: &str = "logs/error.log";

/// Suffix of the pid file written while running as the child of a
/// binary-upgrade parent.
pub const NEWPID_SUFFIX: &str = ".newbin";

fn default_backlog() -> i32 {
    511
}
fn default_worker_connections() -> usize {
    512
}
fn default_post_accept_timeout() -> Duration {
    Duration::from_secs(60)
}

/// One `[[listen]]` entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ListenConf {
    pub addr: SocketAddr,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub deferred_accept: bool,
    #[serde(default)]
    pub accept_filter: Option<String>,
    #[serde(
        default = "default_post_accept_timeout",
        with = "humantime_serde"
    )]
    pub post_accept_timeout: Duration,
}

/// One `[[path]]` entry: a directory to ensure exists, with an optional
/// mode applied on creation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PathConf {
    pub path: PathBuf,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// The raw core-module block as deserialized from the document, before
/// defaults are applied. Unknown keys belong to other modules and are
/// ignored here.
#[derive(Deserialize, Debug, Default)]
struct RawCoreConf {
    pid: Option<PathBuf>,
    user: Option<u32>,
    error_log: Option<PathBuf>,
    log_level: Option<String>,
    worker_connections: Option<usize>,
    #[serde(default)]
    listen: Vec<ListenConf>,
    #[serde(default)]
    path: Vec<PathConf>,
}

/// The resolved core-module configuration, stored in
/// `cycle.conf_ctx[CORE_MODULE_INDEX]` once `init_conf` has run.
#[derive(Debug, Clone)]
pub struct CoreConf {
    /// Pid file path, prefix-resolved.
    pub pid: PathBuf,
    /// Pid file path used during binary-upgrade handoff.
    pub newpid: PathBuf,
    /// Numeric uid log files are chowned to; `None` is the unset sentinel.
    pub user: Option<u32>,
    pub error_log: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
    pub worker_connections: usize,
    pub listen: Vec<ListenConf>,
    pub paths: Vec<PathConf>,
}

impl CoreConf {
    fn validate(&self) -> Result<()> {
        if self.worker_connections == 0 {
            return Err(anyhow!("worker_connections cannot be 0"));
        }
        for lc in &self.listen {
            if lc.backlog <= 0 {
                return Err(anyhow!("listen {}: backlog must be positive", lc.addr));
            }
        }
        for (i, lc) in self.listen.iter().enumerate() {
            if self.listen[..i].iter().any(|other| other.addr == lc.addr) {
                return Err(anyhow!("duplicate listen address {}", lc.addr));
            }
        }
        Ok(())
    }
}

/// The built-in core module: owns the main configuration block and turns
/// it into the cycle's listener set, path set, and error log.
pub fn core_module() -> Module {
    Module {
        name: "core",
        kind: ModuleKind::Core,
        create_conf: Some(core_create_conf),
        parse: Some(core_parse),
        init_conf: Some(core_init_conf),
        init_module: None,
    }
}

fn core_create_conf(_cycle: &mut Cycle) -> Result<ConfBlock> {
    Ok(Box::new(RawCoreConf::default()))
}

fn core_parse(cycle: &mut Cycle, doc: &toml::Table, index: usize) -> Result<()> {
    let raw: RawCoreConf = doc
        .clone()
        .try_into()
        .context("invalid core configuration")?;
    cycle.set_conf(index, Box::new(raw));
    Ok(())
}

fn core_init_conf(cycle: &mut Cycle, index: usize) -> Result<()> {
    let raw = cycle
        .conf_mut::<RawCoreConf>(index)
        .ok_or_else(|| anyhow!("core configuration block has the wrong type"))?;
    let raw = std::mem::take(raw);

    let pid = cycle.absolute(&raw.pid.unwrap_or_else(|| PathBuf::from(PID_PATH_DEFAULT)));
    let mut newpid = pid.clone().into_os_string();
    newpid.push(NEWPID_SUFFIX);

    let log_level = match &raw.log_level {
        Some(s) => Some(
            LogLevel::parse(s).ok_or_else(|| anyhow!("unknown log_level '{s}'"))?,
        ),
        None => None,
    };

    let conf = CoreConf {
        pid,
        newpid: PathBuf::from(newpid),
        user: raw.user,
        error_log: raw.error_log.clone(),
        log_level,
        worker_connections: raw.worker_connections.unwrap_or_else(default_worker_connections),
        listen: raw.listen,
        paths: raw.path,
    };
    conf.validate()?;

    if let Some(path) = &conf.error_log {
        // The error-log entry already exists under its compile-time
        // default name; the directive re-points that same entry rather
        // than registering a second file.
        let path = cycle.absolute(path);
        if let Some(file) = &cycle.new_log.file {
            file.set_name(Some(path));
        }
    }
    cycle.new_log.level = conf.log_level;

    {
        let mut listening = cycle.listening.lock();
        for lc in &conf.listen {
            listening.push(Listener::from_conf(lc));
        }
    }
    for pc in &conf.paths {
        let path = cycle.absolute(&pc.path);
        cycle.paths.push(PathSpec {
            path,
            mode: pc.mode,
        });
    }

    cycle.set_conf(index, Box::new(conf));
    Ok(())
}

/// Reads and parses the cycle's configuration file, dispatching the
/// document to every core-typed module's `parse` hook in registration
/// order. Each hook populates its own block in `cycle.conf_ctx`.
pub fn parse(cycle: &mut Cycle, registry: &ModuleRegistry) -> Result<()> {
    let conf_file = cycle.absolute(&cycle.conf_file.clone());
    let text = fs::read_to_string(&conf_file)
        .with_context(|| format!("failed to read configuration file '{}'", conf_file.display()))?;
    let doc: toml::Table = text
        .parse()
        .with_context(|| format!("failed to parse '{}'", conf_file.display()))?;

    for (i, module) in registry.iter().enumerate() {
        if module.kind != ModuleKind::Core {
            continue;
        }
        let Some(parse) = module.parse else {
            continue;
        };
        if cycle.conf_ctx[i].is_none() {
            continue;
        }
        parse(cycle, &doc, i).with_context(|| format!("in module '{}'", module.name))?;
    }
    Ok(())
}
