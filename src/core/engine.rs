// src/core/engine.rs

//! The commit coordinator: builds a new cycle from the configuration on
//! disk, acquires every resource it implies, and either publishes it as
//! the current generation or rolls back leaving the previous generation
//! untouched.

use crate::config;
use crate::core::arena::Pool;
use crate::core::cycle::{CYCLE_POOL_SIZE, Cycle, CycleState};
use crate::core::errors::CycleError;
use crate::core::inherit;
use crate::core::listener;
use crate::core::log::{LogLevel, redirect_stderr};
use crate::core::module::{ModuleKind, ModuleRegistry};
use crate::core::paths;
use crate::core::pidfile;
use crate::core::sweeper::RetiredCycles;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default cadence of the retirement sweeper.
pub const SWEEP_INTERVAL_DEFAULT: Duration = Duration::from_secs(30);

/// Which role this process plays. A supervisor never keeps connections of
/// its own, so its superseded cycles are released without retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Master,
    Worker,
    Single,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Dry-run: parse and open files, but bind no sockets, truncate no pid
    /// file, and commit nothing.
    pub test_config: bool,
    pub role: ProcessRole,
    /// Set when this process was started by a binary-upgrade parent and
    /// must use the `newpid` pid-file variant.
    pub inherited: bool,
    /// How often the retirement sweeper checks superseded cycles.
    pub sweep_interval: Duration,
    /// Slab size of the pool created for each new cycle.
    pub pool_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            test_config: false,
            role: ProcessRole::Single,
            inherited: false,
            sweep_interval: SWEEP_INTERVAL_DEFAULT,
            pool_size: CYCLE_POOL_SIZE,
        }
    }
}

/// Owns the process-wide reload state: the module table, the current-cycle
/// publication slot, and the retirement list.
pub struct Engine {
    registry: ModuleRegistry,
    options: EngineOptions,
    current: RwLock<Arc<Cycle>>,
    pub(crate) retired: Mutex<Option<RetiredCycles>>,
}

impl Engine {
    pub fn new(registry: ModuleRegistry, options: EngineOptions, bootstrap: Arc<Cycle>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            options,
            current: RwLock::new(bootstrap),
            retired: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The currently serving cycle. Readers may observe a generation that
    /// a concurrent commit is about to supersede; it stays valid for as
    /// long as they hold the handle.
    pub fn current(&self) -> Arc<Cycle> {
        self.current.read().clone()
    }

    /// The reload transaction.
    ///
    /// Returns the committed cycle, `Ok(None)` after a successful
    /// test-config dry run, or an error after a full rollback. On any
    /// error the old cycle keeps serving: its descriptors and pool are
    /// untouched.
    ///
    /// A module `init_module` failure after commit terminates the process;
    /// the new generation is already visible and cannot be unwound.
    pub fn init_cycle(
        self: &Arc<Self>,
        old: &Arc<Cycle>,
    ) -> Result<Option<Arc<Cycle>>, CycleError> {
        let test_config = self.options.test_config;

        let pool = Pool::new(self.options.pool_size);
        let mut cycle = Cycle::with_hints(old, pool, self.registry.len());
        cycle.new_log = cycle.create_errlog(Some(PathBuf::from(config::ERROR_LOG_DEFAULT)));

        let origin = cycle.conf_file.display().to_string();
        cycle
            .pool
            .cleanup_add(move || debug!("released the resources of the cycle from {origin}"));

        for (i, module) in self.registry.iter().enumerate() {
            if module.kind != ModuleKind::Core {
                continue;
            }
            if let Some(create_conf) = module.create_conf {
                match create_conf(&mut cycle) {
                    Ok(block) => cycle.set_conf(i, block),
                    Err(reason) => {
                        cycle.set_state(CycleState::Aborted);
                        return Err(CycleError::ModuleConf {
                            module: module.name,
                            reason,
                        });
                    }
                }
            }
        }
        cycle.set_state(CycleState::Parsing);

        if let Err(source) = config::parse(&mut cycle, &self.registry) {
            cycle.set_state(CycleState::Aborted);
            return Err(CycleError::Parse(source));
        }
        if test_config {
            info!(
                "the configuration file {} syntax is ok",
                cycle.conf_file.display()
            );
        }

        for (i, module) in self.registry.iter().enumerate() {
            if module.kind != ModuleKind::Core {
                continue;
            }
            let Some(init_conf) = module.init_conf else {
                continue;
            };
            if cycle.conf_ctx[i].is_none() {
                continue;
            }
            if let Err(reason) = init_conf(&mut cycle, i) {
                cycle.set_state(CycleState::Aborted);
                return Err(CycleError::ModuleConf {
                    module: module.name,
                    reason,
                });
            }
        }
        cycle.set_state(CycleState::Opening);

        // Resource acquisition. The first failure is recorded and the
        // remaining steps are skipped; cleanup still runs below.
        let mut failure: Option<CycleError> = None;

        if let Err(e) =
            pidfile::create_pidfile(test_config, self.options.inherited, &cycle, Some(old.as_ref()))
        {
            failure = Some(e);
        }

        let user = cycle.core_conf().and_then(|c| c.user);

        if failure.is_none()
            && let Err(e) = paths::create_paths(&cycle.paths, user)
        {
            failure = Some(e);
        }

        if failure.is_none() {
            // open the new files
            for file in cycle.open_files.iter() {
                let Some(name) = file.name() else {
                    continue;
                };
                if let Err(source) = file.open_for_append() {
                    error!("could not open {:?}: {}", name, source);
                    failure = Some(CycleError::OpenFile { path: name, source });
                    break;
                }
                debug!("opened file {:?}", name);
            }
        }

        if failure.is_none() {
            // handle the listening sockets
            let mut old_listening = old.listening.lock();
            let mut new_listening = cycle.listening.lock();
            inherit::inherit_listeners(
                old_listening.as_mut_slice(),
                new_listening.as_mut_slice(),
            );
            drop(old_listening);

            if !test_config {
                match listener::open_listening_sockets(new_listening.as_mut_slice()) {
                    Ok(()) => listener::apply_deferred_accept(new_listening.as_mut_slice()),
                    Err(e) => failure = Some(e),
                }
            }
        }

        cycle.log = cycle.new_log.clone();
        if cycle.log.level.is_none() {
            cycle.log.level = Some(LogLevel::Err);
        }

        if let Some(failure) = failure {
            rollback(&cycle, test_config);
            cycle.set_state(CycleState::Aborted);
            return Err(failure);
        }

        if test_config {
            // A dry run never commits; release everything it opened.
            for file in cycle.open_files.iter() {
                file.close();
            }
            return Ok(None);
        }

        // commit the new cycle configuration

        if !redirect_stderr(&cycle.log) {
            // The previous stderr target may already be gone; there is no
            // state left to continue from.
            std::process::exit(1);
        }

        cycle.set_state(CycleState::Committed);
        let cycle = Arc::new(cycle);
        *self.current.write() = cycle.clone();

        for module in self.registry.iter() {
            if let Some(init_module) = module.init_module
                && let Err(e) = init_module(&cycle)
            {
                error!("module '{}' initialization failed: {}", module.name, e);
                std::process::exit(1);
            }
        }

        info!("configuration committed from {}", cycle.conf_file.display());

        // close and delete what is left from the old cycle

        {
            let mut old_listening = old.listening.lock();
            for ls in old_listening.iter_mut() {
                if ls.remain {
                    continue;
                }
                if let Some(fd) = ls.fd.take() {
                    debug!("closing old listener {}", ls.addr_text);
                    drop(fd);
                }
            }
        }

        for file in old.open_files.iter() {
            file.close();
        }

        if old.connections().is_none() {
            // The old cycle never served a connection; nothing can still
            // reference it.
            debug!("releasing predecessor cycle immediately");
        } else if self.options.role == ProcessRole::Master {
            debug!("releasing predecessor cycle immediately (supervisor)");
        } else {
            self.retire(old.clone());
        }

        Ok(Some(cycle))
    }
}

/// Rolls the failed transaction back: every file and every socket this
/// attempt opened is closed. Inherited descriptors are shared with the old
/// cycle and survive.
fn rollback(cycle: &Cycle, test_config: bool) {
    debug!("rolling back the new cycle configuration");

    for file in cycle.open_files.iter() {
        if file.is_open() {
            file.close();
        }
    }

    if test_config {
        return;
    }

    let mut listening = cycle.listening.lock();
    for ls in listening.iter_mut() {
        if !ls.open {
            continue;
        }
        if let Some(fd) = ls.fd.take() {
            debug!("closing listener {} after failed reload", ls.addr_text);
            drop(fd);
        }
    }
}
