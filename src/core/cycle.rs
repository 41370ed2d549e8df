// src/core/cycle.rs

//! The cycle: one generation of server configuration plus every resource
//! bound to it. A cycle is mutable while the reload transaction builds it
//! and immutable once committed; superseded cycles are retired by the
//! sweeper once their connections drain.

use crate::config::CoreConf;
use crate::core::arena::{Pool, PoolObj};
use crate::core::collections::{Array, StableList};
use crate::core::listener::Listener;
use crate::core::log::ErrorLog;
use crate::core::module::{CORE_MODULE_INDEX, ConfBlock};
use crate::core::paths::PathSpec;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// Slab size of the pool backing one cycle.
pub const CYCLE_POOL_SIZE: usize = 16 * 1024;

/// Sentinel for an unused connection slot.
pub const NO_CONNECTION: i32 = -1;

const DEFAULT_PATHS_HINT: usize = 10;
const DEFAULT_OPEN_FILES_HINT: usize = 20;
const DEFAULT_LISTENING_HINT: usize = 10;

/// Lifecycle of a cycle.
///
/// `Building → Parsing → Opening → Committed → Retiring`, or
/// `Building/Parsing/Opening → Aborted` when the transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CycleState {
    Building = 0,
    Parsing = 1,
    Opening = 2,
    Committed = 3,
    Aborted = 4,
    Retiring = 5,
}

impl CycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Building,
            1 => Self::Parsing,
            2 => Self::Opening,
            3 => Self::Committed,
            4 => Self::Aborted,
            _ => Self::Retiring,
        }
    }
}

/// A server-managed writable file with stable identity across reloads.
///
/// The entry itself never moves (the registry hands out `Arc`s); the
/// descriptor behind the mutex is swapped by the reload transaction or by
/// the reopen operation, and the name can be re-pointed in place while a
/// configuration directive claims the entry for another path.
#[derive(Debug)]
pub struct OpenFile {
    /// `None` is the placeholder sentinel: the entry is skipped by the
    /// open and reopen loops.
    name: Mutex<Option<PathBuf>>,
    fd: Mutex<Option<OwnedFd>>,
}

impl OpenFile {
    pub fn new(name: Option<PathBuf>) -> Self {
        Self {
            name: Mutex::new(name),
            fd: Mutex::new(None),
        }
    }

    pub fn name(&self) -> Option<PathBuf> {
        self.name.lock().clone()
    }

    /// Re-points the entry at another path. The descriptor is not touched;
    /// the next open or reopen uses the new name.
    pub fn set_name(&self, name: Option<PathBuf>) {
        *self.name.lock() = name;
    }

    /// Opens the file read/write in append mode, create-or-open, with
    /// close-on-exec, and installs the descriptor.
    pub fn open_for_append(&self) -> io::Result<()> {
        let Some(name) = self.name() else {
            return Ok(());
        };
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&name)?;
        *self.fd.lock() = Some(OwnedFd::from(file));
        Ok(())
    }

    pub fn fd(&self) -> MutexGuard<'_, Option<OwnedFd>> {
        self.fd.lock()
    }

    pub fn is_open(&self) -> bool {
        self.fd.lock().is_some()
    }

    /// Swaps in a freshly opened descriptor; the previous one is closed.
    pub fn install(&self, fd: OwnedFd) {
        *self.fd.lock() = Some(fd);
    }

    /// Closes the descriptor, if any.
    pub fn close(&self) {
        self.fd.lock().take();
    }
}

/// The worker-facing connection table, installed by the serving layer
/// after commit. The reload core only ever reads it, to decide whether a
/// retired cycle is quiescent.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Box<[AtomicI32]>,
}

impl ConnectionTable {
    pub fn new(n: usize) -> Self {
        let slots = (0..n).map(|_| AtomicI32::new(NO_CONNECTION)).collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Claims a free slot for the given descriptor. Returns `None` when the
    /// table is full.
    pub fn acquire(&self, fd: i32) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(NO_CONNECTION, fd, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    pub fn release(&self, slot: usize) {
        self.slots[slot].store(NO_CONNECTION, Ordering::Release);
    }

    /// True while any slot holds a live descriptor.
    pub fn live(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.load(Ordering::Acquire) != NO_CONNECTION)
    }
}

/// One configuration generation.
pub struct Cycle {
    pub conf_file: PathBuf,
    pub prefix: PathBuf,

    /// The arena backing this generation: it owns the per-module
    /// configuration blocks and the cycle's cleanup handlers, and is
    /// destroyed with the cycle, cleanups first. Mutable only while the
    /// transaction still holds the cycle exclusively.
    pub pool: Pool,

    pub paths: Array<PathSpec>,
    pub open_files: StableList<Arc<OpenFile>>,
    pub listening: Mutex<Array<Listener>>,

    /// Handles to the per-module configuration blocks inside `pool`,
    /// dense, indexed by module index. Empty on the bootstrap cycle.
    pub conf_ctx: Vec<Option<PoolObj>>,

    /// The predecessor's log while this cycle is under construction;
    /// swapped to `new_log` once the new log files are open.
    pub log: ErrorLog,
    pub new_log: ErrorLog,

    connections: OnceCell<ConnectionTable>,
    state: AtomicU8,
}

impl Cycle {
    /// The generation-zero cycle: no configuration has been parsed yet, so
    /// `conf_ctx` is empty (which is what marks it as the bootstrap) and
    /// logging goes to stderr.
    pub fn bootstrap(conf_file: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            conf_file: conf_file.into(),
            prefix: prefix.into(),
            pool: Pool::new(CYCLE_POOL_SIZE),
            paths: Array::with_capacity(1),
            open_files: StableList::new(1),
            listening: Mutex::new(Array::with_capacity(1)),
            conf_ctx: Vec::new(),
            log: ErrorLog::stderr(),
            new_log: ErrorLog::stderr(),
            connections: OnceCell::new(),
            state: AtomicU8::new(CycleState::Committed as u8),
        })
    }

    /// Starts a fresh cycle from its predecessor: same configuration path
    /// and prefix, collection capacities hinted by the old cycle's counts,
    /// log still pointing at the predecessor's until the new one opens.
    pub fn with_hints(old: &Cycle, pool: Pool, module_count: usize) -> Self {
        let paths_hint = if old.paths.nelts() > 0 {
            old.paths.nelts()
        } else {
            DEFAULT_PATHS_HINT
        };
        let files_hint = if old.open_files.len() > 0 {
            old.open_files.len()
        } else {
            DEFAULT_OPEN_FILES_HINT
        };
        let listening_hint = {
            let old_listening = old.listening.lock();
            if old_listening.nelts() > 0 {
                old_listening.nelts()
            } else {
                DEFAULT_LISTENING_HINT
            }
        };

        let mut conf_ctx = Vec::with_capacity(module_count);
        conf_ctx.resize_with(module_count, || None);

        Self {
            conf_file: old.conf_file.clone(),
            prefix: old.prefix.clone(),
            pool,
            paths: Array::with_capacity(paths_hint),
            open_files: StableList::new(files_hint),
            listening: Mutex::new(Array::with_capacity(listening_hint)),
            conf_ctx,
            log: old.log.clone(),
            new_log: ErrorLog::stderr(),
            connections: OnceCell::new(),
            state: AtomicU8::new(CycleState::Building as u8),
        }
    }

    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The bootstrap cycle is the one that never parsed a configuration.
    pub fn is_bootstrap(&self) -> bool {
        self.conf_ctx.is_empty()
    }

    /// Stores a module's configuration block in this cycle's pool and
    /// records its handle at the module's index.
    pub fn set_conf(&mut self, index: usize, block: ConfBlock) {
        let obj = self.pool.own(block);
        self.conf_ctx[index] = Some(obj);
    }

    /// The configuration block registered at `index`, downcast to its
    /// concrete type.
    pub fn conf<T: 'static>(&self, index: usize) -> Option<&T> {
        let obj = (*self.conf_ctx.get(index)?)?;
        self.pool.get::<T>(obj)
    }

    pub fn conf_mut<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        let obj = (*self.conf_ctx.get(index)?)?;
        self.pool.get_mut::<T>(obj)
    }

    /// Registers an open-file entry, deduplicating by name, and returns a
    /// handle that stays valid while parsing keeps appending entries.
    pub fn register_open_file(&mut self, name: Option<PathBuf>) -> Arc<OpenFile> {
        if let Some(name) = &name {
            for file in self.open_files.iter() {
                if file.name().as_deref() == Some(name.as_path()) {
                    return file.clone();
                }
            }
        }
        let file = Arc::new(OpenFile::new(name));
        self.open_files.push(file.clone());
        file
    }

    /// Creates an error-log object for this cycle, registering its file in
    /// `open_files`. `None` falls back to stderr with no backing file.
    pub fn create_errlog(&mut self, path: Option<PathBuf>) -> ErrorLog {
        match path {
            Some(path) => {
                let path = self.absolute(&path);
                let file = self.register_open_file(Some(path));
                ErrorLog { file: Some(file), level: None }
            }
            None => ErrorLog::stderr(),
        }
    }

    /// Resolves a path against the installation prefix.
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.prefix.join(path)
        }
    }

    /// The core module's resolved configuration block. `None` on the
    /// bootstrap cycle or before `init_conf` has run.
    pub fn core_conf(&self) -> Option<&CoreConf> {
        self.conf::<CoreConf>(CORE_MODULE_INDEX)
    }

    /// Installs the connection table. Called once by the serving layer
    /// after commit; the bootstrap cycle never gets one.
    pub fn install_connections(&self, n: usize) -> &ConnectionTable {
        self.connections.get_or_init(|| ConnectionTable::new(n))
    }

    pub fn connections(&self) -> Option<&ConnectionTable> {
        self.connections.get()
    }

    /// True while any connection accepted under this cycle is still open.
    /// A cycle with no connection table is quiescent by definition.
    pub fn connections_live(&self) -> bool {
        self.connections.get().is_some_and(ConnectionTable::live)
    }
}

impl std::fmt::Debug for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cycle")
            .field("conf_file", &self.conf_file)
            .field("state", &self.state())
            .field("listening", &self.listening.lock().nelts())
            .field("open_files", &self.open_files.len())
            .field("bootstrap", &self.is_bootstrap())
            .finish()
    }
}
