// src/core/sweeper.rs

//! Deferred destruction of superseded cycles.
//!
//! A worker cannot free an old cycle at commit time: connections accepted
//! under it may still be in flight. Superseded cycles are parked on a
//! process-wide list backed by a small auxiliary pool, and a periodic
//! sweep destroys each one once its connection table shows no live
//! descriptor. When the list drains, the auxiliary pool itself is
//! released.

use crate::core::arena::{Pool, PoolObj};
use crate::core::collections::Array;
use crate::core::cycle::{Cycle, CycleState};
use crate::core::engine::Engine;
use std::sync::Arc;
use tracing::{debug, warn};

/// Slab size of the auxiliary pool backing the retirement list.
const RETIRE_POOL_SIZE: usize = 128;
const RETIRED_HINT: usize = 10;

type RetiredList = Array<Option<Arc<Cycle>>>;

/// The auxiliary pool and the handle of the enqueue list it owns. Exists
/// only while at least one superseded cycle is waiting to drain; dropping
/// the pool releases the list with it.
pub(crate) struct RetiredCycles {
    pool: Pool,
    list: PoolObj,
}

impl RetiredCycles {
    fn new() -> Self {
        let mut pool = Pool::new(RETIRE_POOL_SIZE);
        let list = pool.own(Box::new(RetiredList::with_capacity(RETIRED_HINT)));
        Self { pool, list }
    }

    fn list(&self) -> &RetiredList {
        self.pool
            .get::<RetiredList>(self.list)
            .expect("retirement list lives in its pool")
    }

    fn list_mut(&mut self) -> &mut RetiredList {
        self.pool
            .get_mut::<RetiredList>(self.list)
            .expect("retirement list lives in its pool")
    }
}

impl Engine {
    /// Parks a superseded cycle until its connections drain. Lazily
    /// creates the retirement state and arms the sweeper on first use.
    pub(crate) fn retire(self: &Arc<Self>, old: Arc<Cycle>) {
        old.set_state(CycleState::Retiring);

        let mut retired = self.retired.lock();
        let arm = retired.is_none();
        let state = retired.get_or_insert_with(|| {
            debug!("creating the retirement list");
            RetiredCycles::new()
        });
        state.list_mut().push(Some(old));
        drop(retired);

        if arm {
            self.arm_sweeper();
        }
    }

    fn arm_sweeper(self: &Arc<Self>) {
        let engine = self.clone();
        let interval = self.options().sweep_interval;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(interval).await;
                    engine.sweep_retired();
                });
            }
            Err(_) => {
                warn!("no async runtime; retired cycles are swept on demand only");
            }
        }
    }

    /// Runs one sweep over the retirement list and returns how many cycles
    /// it destroyed. Normally driven by the internal timer; exposed so a
    /// caller can force a deterministic pass.
    pub fn sweep_retired(self: &Arc<Self>) -> usize {
        let mut retired = self.retired.lock();
        let Some(state) = retired.as_mut() else {
            return 0;
        };

        debug!("clean old cycles");

        let mut live = false;
        let mut destroyed = 0;
        for slot in state.list_mut().iter_mut() {
            let Some(cycle) = slot.as_ref() else {
                continue;
            };
            if cycle.connections_live() {
                live = true;
                continue;
            }
            debug!("destroying old cycle for {}", cycle.conf_file.display());
            slot.take();
            destroyed += 1;
        }

        debug!("old cycles status: live={live}");

        if live {
            drop(retired);
            self.arm_sweeper();
        } else {
            // Drops the retirement list and its auxiliary pool with it.
            *retired = None;
        }
        destroyed
    }

    /// True while any superseded cycle is still waiting to drain.
    pub fn has_retired_cycles(&self) -> bool {
        self.retired
            .lock()
            .as_ref()
            .is_some_and(|s| s.list().iter().any(Option::is_some))
    }
}
