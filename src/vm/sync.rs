//! Sync blocks: the recursive monitors a lock word points at.
use crate::vm::metrics::RuntimeMetrics;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Ownership {
    /// Engine thread id of the owner, 0 when free.
    owner: u64,
    recursion: usize,
}

/// A recursive monitor. The owning thread may re-enter and must exit as many
/// times as it entered.
#[derive(Debug, Default)]
pub struct SyncBlock {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl SyncBlock {
    pub fn try_enter(&self, thread_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            0 => {
                *state = Ownership {
                    owner: thread_id,
                    recursion: 1,
                };
                true
            }
            owner if owner == thread_id => {
                state.recursion += 1;
                true
            }
            _ => false,
        }
    }

    pub fn enter(&self, thread_id: u64, metrics: &RuntimeMetrics) {
        self.acquire(thread_id, None, metrics);
    }

    /// Blocks for at most `timeout`; zero behaves like `try_enter`.
    pub fn enter_with_timeout(
        &self,
        thread_id: u64,
        timeout: Duration,
        metrics: &RuntimeMetrics,
    ) -> bool {
        if timeout.is_zero() {
            return self.try_enter(thread_id);
        }
        self.acquire(thread_id, Some(Instant::now() + timeout), metrics)
    }

    fn acquire(&self, thread_id: u64, deadline: Option<Instant>, metrics: &RuntimeMetrics) -> bool {
        let mut state = self.state.lock();
        if state.owner == thread_id {
            state.recursion += 1;
            return true;
        }
        if state.owner != 0 {
            let waited_from = Instant::now();
            while state.owner != 0 {
                match deadline {
                    None => self.released.wait(&mut state),
                    Some(deadline) => {
                        if self.released.wait_until(&mut state, deadline).timed_out()
                            && state.owner != 0
                        {
                            return false;
                        }
                    }
                }
            }
            metrics.record_lock_contention(waited_from.elapsed());
        }
        *state = Ownership {
            owner: thread_id,
            recursion: 1,
        };
        true
    }

    /// False when the caller does not own the monitor.
    pub fn exit(&self, thread_id: u64) -> bool {
        let mut state = self.state.lock();
        if thread_id == 0 || state.owner != thread_id || state.recursion == 0 {
            return false;
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = 0;
            self.released.notify_one();
        }
        true
    }

    pub fn owner(&self) -> Option<u64> {
        match self.state.lock().owner {
            0 => None,
            owner => Some(owner),
        }
    }
}

#[derive(Debug, Default)]
struct Blocks {
    live: HashMap<usize, Arc<SyncBlock>>,
    free: Vec<usize>,
    next: usize,
}

/// Hands out sync block indices for lock words. Index 0 is never used since a
/// zero lock word means "no monitor".
#[derive(Debug, Default)]
pub struct SyncBlockManager {
    blocks: Mutex<Blocks>,
}

impl SyncBlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> (usize, Arc<SyncBlock>) {
        let mut blocks = self.blocks.lock();
        let index = blocks.free.pop().unwrap_or_else(|| {
            blocks.next += 1;
            blocks.next
        });
        let block = Arc::new(SyncBlock::default());
        blocks.live.insert(index, block.clone());
        (index, block)
    }

    pub fn get(&self, index: usize) -> Option<Arc<SyncBlock>> {
        self.blocks.lock().live.get(&index).cloned()
    }

    /// Releases the sync block named by a lock word. A zero or stale index is ignored.
    pub fn reclaim(&self, index: usize) -> bool {
        let mut blocks = self.blocks.lock();
        if index != 0 && blocks.live.remove(&index).is_some() {
            blocks.free.push(index);
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> usize {
        self.blocks.lock().live.len()
    }
}
