//! Lock words and the monitors built on them.
//!
//! In header mode every object carries its lock word. In thin mode the header
//! has no room for one, so lock words live in a side table keyed weakly by
//! object identity: an entry whose object died becomes a ghost and is recycled
//! by the next object hashing into the same bucket.
use crate::{
    error::Fault,
    value::{LockWord, ObjectRef},
    vm::{
        config::LockMode,
        gc::{Block, Collector, WeakSlot},
        sync::{SyncBlock, SyncBlockManager},
        Process,
    },
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

const BUCKETS: usize = 512;

struct Entry {
    weak: WeakSlot,
    lock_word: Arc<LockWord>,
}

pub struct MonitorTable {
    buckets: Mutex<Vec<Vec<Entry>>>,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorTable {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new((0..BUCKETS).map(|_| Vec::new()).collect()),
        }
    }

    fn bucket_of(object: ObjectRef) -> usize {
        object.block().index() % BUCKETS
    }

    fn find_or_insert(
        bucket: &mut Vec<Entry>,
        collector: &dyn Collector,
        sync_blocks: &SyncBlockManager,
        object: ObjectRef,
    ) -> Arc<LockWord> {
        let mut ghost = None;
        for (i, entry) in bucket.iter().enumerate() {
            match collector.weak_target(entry.weak) {
                Some(target) if target == object.block() => return entry.lock_word.clone(),
                None if ghost.is_none() => ghost = Some(i),
                _ => {}
            }
        }

        if let Some(i) = ghost {
            let entry = &mut bucket[i];
            collector.unregister_weak(entry.weak);
            entry.weak = collector.register_weak(object.block(), false);
            sync_blocks.reclaim(entry.lock_word.swap(0));
            return entry.lock_word.clone();
        }

        let lock_word = Arc::new(LockWord::new());
        bucket.insert(
            0,
            Entry {
                weak: collector.register_weak(object.block(), false),
                lock_word: lock_word.clone(),
            },
        );
        lock_word
    }

    /// The lock word for `object`, stable for as long as the object lives.
    pub fn lock_word(
        &self,
        collector: &dyn Collector,
        sync_blocks: &SyncBlockManager,
        object: ObjectRef,
    ) -> Arc<LockWord> {
        let mut buckets = self.buckets.lock();
        Self::find_or_insert(
            &mut buckets[Self::bucket_of(object)],
            collector,
            sync_blocks,
            object,
        )
    }

    /// Looks the word up and swaps it in one critical section.
    pub fn compare_exchange(
        &self,
        collector: &dyn Collector,
        sync_blocks: &SyncBlockManager,
        object: ObjectRef,
        current: usize,
        new: usize,
    ) -> Result<usize, usize> {
        let mut buckets = self.buckets.lock();
        let word = Self::find_or_insert(
            &mut buckets[Self::bucket_of(object)],
            collector,
            sync_blocks,
            object,
        );
        word.compare_exchange(current, new)
    }

    pub fn entries(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    /// Unregisters every weak slot the table holds.
    pub fn teardown(&self, collector: &dyn Collector) {
        for bucket in self.buckets.lock().iter_mut() {
            for entry in bucket.drain(..) {
                collector.unregister_weak(entry.weak);
            }
        }
    }
}

/// Releases the sync block attached to `block`'s header lock word, if any.
pub(crate) fn reclaim_header_monitor(sync_blocks: &SyncBlockManager, block: &Block) -> bool {
    sync_blocks.reclaim(block.header().lock_word().swap(0))
}

enum LockWordRef {
    Header(Arc<Block>),
    Table(Arc<LockWord>),
}

impl LockWordRef {
    fn word(&self) -> &LockWord {
        match self {
            LockWordRef::Header(block) => block.header().lock_word(),
            LockWordRef::Table(word) => word,
        }
    }
}

impl Process {
    pub(crate) fn monitor_table(&self) -> &MonitorTable {
        self.monitor_table.get_or_init(MonitorTable::new)
    }

    fn lock_word_of(&self, object: ObjectRef) -> Result<LockWordRef, Fault> {
        match self.config.lock_mode {
            LockMode::Header => self
                .collector
                .block(object.block())
                .map(LockWordRef::Header)
                .ok_or(Fault::NullReference),
            LockMode::Thin => Ok(LockWordRef::Table(self.monitor_table().lock_word(
                self.collector.as_ref(),
                &self.sync_blocks,
                object,
            ))),
        }
    }

    fn swap_lock_word(
        &self,
        object: ObjectRef,
        word: &LockWordRef,
        current: usize,
        new: usize,
    ) -> Result<usize, usize> {
        match self.config.lock_mode {
            LockMode::Header => word.word().compare_exchange(current, new),
            LockMode::Thin => self.monitor_table().compare_exchange(
                self.collector.as_ref(),
                &self.sync_blocks,
                object,
                current,
                new,
            ),
        }
    }

    /// The sync block named by the object's lock word, attaching a fresh one
    /// when the word is empty or stale.
    pub(crate) fn sync_block_for(&self, object: ObjectRef) -> Result<Arc<SyncBlock>, Fault> {
        let word = self.lock_word_of(object)?;
        loop {
            let current = word.word().load();
            if let Some(existing) = self.sync_blocks.get(current) {
                return Ok(existing);
            }
            let (index, block) = self.sync_blocks.create();
            match self.swap_lock_word(object, &word, current, index) {
                Ok(_) => return Ok(block),
                Err(_) => {
                    self.sync_blocks.reclaim(index);
                }
            }
        }
    }

    /// The sync block already attached to the object, if any.
    pub(crate) fn attached_sync_block(&self, object: ObjectRef) -> Result<Option<Arc<SyncBlock>>, Fault> {
        let word = self.lock_word_of(object)?;
        Ok(self.sync_blocks.get(word.word().load()))
    }

    pub fn monitor_enter(&self, thread_id: u64, object: Option<ObjectRef>) -> Result<(), Fault> {
        let object = object.ok_or(Fault::NullReference)?;
        self.sync_block_for(object)?.enter(thread_id, &self.metrics);
        Ok(())
    }

    pub fn monitor_try_enter(
        &self,
        thread_id: u64,
        object: Option<ObjectRef>,
        timeout: Duration,
    ) -> Result<bool, Fault> {
        let object = object.ok_or(Fault::NullReference)?;
        Ok(self
            .sync_block_for(object)?
            .enter_with_timeout(thread_id, timeout, &self.metrics))
    }

    /// False when the thread does not hold the monitor.
    pub fn monitor_exit(&self, thread_id: u64, object: Option<ObjectRef>) -> Result<bool, Fault> {
        let object = object.ok_or(Fault::NullReference)?;
        Ok(self
            .attached_sync_block(object)?
            .is_some_and(|block| block.exit(thread_id)))
    }

    /// Detaches and frees the monitor of a dying object (header mode only; thin
    /// entries recycle themselves).
    pub(crate) fn reclaim_monitor(&self, block: &Block) -> bool {
        match self.config.lock_mode {
            LockMode::Header => reclaim_header_monitor(&self.sync_blocks, block),
            LockMode::Thin => false,
        }
    }
}
