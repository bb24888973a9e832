//! Allocator and collector contract, plus the bundled mark/sweep collector.
//!
//! Blocks live in generational slots and never move. Reachability starts from
//! an explicit [`RootSet`]: root words are scanned conservatively, as are the
//! payloads of plain blocks; typed blocks are scanned through their descriptor
//! and atomic blocks not at all.
//!
//! Finalization follows the queue-then-resurrect scheme: an unreachable block
//! with a registered finalizer loses its registration, is queued, and is kept
//! alive (with everything it references) until the callback has run. Short weak
//! slots are cleared as soon as their target is queued; slots tracking
//! resurrection survive until the block is actually freed.
use crate::{
    types::GcDescriptor,
    value::{BlockRef, ObjectHeader, ObjectRef, Word, HEADER_SIZE, WORD_SIZE},
};
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::Arc,
    thread::ThreadId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocKind {
    /// May hold references anywhere; scanned conservatively.
    Plain,
    /// Holds no references; never scanned.
    Atomic,
    /// References only where the descriptor says.
    Typed(Arc<GcDescriptor>),
}

/// One allocation: a private header followed by the payload.
#[derive(Debug)]
pub struct Block {
    id: BlockRef,
    kind: AllocKind,
    header: ObjectHeader,
    data: Mutex<Box<[u8]>>,
}

impl Block {
    pub fn id(&self) -> BlockRef {
        self.id
    }

    /// The user-visible object past the header.
    pub fn object(&self) -> ObjectRef {
        self.id.object()
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn kind(&self) -> &AllocKind {
        &self.kind
    }

    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    /// Reads the word at byte `offset`, zero past the end.
    pub fn read_word(&self, offset: usize) -> Word {
        self.with_data(|data| {
            let mut bytes = [0u8; WORD_SIZE];
            if let Some(src) = data.get(offset..offset + WORD_SIZE) {
                bytes.copy_from_slice(src);
            }
            Word::from_ne_bytes(bytes)
        })
    }

    /// Writes the word at byte `offset`; returns false when out of bounds.
    pub fn write_word(&self, offset: usize, word: Word) -> bool {
        self.with_data_mut(|data| match data.get_mut(offset..offset + WORD_SIZE) {
            Some(dst) => {
                dst.copy_from_slice(&word.to_ne_bytes());
                true
            }
            None => false,
        })
    }

    fn scan(&self, mut visit: impl FnMut(Word)) {
        let data = self.data.lock();
        let word_at = |i: usize| {
            let mut bytes = [0u8; WORD_SIZE];
            bytes.copy_from_slice(&data[i * WORD_SIZE..(i + 1) * WORD_SIZE]);
            Word::from_ne_bytes(bytes)
        };
        let words = data.len() / WORD_SIZE;
        match &self.kind {
            AllocKind::Atomic => {}
            AllocKind::Plain => (0..words).for_each(|i| visit(word_at(i))),
            AllocKind::Typed(desc) => desc
                .references()
                .filter(|i| *i < words)
                .for_each(|i| visit(word_at(i))),
        }
    }
}

pub type FinalizerData = Arc<dyn Any + Send + Sync>;

/// Callback plus opaque user data, registered per block.
#[derive(Clone)]
pub struct Finalizer {
    pub callback: fn(&Arc<Block>, &FinalizerData),
    pub data: FinalizerData,
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer").finish_non_exhaustive()
    }
}

/// Token for a weak registration. Stays valid until unregistered, whatever
/// happens to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakSlot(usize);

#[derive(Debug, Default, Clone)]
pub struct RootSet {
    /// Exact roots.
    pub blocks: Vec<BlockRef>,
    /// Conservative roots: any word that names a live block keeps it alive.
    pub words: Vec<Word>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, object: Option<ObjectRef>) {
        if let Some(object) = object {
            self.blocks.push(object.block());
        }
    }

    pub fn add_words(&mut self, words: &[Word]) {
        self.words.extend_from_slice(words);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub marked: usize,
    pub queued: usize,
    pub freed: usize,
    pub freed_bytes: usize,
}

/// What the engine needs from an allocator/collector.
pub trait Collector: Send + Sync {
    /// Allocates `size` zeroed payload bytes behind a fresh header. `None` on exhaustion.
    fn alloc(&self, size: usize, kind: AllocKind) -> Option<Arc<Block>>;

    fn block(&self, block: BlockRef) -> Option<Arc<Block>>;

    /// Registers (`Some`) or unregisters (`None`) the block's finalizer.
    fn register_finalizer(&self, block: BlockRef, finalizer: Option<Finalizer>);

    fn has_finalizer(&self, block: BlockRef) -> bool;

    fn register_weak(&self, target: BlockRef, track_resurrection: bool) -> WeakSlot;

    fn unregister_weak(&self, slot: WeakSlot);

    /// The target while it lives, `None` once cleared.
    fn weak_target(&self, slot: WeakSlot) -> Option<BlockRef>;

    fn collect(&self, roots: &RootSet) -> CollectStats;

    /// Runs queued finalizers on the calling thread. Returns how many ran; a
    /// nested call from inside a finalizer, or a call while another thread is
    /// draining, returns 0 immediately.
    fn run_finalizers(&self) -> usize;

    /// Returns once the queue is empty and nobody is draining it, running
    /// finalizers itself when no other thread is. Called from inside a
    /// finalizer it returns 0 at once instead of waiting on itself.
    fn wait_for_finalizers(&self) -> usize;

    fn pending_finalizers(&self) -> usize;

    /// Bytes in use, headers included.
    fn heap_size(&self) -> usize;
}

struct Slot {
    generation: u32,
    block: Option<Arc<Block>>,
    finalizer: Option<Finalizer>,
    queued: bool,
    marked: bool,
}

struct WeakEntry {
    target: Option<BlockRef>,
    track_resurrection: bool,
}

#[derive(Default)]
struct HeapState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    bytes: usize,
    weak: Vec<Option<WeakEntry>>,
    weak_free: Vec<usize>,
    queue: VecDeque<(Arc<Block>, Finalizer)>,
}

impl HeapState {
    fn live_index(&self, block: BlockRef) -> Option<usize> {
        let slot = self.slots.get(block.index())?;
        (slot.block.is_some() && slot.generation == block.generation()).then_some(block.index())
    }

    fn live_index_of_word(&self, word: Word) -> Option<usize> {
        self.live_index(ObjectRef::from_word(word)?.block())
    }

    fn mark_from(&mut self, mut worklist: Vec<usize>) -> usize {
        let mut marked = 0;
        while let Some(index) = worklist.pop() {
            let slot = &mut self.slots[index];
            if slot.marked {
                continue;
            }
            slot.marked = true;
            marked += 1;
            let Some(block) = slot.block.clone() else {
                continue;
            };
            block.scan(|word| {
                if let Some(i) = self.live_index_of_word(word) {
                    if !self.slots[i].marked {
                        worklist.push(i);
                    }
                }
            });
        }
        marked
    }

    fn clear_weak(&mut self, dead: impl Fn(BlockRef) -> bool, include_tracking: bool) {
        for entry in self.weak.iter_mut().flatten() {
            if let Some(target) = entry.target {
                if dead(target) && (include_tracking || !entry.track_resurrection) {
                    entry.target = None;
                }
            }
        }
    }
}

/// Non-moving mark/sweep collector with an optional byte limit.
pub struct MarkSweepCollector {
    state: Mutex<HeapState>,
    limit: Option<usize>,
    /// Native thread currently running finalizers.
    drainer: Mutex<Option<ThreadId>>,
    drained: Condvar,
}

impl Default for MarkSweepCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkSweepCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            limit: None,
            drainer: Mutex::new(None),
            drained: Condvar::new(),
        }
    }

    /// Refuses allocations that would push the heap past `bytes`.
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            limit: Some(bytes),
            ..Self::new()
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.block.is_some())
            .count()
    }
}

struct DrainGuard<'a>(&'a MarkSweepCollector);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        *self.0.drainer.lock() = None;
        self.0.drained.notify_all();
    }
}

impl Collector for MarkSweepCollector {
    fn alloc(&self, size: usize, kind: AllocKind) -> Option<Arc<Block>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let total = size.checked_add(HEADER_SIZE)?;
        if let Some(limit) = self.limit {
            if state.bytes.checked_add(total)? > limit {
                return None;
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size).ok()?;
        data.resize(size, 0u8);

        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.slots.try_reserve(1).ok()?;
                state.slots.push(Slot {
                    generation: 0,
                    block: None,
                    finalizer: None,
                    queued: false,
                    marked: false,
                });
                state.slots.len() - 1
            }
        };
        let slot = &mut state.slots[index];
        let block = Arc::new(Block {
            id: BlockRef::new(index, slot.generation),
            kind,
            header: ObjectHeader::default(),
            data: Mutex::new(data.into_boxed_slice()),
        });
        slot.block = Some(block.clone());
        state.bytes += total;
        Some(block)
    }

    fn block(&self, block: BlockRef) -> Option<Arc<Block>> {
        let state = self.state.lock();
        let index = state.live_index(block)?;
        state.slots[index].block.clone()
    }

    fn register_finalizer(&self, block: BlockRef, finalizer: Option<Finalizer>) {
        let mut state = self.state.lock();
        if let Some(index) = state.live_index(block) {
            state.slots[index].finalizer = finalizer;
        }
    }

    fn has_finalizer(&self, block: BlockRef) -> bool {
        let state = self.state.lock();
        state
            .live_index(block)
            .is_some_and(|i| state.slots[i].finalizer.is_some())
    }

    fn register_weak(&self, target: BlockRef, track_resurrection: bool) -> WeakSlot {
        let mut state = self.state.lock();
        let target = state.live_index(target).map(|_| target);
        let entry = Some(WeakEntry {
            target,
            track_resurrection,
        });
        match state.weak_free.pop() {
            Some(index) => {
                state.weak[index] = entry;
                WeakSlot(index)
            }
            None => {
                state.weak.push(entry);
                WeakSlot(state.weak.len() - 1)
            }
        }
    }

    fn unregister_weak(&self, slot: WeakSlot) {
        let mut state = self.state.lock();
        if let Some(entry) = state.weak.get_mut(slot.0) {
            if entry.take().is_some() {
                state.weak_free.push(slot.0);
            }
        }
    }

    fn weak_target(&self, slot: WeakSlot) -> Option<BlockRef> {
        let state = self.state.lock();
        state.weak.get(slot.0)?.as_ref()?.target
    }

    fn collect(&self, roots: &RootSet) -> CollectStats {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut stats = CollectStats::default();
        for slot in state.slots.iter_mut() {
            slot.marked = false;
        }

        let mut worklist: Vec<usize> = roots
            .blocks
            .iter()
            .filter_map(|b| state.live_index(*b))
            .chain(roots.words.iter().filter_map(|w| state.live_index_of_word(*w)))
            .collect();
        // Blocks already waiting for their finalizer stay reachable.
        worklist.extend(
            state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.queued)
                .map(|(i, _)| i),
        );
        stats.marked += state.mark_from(worklist);

        let mut resurrected = Vec::new();
        for index in 0..state.slots.len() {
            let slot = &mut state.slots[index];
            if slot.marked || slot.block.is_none() {
                continue;
            }
            if let (Some(finalizer), Some(block)) = (slot.finalizer.take(), slot.block.clone()) {
                slot.queued = true;
                state.queue.push_back((block, finalizer));
                resurrected.push(index);
            }
        }
        stats.queued = resurrected.len();

        let unmarked: Vec<bool> = state.slots.iter().map(|s| !s.marked).collect();
        state.clear_weak(|b| unmarked[b.index()], false);
        stats.marked += state.mark_from(resurrected);

        let mut freed = Vec::new();
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if slot.marked {
                continue;
            }
            if let Some(block) = slot.block.take() {
                stats.freed += 1;
                stats.freed_bytes += block.size() + HEADER_SIZE;
                slot.generation = slot.generation.wrapping_add(1);
                slot.finalizer = None;
                slot.queued = false;
                freed.push(index);
            }
        }
        let dead: Vec<bool> = {
            let mut dead = vec![false; state.slots.len()];
            freed.iter().for_each(|i| dead[*i] = true);
            dead
        };
        state.clear_weak(|b| dead[b.index()], true);
        state.free.extend(freed);
        state.bytes = state.bytes.saturating_sub(stats.freed_bytes);

        tracing::trace!(
            marked = stats.marked,
            queued = stats.queued,
            freed = stats.freed,
            "collection finished"
        );
        stats
    }

    fn run_finalizers(&self) -> usize {
        {
            let mut drainer = self.drainer.lock();
            if drainer.is_some() {
                return 0;
            }
            *drainer = Some(std::thread::current().id());
        }
        let _guard = DrainGuard(self);

        let mut ran = 0;
        loop {
            let next = self.state.lock().queue.pop_front();
            let Some((block, finalizer)) = next else {
                break;
            };
            (finalizer.callback)(&block, &finalizer.data);
            let mut state = self.state.lock();
            if let Some(index) = state.live_index(block.id()) {
                state.slots[index].queued = false;
            }
            ran += 1;
        }
        ran
    }

    fn wait_for_finalizers(&self) -> usize {
        let me = std::thread::current().id();
        let mut ran = 0;
        loop {
            let mut drainer = self.drainer.lock();
            let current = *drainer;
            match current {
                Some(id) if id == me => return ran,
                Some(_) => self.drained.wait(&mut drainer),
                None => {
                    if self.pending_finalizers() == 0 {
                        return ran;
                    }
                    drop(drainer);
                    ran += self.run_finalizers();
                }
            }
        }
    }

    fn pending_finalizers(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn heap_size(&self) -> usize {
        self.state.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Barrier,
    };

    fn counting_finalizer(counter: Arc<AtomicUsize>) -> Finalizer {
        fn bump(_: &Arc<Block>, data: &FinalizerData) {
            if let Some(counter) = data.downcast_ref::<AtomicUsize>() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
        Finalizer {
            callback: bump,
            data: counter,
        }
    }

    #[test]
    fn test_unreachable_blocks_are_freed() {
        let gc = MarkSweepCollector::new();
        let kept = gc.alloc(16, AllocKind::Plain).unwrap();
        let dropped = gc.alloc(16, AllocKind::Plain).unwrap().id();
        assert_eq!(gc.heap_size(), 2 * (16 + HEADER_SIZE));

        let mut roots = RootSet::new();
        roots.add_object(Some(kept.object()));
        let stats = gc.collect(&roots);
        assert_eq!(stats.freed, 1);
        assert!(gc.block(dropped).is_none());
        assert!(gc.block(kept.id()).is_some());
        assert_eq!(gc.heap_size(), 16 + HEADER_SIZE);
    }

    #[test]
    fn test_plain_blocks_scanned_atomic_not() {
        let gc = MarkSweepCollector::new();
        let child_a = gc.alloc(8, AllocKind::Plain).unwrap();
        let child_b = gc.alloc(8, AllocKind::Plain).unwrap();
        let plain = gc.alloc(WORD_SIZE, AllocKind::Plain).unwrap();
        let atomic = gc.alloc(WORD_SIZE, AllocKind::Atomic).unwrap();
        plain.write_word(0, child_a.object().to_word());
        atomic.write_word(0, child_b.object().to_word());

        let mut roots = RootSet::new();
        roots.add_words(&[plain.object().to_word(), atomic.object().to_word()]);
        gc.collect(&roots);
        assert!(gc.block(child_a.id()).is_some());
        assert!(gc.block(child_b.id()).is_none());
    }

    #[test]
    fn test_typed_blocks_follow_descriptor() {
        let gc = MarkSweepCollector::new();
        let mut desc = GcDescriptor::new(2);
        desc.mark(1);
        let target_a = gc.alloc(8, AllocKind::Atomic).unwrap();
        let target_b = gc.alloc(8, AllocKind::Atomic).unwrap();
        let typed = gc
            .alloc(2 * WORD_SIZE, AllocKind::Typed(Arc::new(desc)))
            .unwrap();
        typed.write_word(0, target_a.object().to_word());
        typed.write_word(WORD_SIZE, target_b.object().to_word());

        let mut roots = RootSet::new();
        roots.add_object(Some(typed.object()));
        gc.collect(&roots);
        assert!(gc.block(target_a.id()).is_none());
        assert!(gc.block(target_b.id()).is_some());
    }

    #[test]
    fn test_finalizer_queued_once_then_freed() {
        let gc = MarkSweepCollector::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let block = gc.alloc(8, AllocKind::Plain).unwrap().id();
        gc.register_finalizer(block, Some(counting_finalizer(counter.clone())));

        let stats = gc.collect(&RootSet::new());
        assert_eq!(stats.queued, 1);
        assert!(gc.block(block).is_some());
        assert_eq!(gc.pending_finalizers(), 1);
        assert_eq!(gc.run_finalizers(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        gc.collect(&RootSet::new());
        assert_eq!(gc.run_finalizers(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(gc.block(block).is_none());
    }

    struct Gate {
        held: AtomicBool,
        entered: Barrier,
        release: Barrier,
        ran: AtomicUsize,
    }

    fn gated_finalizer(gate: Arc<Gate>) -> Finalizer {
        fn hold_first(_: &Arc<Block>, data: &FinalizerData) {
            let Some(gate) = data.downcast_ref::<Gate>() else {
                return;
            };
            if !gate.held.swap(true, Ordering::SeqCst) {
                gate.entered.wait();
                gate.release.wait();
            }
            gate.ran.fetch_add(1, Ordering::SeqCst);
        }
        Finalizer {
            callback: hold_first,
            data: gate,
        }
    }

    #[test]
    fn test_wait_blocks_until_other_drainer_finishes() {
        let gc = Arc::new(MarkSweepCollector::new());
        let gate = Arc::new(Gate {
            held: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
            ran: AtomicUsize::new(0),
        });
        for _ in 0..2 {
            let block = gc.alloc(8, AllocKind::Plain).unwrap().id();
            gc.register_finalizer(block, Some(gated_finalizer(gate.clone())));
        }
        assert_eq!(gc.collect(&RootSet::new()).queued, 2);

        let drainer = {
            let gc = gc.clone();
            std::thread::spawn(move || gc.run_finalizers())
        };
        gate.entered.wait();
        // the drainer is parked inside the first finalizer
        assert_eq!(gc.run_finalizers(), 0);

        let waiter = {
            let (gc, gate) = (gc.clone(), gate.clone());
            std::thread::spawn(move || {
                gc.wait_for_finalizers();
                (gc.pending_finalizers(), gate.ran.load(Ordering::SeqCst))
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        gate.release.wait();

        assert_eq!(waiter.join().unwrap(), (0, 2));
        assert_eq!(drainer.join().unwrap(), 2);
    }

    #[test]
    fn test_wait_with_nothing_queued_returns_zero() {
        let gc = MarkSweepCollector::new();
        assert_eq!(gc.wait_for_finalizers(), 0);
    }

    #[test]
    fn test_weak_slots_short_and_long() {
        let gc = MarkSweepCollector::new();
        let block = gc.alloc(8, AllocKind::Plain).unwrap().id();
        gc.register_finalizer(block, Some(counting_finalizer(Arc::new(AtomicUsize::new(0)))));
        let short = gc.register_weak(block, false);
        let long = gc.register_weak(block, true);

        gc.collect(&RootSet::new());
        assert_eq!(gc.weak_target(short), None);
        assert_eq!(gc.weak_target(long), Some(block));

        gc.run_finalizers();
        gc.collect(&RootSet::new());
        assert_eq!(gc.weak_target(long), None);

        gc.unregister_weak(short);
        let reused = gc.register_weak(gc.alloc(8, AllocKind::Atomic).unwrap().id(), false);
        assert_eq!(reused, short);
    }

    #[test]
    fn test_limit_refuses_allocation() {
        let gc = MarkSweepCollector::with_limit(64 + HEADER_SIZE);
        assert!(gc.alloc(64, AllocKind::Plain).is_some());
        assert!(gc.alloc(1, AllocKind::Plain).is_none());
    }
}
