use super::WORD_SIZE;
use crate::types::ClassId;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    OnceLock,
};

/// Bytes the header occupies in front of every object: class word and lock word.
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Synchronization word. Zero means no monitor is attached; otherwise it holds
/// a sync block index. Only ever changed by compare-and-exchange or swap.
#[derive(Debug, Default)]
pub struct LockWord(AtomicUsize);

impl LockWord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn swap(&self, new: usize) -> usize {
        self.0.swap(new, Ordering::AcqRel)
    }
}

/// Private header in front of the object. The class is written once at
/// allocation; raw (class-less) blocks never set it.
#[derive(Debug, Default)]
pub struct ObjectHeader {
    class: OnceLock<ClassId>,
    lock_word: LockWord,
}

impl ObjectHeader {
    pub fn class(&self) -> Option<ClassId> {
        self.class.get().copied()
    }

    /// Returns false if the class was already written.
    pub(crate) fn set_class(&self, class: ClassId) -> bool {
        self.class.set(class).is_ok()
    }

    pub fn lock_word(&self) -> &LockWord {
        &self.lock_word
    }
}
