use crate::{
    error::Fault,
    types::MethodId,
    value::Word,
};

/// Program counter in the interpreter's code space.
pub type Pc = usize;

pub const INVALID_PC: Pc = usize::MAX;

/// Fixed-capacity word stack shared by the packer, the interpreter and the
/// unpacker.
#[derive(Debug)]
pub struct EvaluationStack {
    words: Vec<Word>,
    top: usize,
}

impl EvaluationStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity],
            top: 0,
        }
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Checks that `count` words fit above `at`.
    pub fn check_space(&self, at: usize, count: usize) -> Result<(), Fault> {
        match at.checked_add(count) {
            Some(end) if end <= self.words.len() => Ok(()),
            _ => Err(Fault::StackOverflow),
        }
    }

    /// Words `[at, at + count)`, which must already be space-checked.
    pub fn slots_mut(&mut self, at: usize, count: usize) -> &mut [Word] {
        &mut self.words[at..at + count]
    }

    pub fn slots(&self, at: usize, count: usize) -> &[Word] {
        &self.words[at..at + count]
    }

    /// Commits a new top after writing above the old one.
    pub fn set_top(&mut self, top: usize) {
        debug_assert!(top <= self.words.len());
        self.top = top;
    }

    pub fn push_words(&mut self, words: &[Word]) -> Result<(), Fault> {
        self.check_space(self.top, words.len())?;
        self.words[self.top..self.top + words.len()].copy_from_slice(words);
        self.top += words.len();
        Ok(())
    }

    /// Pops `count` words, returning them bottom first. Pops what is there if
    /// fewer are available.
    pub fn pop_words(&mut self, count: usize) -> Vec<Word> {
        let start = self.top.saturating_sub(count);
        let out = self.words[start..self.top].to_vec();
        self.top = start;
        out
    }

    /// Inserts a word at `at`, shifting everything above it up by one.
    pub fn insert_word(&mut self, at: usize, word: Word) -> Result<(), Fault> {
        self.check_space(self.top, 1)?;
        self.words.copy_within(at..self.top, at + 1);
        self.words[at] = word;
        self.top += 1;
        Ok(())
    }

    pub fn truncate(&mut self, top: usize) {
        self.top = self.top.min(top);
    }

    /// The live part of the stack, for conservative root scanning.
    pub fn live(&self) -> &[Word] {
        &self.words[..self.top]
    }
}

/// One activation record of the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub pc: Pc,
    pub method: Option<MethodId>,
    pub frame_base: usize,
    /// Opaque permission set token, zero when none applies.
    pub permissions: usize,
}

/// Frame stack: preallocated slots first, then overflow growth up to a hard limit.
#[derive(Debug)]
pub struct FrameStack {
    frames: Vec<CallFrame>,
    limit: usize,
    overflow_allocations: usize,
}

impl FrameStack {
    pub fn new(preallocated: usize, limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(preallocated.min(limit)),
            limit,
            overflow_allocations: 0,
        }
    }

    pub fn push(&mut self, frame: CallFrame) -> Result<(), Fault> {
        if self.frames.len() >= self.limit {
            return Err(Fault::StackOverflow);
        }
        if self.frames.len() == self.frames.capacity() {
            let extra = self.frames.len().max(1).min(self.limit - self.frames.len());
            self.frames
                .try_reserve_exact(extra)
                .map_err(|_| Fault::StackOverflow)?;
            self.overflow_allocations += 1;
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn last(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Times the stack had to grow past its preallocated slots.
    pub fn overflow_allocations(&self) -> usize {
        self.overflow_allocations
    }
}
