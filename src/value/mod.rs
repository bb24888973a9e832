//! Runtime values: object handles, stack words and the two argument sources.
use std::{fmt, num::NonZeroUsize};

pub mod args;
pub mod object;

pub use args::{ArgSource, ExecValue, ExecValues, VaArg, VaList};
pub use object::{LockWord, ObjectHeader, HEADER_SIZE};

/// One slot of the interpreter evaluation stack.
pub type Word = usize;

pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

pub const fn words_for(size: usize) -> usize {
    size.div_ceil(WORD_SIZE)
}

/// 64-bit integers take this many words whatever the native word size.
pub const WORDS_PER_LONG: usize = words_for(8);
pub const WORDS_PER_NATIVE_FLOAT: usize = words_for(std::mem::size_of::<f64>());
pub const WORDS_PER_TYPED_REF: usize = words_for(std::mem::size_of::<TypedRef>());

const GEN_SHIFT: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << GEN_SHIFT) - 1;

fn encode(index: usize, generation: u32) -> NonZeroUsize {
    let raw = ((generation as usize & INDEX_MASK) << GEN_SHIFT) | ((index + 1) & INDEX_MASK);
    NonZeroUsize::new(raw).unwrap_or(NonZeroUsize::MIN)
}

/// Handle to the user-visible part of a heap object. Fits in one word so the
/// interpreter can keep it on the evaluation stack.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroUsize);

/// Handle to the allocator block backing an object, header included.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(NonZeroUsize);

impl BlockRef {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self(encode(index, generation))
    }

    pub fn index(self) -> usize {
        (self.0.get() & INDEX_MASK) - 1
    }

    pub fn generation(self) -> u32 {
        (self.0.get() >> GEN_SHIFT) as u32
    }

    /// The object living past this block's header.
    pub fn object(self) -> ObjectRef {
        ObjectRef(self.0)
    }
}

impl ObjectRef {
    pub fn to_word(self) -> Word {
        self.0.get()
    }

    /// Reads a stack or field word; zero is the null reference.
    pub fn from_word(word: Word) -> Option<Self> {
        NonZeroUsize::new(word).map(ObjectRef)
    }

    pub fn word_of(object: Option<ObjectRef>) -> Word {
        object.map_or(0, ObjectRef::to_word)
    }

    /// The block this object was carved from.
    pub fn block(self) -> BlockRef {
        BlockRef(self.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let block = self.block();
        write!(f, "obj#{}.{}", block.index(), block.generation())
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}.{}", self.index(), self.generation())
    }
}

/// A type descriptor paired with a pointer to data of that type.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedRef {
    pub type_handle: usize,
    pub value: *mut u8,
}

impl Default for TypedRef {
    fn default() -> Self {
        Self {
            type_handle: 0,
            value: std::ptr::null_mut(),
        }
    }
}

impl TypedRef {
    pub fn to_bytes(self) -> [u8; std::mem::size_of::<TypedRef>()] {
        let mut out = [0u8; std::mem::size_of::<TypedRef>()];
        out[..WORD_SIZE].copy_from_slice(&self.type_handle.to_ne_bytes());
        out[WORD_SIZE..].copy_from_slice(&(self.value as usize).to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut handle = [0u8; WORD_SIZE];
        let mut value = [0u8; WORD_SIZE];
        handle.copy_from_slice(&bytes[..WORD_SIZE]);
        value.copy_from_slice(&bytes[WORD_SIZE..2 * WORD_SIZE]);
        Self {
            type_handle: usize::from_ne_bytes(handle),
            value: usize::from_ne_bytes(value) as *mut u8,
        }
    }
}

/// Copies `bytes` into consecutive words, zero-filling the tail.
pub fn store_bytes(words: &mut [Word], bytes: &[u8]) {
    for (i, word) in words.iter_mut().enumerate() {
        let mut chunk = [0u8; WORD_SIZE];
        let start = i * WORD_SIZE;
        if start < bytes.len() {
            let end = (start + WORD_SIZE).min(bytes.len());
            chunk[..end - start].copy_from_slice(&bytes[start..end]);
        }
        *word = Word::from_ne_bytes(chunk);
    }
}

/// Reads `len` bytes back out of consecutive words.
pub fn load_bytes(words: &[Word], len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
    out.resize(len, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_encoding() {
        let block = BlockRef::new(41, 3);
        assert_eq!(block.index(), 41);
        assert_eq!(block.generation(), 3);
        let object = block.object();
        assert_eq!(object.block(), block);
        assert_eq!(ObjectRef::from_word(object.to_word()), Some(object));
        assert_eq!(ObjectRef::from_word(0), None);
    }

    #[test]
    fn test_word_counts() {
        assert_eq!(WORDS_PER_LONG, 8 / WORD_SIZE);
        assert_eq!(WORDS_PER_TYPED_REF, 2);
        assert_eq!(words_for(1), 1);
        assert_eq!(words_for(WORD_SIZE + 1), 2);
    }

    #[test]
    fn test_bytes_through_words() {
        let bytes: Vec<u8> = (1..=11).collect();
        let mut words = vec![0; words_for(bytes.len())];
        store_bytes(&mut words, &bytes);
        assert_eq!(load_bytes(&words, bytes.len()), bytes);
    }
}
