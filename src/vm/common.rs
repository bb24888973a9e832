//! Small types shared between the handle table, the intrinsics and the process.
use crate::error::Fault;

/// Strength of a GC handle; also the low two bits of every handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GCHandleType {
    /// Cleared as soon as the target becomes unreachable.
    Weak = 0,
    /// Survives while the target is kept alive for finalization.
    WeakTrackResurrection = 1,
    Normal = 2,
    /// Strong; the collector never moves anything, so this is `Normal` in practice.
    Pinned = 3,
}

impl GCHandleType {
    pub fn is_weak(self) -> bool {
        matches!(self, GCHandleType::Weak | GCHandleType::WeakTrackResurrection)
    }

    pub fn tag(self) -> usize {
        self as usize
    }

    pub fn from_tag(handle: usize) -> Self {
        match handle & 3 {
            0 => GCHandleType::Weak,
            1 => GCHandleType::WeakTrackResurrection,
            2 => GCHandleType::Normal,
            _ => GCHandleType::Pinned,
        }
    }
}

impl TryFrom<i32> for GCHandleType {
    type Error = Fault;

    fn try_from(i: i32) -> Result<Self, Fault> {
        match i {
            0..=3 => Ok(Self::from_tag(i as usize)),
            _ => Err(Fault::InvalidProgram(format!("invalid GCHandleType: {i}"))),
        }
    }
}
