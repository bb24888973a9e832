//! Process-wide GC handle table.
//!
//! Handles are `((index + 1) << 2) | type`, so zero is never a valid handle.
//! Strong and pinned handles share one array, both weak kinds share another.
//! Freed slots go on a free list and are handed out again before the array
//! grows; growth happens eight slots at a time.
use crate::{
    error::Fault,
    value::ObjectRef,
    vm::{
        common::GCHandleType,
        gc::{Collector, RootSet, WeakSlot},
    },
};
use parking_lot::Mutex;

const GROWTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Part of the array but never handed out.
    Empty,
    /// Handed out, then freed.
    Free,
    Strong(Option<ObjectRef>),
    Weak {
        token: Option<WeakSlot>,
        track_resurrection: bool,
    },
}

#[derive(Debug, Default)]
struct Region {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Region {
    fn take_slot(&mut self) -> Result<usize, Fault> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        let start = self.slots.len();
        self.slots
            .try_reserve(GROWTH)
            .map_err(|_| Fault::OutOfMemory)?;
        self.free
            .try_reserve(GROWTH)
            .map_err(|_| Fault::OutOfMemory)?;
        self.slots.resize(start + GROWTH, Slot::Empty);
        // Lowest index comes off the free list first.
        self.free.extend((start + 1..start + GROWTH).rev());
        Ok(start)
    }

    fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Strong(_) | Slot::Weak { .. }))
            .count()
    }
}

#[derive(Debug, Default)]
struct Regions {
    regular: Region,
    weak: Region,
}

impl Regions {
    fn region(&mut self, kind: GCHandleType) -> &mut Region {
        if kind.is_weak() {
            &mut self.weak
        } else {
            &mut self.regular
        }
    }
}

fn encode(index: usize, kind: GCHandleType) -> usize {
    ((index + 1) << 2) | kind.tag()
}

fn decode(handle: usize) -> Option<(usize, GCHandleType)> {
    let index = (handle >> 2).checked_sub(1)?;
    Some((index, GCHandleType::from_tag(handle)))
}

#[derive(Debug, Default)]
pub struct GCHandleTable {
    regions: Mutex<Regions>,
}

impl GCHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &self,
        collector: &dyn Collector,
        object: Option<ObjectRef>,
        kind: GCHandleType,
    ) -> Result<usize, Fault> {
        let mut regions = self.regions.lock();
        let region = regions.region(kind);
        let index = region.take_slot()?;
        region.slots[index] = if kind.is_weak() {
            let track_resurrection = kind == GCHandleType::WeakTrackResurrection;
            Slot::Weak {
                token: object.map(|o| collector.register_weak(o.block(), track_resurrection)),
                track_resurrection,
            }
        } else {
            Slot::Strong(object)
        };
        Ok(encode(index, kind))
    }

    /// False for a handle that is out of range or already freed.
    pub fn free(&self, collector: &dyn Collector, handle: usize) -> bool {
        let Some((index, kind)) = decode(handle) else {
            return false;
        };
        let mut regions = self.regions.lock();
        let region = regions.region(kind);
        match region.slots.get(index).copied() {
            Some(Slot::Weak { token, .. }) => {
                if let Some(token) = token {
                    collector.unregister_weak(token);
                }
            }
            Some(Slot::Strong(_)) => {}
            _ => return false,
        }
        region.slots[index] = Slot::Free;
        region.free.push(index);
        true
    }

    /// Bounds check against the current extent of the handle's array.
    pub fn validate(&self, handle: usize) -> bool {
        let Some((index, kind)) = decode(handle) else {
            return false;
        };
        index < self.regions.lock().region(kind).slots.len()
    }

    pub fn get(&self, collector: &dyn Collector, handle: usize) -> Option<ObjectRef> {
        let (index, kind) = decode(handle)?;
        let mut regions = self.regions.lock();
        match regions.region(kind).slots.get(index)? {
            Slot::Strong(object) => *object,
            Slot::Weak { token, .. } => collector.weak_target((*token)?).map(|b| b.object()),
            Slot::Empty | Slot::Free => None,
        }
    }

    /// Swaps the target. Weak slots drop their old registration before
    /// registering the new target.
    pub fn set(
        &self,
        collector: &dyn Collector,
        handle: usize,
        object: Option<ObjectRef>,
    ) -> bool {
        let Some((index, kind)) = decode(handle) else {
            return false;
        };
        let mut regions = self.regions.lock();
        let Some(slot) = regions.region(kind).slots.get_mut(index) else {
            return false;
        };
        match slot {
            Slot::Strong(target) => *target = object,
            Slot::Weak {
                token,
                track_resurrection,
            } => {
                if let Some(old) = token.take() {
                    collector.unregister_weak(old);
                }
                *token = object.map(|o| collector.register_weak(o.block(), *track_resurrection));
            }
            Slot::Empty | Slot::Free => return false,
        }
        true
    }

    /// Adds the target of every strong and pinned handle.
    pub fn strong_roots(&self, roots: &mut RootSet) {
        let regions = self.regions.lock();
        for slot in &regions.regular.slots {
            if let Slot::Strong(object) = slot {
                roots.add_object(*object);
            }
        }
    }

    pub fn count(&self) -> usize {
        let regions = self.regions.lock();
        regions.regular.live() + regions.weak.live()
    }

    /// Releases both arrays, unregistering every weak slot first.
    pub fn teardown(&self, collector: &dyn Collector) {
        let mut regions = self.regions.lock();
        for slot in &regions.weak.slots {
            if let Slot::Weak {
                token: Some(token), ..
            } = slot
            {
                collector.unregister_weak(*token);
            }
        }
        *regions = Regions::default();
    }
}
