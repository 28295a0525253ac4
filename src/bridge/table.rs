use ahash::{AHashMap, AHashSet};

use super::handle::{GENERATION_MASK, Handle, HandleKind};
use crate::runtime::ObjectId;

/// Identity of one native call frame.
pub(crate) type FrameId = u64;

#[derive(Debug, Default)]
struct Slot {
    object: Option<ObjectId>,
    generation: u32,
    /// Number of live frames that handed this slot out.
    frame_pins: u32,
    /// Explicit registrations; never dropped by frame exit.
    registered: u32,
    /// Marked from a mark callback; rooted for the next collection only.
    marked: bool,
}

impl Slot {
    fn is_pinned(&self) -> bool {
        self.frame_pins > 0 || self.registered > 0 || self.marked
    }
}

/// Address of a native `VALUE` variable registered as a collection root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RootAddress(*const u64);

// The pointee is only read while the execution lock is held, under the
// contract of `register_address`.
unsafe impl Send for RootAddress {}

/// Generational indirection table behind every non-immediate handle.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: AHashMap<ObjectId, u32>,
    frames: AHashMap<FrameId, AHashSet<u32>>,
    addresses: AHashSet<RootAddress>,
}

impl HandleTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            index: AHashMap::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Returns the handle for `object`, allocating a slot on first sight, and
    /// pins it to `frame`.
    pub fn insert(&mut self, object: ObjectId, frame: FrameId) -> Handle {
        let slot_index = match self.index.get(&object) {
            Some(index) => *index,
            None => {
                let index = match self.free.pop() {
                    Some(index) => index,
                    None => {
                        self.slots.push(Slot::default());
                        (self.slots.len() - 1) as u32
                    }
                };
                self.slots[index as usize].object = Some(object);
                self.index.insert(object, index);
                index
            }
        };
        self.pin(slot_index, frame);
        Handle::reference(slot_index, self.slots[slot_index as usize].generation)
    }

    fn pin(&mut self, slot_index: u32, frame: FrameId) {
        if self.frames.entry(frame).or_default().insert(slot_index) {
            self.slots[slot_index as usize].frame_pins += 1;
        }
    }

    fn slot_of(&self, handle: Handle) -> Option<u32> {
        let HandleKind::Reference { index, generation } = handle.kind() else {
            return None;
        };
        let slot = self.slots.get(index as usize)?;
        (slot.object.is_some() && slot.generation == generation).then_some(index)
    }

    /// Resolves a reference handle; `None` for stale or foreign handles.
    pub fn get(&self, handle: Handle) -> Option<ObjectId> {
        self.slot_of(handle)
            .and_then(|index| self.slots[index as usize].object)
    }

    pub fn open_frame(&mut self, frame: FrameId) {
        self.frames.entry(frame).or_default();
    }

    /// Drops `frame`'s pins, handing them to `parent` when the frame was
    /// nested so handles returned outward stay valid.
    pub fn close_frame(&mut self, frame: FrameId, parent: Option<FrameId>) {
        let Some(pinned) = self.frames.remove(&frame) else {
            return;
        };
        for index in pinned {
            let slot = &mut self.slots[index as usize];
            slot.frame_pins = slot.frame_pins.saturating_sub(1);
            if let Some(parent) = parent {
                self.pin(index, parent);
            }
        }
    }

    pub fn register(&mut self, handle: Handle) -> bool {
        match self.slot_of(handle) {
            Some(index) => {
                self.slots[index as usize].registered += 1;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&mut self, handle: Handle) -> bool {
        match self.slot_of(handle) {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.registered = slot.registered.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn mark(&mut self, handle: Handle) -> bool {
        match self.slot_of(handle) {
            Some(index) => {
                self.slots[index as usize].marked = true;
                true
            }
            None => false,
        }
    }

    /// # Safety
    ///
    /// `address` must stay valid for reads until it is unregistered.
    pub unsafe fn register_address(&mut self, address: *const u64) {
        self.addresses.insert(RootAddress(address));
    }

    pub fn unregister_address(&mut self, address: *const u64) -> bool {
        self.addresses.remove(&RootAddress(address))
    }

    /// Objects that must survive the next collection.
    pub fn roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<ObjectId> = self
            .slots
            .iter()
            .filter(|slot| slot.is_pinned())
            .filter_map(|slot| slot.object)
            .collect();
        for address in &self.addresses {
            // SAFETY: upheld by the caller of `register_address`.
            let bits = unsafe { address.0.read() };
            if let Some(object) = self.get(Handle::from_bits(bits)) {
                roots.push(object);
            }
        }
        roots
    }

    /// Frees every slot whose object did not survive and clears one-shot
    /// marks. Returns the number of slots freed.
    pub fn sweep(&mut self, is_live: impl Fn(ObjectId) -> bool) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.marked = false;
            let Some(object) = slot.object else {
                continue;
            };
            if is_live(object) {
                continue;
            }
            slot.object = None;
            slot.registered = 0;
            slot.generation = (slot.generation + 1) & GENERATION_MASK;
            self.index.remove(&object);
            self.free.push(index as u32);
            freed += 1;
        }
        freed
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_object_same_handle() {
        let mut table = HandleTable::with_capacity(4);
        table.open_frame(1);
        let a = table.insert(ObjectId(10), 1);
        let b = table.insert(ObjectId(10), 1);
        assert_eq!(a, b);
        assert_eq!(table.get(a), Some(ObjectId(10)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn frame_exit_unpins() {
        let mut table = HandleTable::default();
        table.open_frame(1);
        let handle = table.insert(ObjectId(3), 1);
        assert_eq!(table.roots(), vec![ObjectId(3)]);
        table.close_frame(1, None);
        assert!(table.roots().is_empty());
        assert_eq!(table.get(handle), Some(ObjectId(3)));
    }

    #[test]
    fn nested_frame_hands_pins_to_parent() {
        let mut table = HandleTable::default();
        table.open_frame(1);
        table.open_frame(2);
        table.insert(ObjectId(4), 2);
        table.close_frame(2, Some(1));
        assert_eq!(table.roots(), vec![ObjectId(4)]);
        table.close_frame(1, None);
        assert!(table.roots().is_empty());
    }

    #[test]
    fn swept_slots_reject_stale_handles() {
        let mut table = HandleTable::default();
        table.open_frame(1);
        let stale = table.insert(ObjectId(5), 1);
        table.close_frame(1, None);
        assert_eq!(table.sweep(|_| false), 1);
        assert_eq!(table.get(stale), None);

        table.open_frame(2);
        let fresh = table.insert(ObjectId(6), 2);
        assert_ne!(fresh, stale);
        assert_eq!(table.get(stale), None);
        assert_eq!(table.get(fresh), Some(ObjectId(6)));
    }

    #[test]
    fn marks_last_one_collection() {
        let mut table = HandleTable::default();
        table.open_frame(1);
        let handle = table.insert(ObjectId(8), 1);
        table.close_frame(1, None);
        assert!(table.mark(handle));
        assert_eq!(table.roots(), vec![ObjectId(8)]);
        table.sweep(|_| true);
        assert!(table.roots().is_empty());
    }

    #[test]
    fn registered_addresses_are_read_at_collection_time() {
        let mut table = HandleTable::default();
        table.open_frame(1);
        let handle = table.insert(ObjectId(11), 1);
        table.close_frame(1, None);

        let mut cell = Handle::NIL.to_bits();
        unsafe { table.register_address(&raw const cell) };
        assert!(table.roots().is_empty());
        cell = handle.to_bits();
        assert_eq!(table.roots(), vec![ObjectId(11)]);
        assert!(table.unregister_address(&raw const cell));
        assert!(table.roots().is_empty());
    }
}
