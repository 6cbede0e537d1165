use object::Value;

use crate::old_space::OldSpace;
use crate::space::SemiSpace;

/// The process heap: one semi-space for young allocation, one old-space for
/// tenured objects, and one reserved, empty semi-space that the next
/// scavenge copies into.
pub struct TwoSpaceHeap {
    new_space: SemiSpace,
    old_space: OldSpace,
    unused_semi_space: SemiSpace,
    semi_space_size: usize,
}

impl TwoSpaceHeap {
    pub fn new(
        semi_space_size: usize,
        old_chunk_size: usize,
        old_allocation_budget: usize,
    ) -> TwoSpaceHeap {
        TwoSpaceHeap {
            new_space: SemiSpace::new(semi_space_size),
            old_space: OldSpace::new(old_chunk_size, old_allocation_budget),
            unused_semi_space: SemiSpace::new(semi_space_size),
            semi_space_size,
        }
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// New-space fast path; objects that could never fit a semi-space
    /// chunk go straight to old-space. `None` means the caller should
    /// scavenge and retry.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size > self.max_new_space_object_size() {
            return self.old_space.allocate(size);
        }
        self.new_space.allocate(size)
    }

    pub fn max_new_space_object_size(&self) -> usize {
        self.semi_space_size / 2
    }

    pub fn has_empty_new_space(&self) -> bool {
        self.new_space.is_empty()
    }

    // ── Spaces ─────────────────────────────────────────────────────

    pub fn new_space(&mut self) -> &mut SemiSpace {
        &mut self.new_space
    }

    pub fn new_space_ref(&self) -> &SemiSpace {
        &self.new_space
    }

    pub fn old_space(&mut self) -> &mut OldSpace {
        &mut self.old_space
    }

    pub fn old_space_ref(&self) -> &OldSpace {
        &self.old_space
    }

    pub fn unused_space(&mut self) -> &mut SemiSpace {
        &mut self.unused_semi_space
    }

    /// After a scavenge the destination becomes the new-space; the emptied
    /// from-space is kept as the next destination. The fresh new-space's
    /// water mark records that everything in it has survived one scavenge.
    pub fn swap_semi_spaces(&mut self) {
        core::mem::swap(&mut self.new_space, &mut self.unused_semi_space);
        self.new_space.record_water_mark();
        self.unused_semi_space.reset();
    }

    pub fn adjust_old_allocation_budget(&mut self) {
        self.old_space.adjust_allocation_budget();
    }

    // ── Write barrier ──────────────────────────────────────────────

    /// Record `slot := value` stores of new-space pointers into old-space
    /// slots; the scavenger relies on the remembered set being complete.
    pub fn record_write(&mut self, slot: *mut Value, value: Value) {
        if !value.is_heap_object() {
            return;
        }
        let slot_address = slot as usize;
        if self.new_space.contains(value.address())
            && self.old_space.contains(slot_address)
        {
            self.old_space.record_write(slot_address);
        }
    }
}
