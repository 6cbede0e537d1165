use object::{HeapObject, PointerVisitor, Value};

use crate::old_space::OldSpace;
use crate::space::{filler_size, SemiSpace, WeakPointer};

/// Cheney copy collector for a single space: used by the program GC, where
/// the destination grows under a no-allocation-failure scope.
///
/// Holds raw space pointers because it rewrites slots inside the very
/// spaces it walks.
pub struct ScavengeVisitor {
    from: *mut SemiSpace,
    to: *mut SemiSpace,
}

impl ScavengeVisitor {
    /// # Safety
    ///
    /// Both spaces must outlive the visitor and not be moved while it runs.
    pub unsafe fn new(from: *mut SemiSpace, to: *mut SemiSpace) -> Self {
        Self { from, to }
    }

    unsafe fn scavenge_slot(&mut self, slot: *mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let address = value.address();
        if !(*self.from).contains(address) {
            return;
        }
        let object = HeapObject::at(address);
        if object.has_forwarding_address() {
            *slot = Value::from_address(object.forwarding_address());
            return;
        }
        let size = object.size();
        let new_address = match (*self.to).allocate(size) {
            Some(a) => a,
            None => panic!("scavenge destination exhausted outside a no-allocation-failure scope"),
        };
        core::ptr::copy_nonoverlapping(
            address as *const u8,
            new_address as *mut u8,
            size,
        );
        object.set_forwarding_address(new_address);
        *slot = Value::from_address(new_address);
    }

    /// Drive the scan pointer over the destination until the transitive
    /// closure of everything visited so far has been copied.
    pub fn complete_scavenge(&mut self) {
        unsafe {
            let mut chunk = 0;
            let mut scan = (*self.to).chunk_start(0);
            loop {
                let limit = (*self.to).scan_limit(chunk);
                if scan >= limit {
                    if chunk == (*self.to).current_chunk() {
                        break;
                    }
                    chunk += 1;
                    scan = (*self.to).chunk_start(chunk);
                    continue;
                }
                if let Some(bytes) = filler_size(scan) {
                    scan += bytes;
                    continue;
                }
                let object = HeapObject::at(scan);
                let size = object.size();
                object.iterate_pointers(self);
                scan += size;
            }
        }
    }
}

impl PointerVisitor for ScavengeVisitor {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            self.scavenge_slot(slot);
            slot = slot.add(1);
        }
    }
}

/// Records old-space slots of a freshly promoted object that still point
/// into the scavenge destination, keeping the remembered set complete.
struct NewSpacePointerRecorder {
    to: *const SemiSpace,
    old: *mut OldSpace,
}

impl PointerVisitor for NewSpacePointerRecorder {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            let value = *slot;
            if value.is_heap_object() && (*self.to).contains(value.address()) {
                (*self.old).record_write(slot as usize);
            }
            slot = slot.add(1);
        }
    }
}

/// The new-space collector: Cheney copy with promotion into old-space for
/// objects that have already survived one scavenge (they lie below the
/// from-space water mark) and for overflow when the destination fills.
pub struct GenerationalScavengeVisitor {
    from: *mut SemiSpace,
    to: *mut SemiSpace,
    old: *mut OldSpace,
    promoted: Vec<usize>,
    trigger_old_space_gc: bool,
}

impl GenerationalScavengeVisitor {
    /// # Safety
    ///
    /// All three spaces must outlive the visitor and not be moved while it
    /// runs.
    pub unsafe fn new(
        from: *mut SemiSpace,
        to: *mut SemiSpace,
        old: *mut OldSpace,
    ) -> Self {
        Self { from, to, old, promoted: Vec::new(), trigger_old_space_gc: false }
    }

    pub fn trigger_old_space_gc(&self) -> bool {
        self.trigger_old_space_gc
    }

    unsafe fn scavenge_slot(&mut self, slot: *mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let address = value.address();
        if !(*self.from).contains(address) {
            return;
        }
        let object = HeapObject::at(address);
        if object.has_forwarding_address() {
            *slot = Value::from_address(object.forwarding_address());
            return;
        }
        let size = object.size();

        if (*self.from).is_below_water_mark(address) {
            if let Some(new_address) = (*self.old).allocate(size) {
                self.move_object(object, new_address, size, slot);
                self.promoted.push(new_address);
                if (*self.old).needs_garbage_collection() {
                    self.trigger_old_space_gc = true;
                }
                return;
            }
            // Old-space is at its budget; keep the object young and make
            // sure the next old-space cycle happens.
            self.trigger_old_space_gc = true;
        }

        match (*self.to).allocate(size) {
            Some(new_address) => {
                self.move_object(object, new_address, size, slot);
            }
            None => {
                // The destination filled early (promotions freed less room
                // than predicted); spill to old-space.
                let new_address = match (*self.old).allocate(size) {
                    Some(a) => a,
                    None => panic!("out of memory scavenging new-space"),
                };
                self.move_object(object, new_address, size, slot);
                self.promoted.push(new_address);
                self.trigger_old_space_gc = true;
            }
        }
    }

    unsafe fn move_object(
        &mut self,
        object: HeapObject,
        new_address: usize,
        size: usize,
        slot: *mut Value,
    ) {
        core::ptr::copy_nonoverlapping(
            object.address() as *const u8,
            new_address as *mut u8,
            size,
        );
        object.set_forwarding_address(new_address);
        *slot = Value::from_address(new_address);
    }

    /// Work loop: a scan pointer over the destination plus the promotion
    /// queue for copies that landed in old-space.
    pub fn complete_scavenge(&mut self) {
        unsafe {
            let mut chunk = 0;
            let mut scan = (*self.to).chunk_start(0);
            loop {
                while let Some(address) = self.promoted.pop() {
                    let object = HeapObject::at(address);
                    object.iterate_pointers(self);
                    let mut recorder = NewSpacePointerRecorder {
                        to: self.to,
                        old: self.old,
                    };
                    object.iterate_pointers(&mut recorder);
                }
                let limit = (*self.to).scan_limit(chunk);
                if scan >= limit {
                    if chunk == (*self.to).current_chunk() {
                        if self.promoted.is_empty() {
                            break;
                        }
                        continue;
                    }
                    chunk += 1;
                    scan = (*self.to).chunk_start(chunk);
                    continue;
                }
                if let Some(bytes) = filler_size(scan) {
                    scan += bytes;
                    continue;
                }
                let object = HeapObject::at(scan);
                let size = object.size();
                object.iterate_pointers(self);
                scan += size;
            }
        }
    }
}

impl PointerVisitor for GenerationalScavengeVisitor {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            self.scavenge_slot(slot);
            slot = slot.add(1);
        }
    }
}

/// Weak-pointer pass after the copy loop: dead referents fire their
/// callbacks, survivors follow their forwarding pointers into the
/// destination's (or, when promoted, the old-space's) weak list.
///
/// # Safety
///
/// The spaces must be the ones the scavenge just ran over.
pub unsafe fn process_weak_pointers_after_scavenge(
    from: *mut SemiSpace,
    to: *mut SemiSpace,
    old: *mut OldSpace,
) {
    for mut weak in (*from).take_weak_pointers() {
        let object = HeapObject::from_value(weak.object);
        if object.has_forwarding_address() {
            let new_address = object.forwarding_address();
            weak.object = Value::from_address(new_address);
            if (*old).contains(new_address) {
                (*old).push_weak_pointer(weak);
            } else {
                (*to).push_weak_pointer(WeakPointer {
                    object: weak.object,
                    callback: weak.callback,
                });
            }
        } else {
            (weak.callback)(object);
        }
    }
}
