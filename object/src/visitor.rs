use crate::heap_object::HeapObject;
use crate::value::Value;

/// Visits slots that may contain heap pointers.
///
/// Slots are passed as raw pointers so a visitor can rewrite them in place
/// (scavenge forwarding, compaction fix-up). Visitors must tolerate smis and
/// raw words in the visited slots and filter by tag and space containment.
pub trait PointerVisitor {
    /// Visit a single slot. Defaults to a one-slot block visit.
    fn visit(&mut self, slot: *mut Value) {
        unsafe { self.visit_block(slot, slot.add(1)) }
    }

    /// Visit the half-open slot range `[start, end)`.
    ///
    /// # Safety
    ///
    /// `start..end` must be a valid range of initialized `Value` slots.
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value);
}

/// Visits whole heap objects during a space walk.
pub trait HeapObjectVisitor {
    /// Visit one object and return its size in bytes so the walk can
    /// advance to the next object.
    fn visit(&mut self, object: HeapObject) -> usize;
}

/// Adapts a [`PointerVisitor`] to a space walk: every object's pointer
/// slots are fed to the wrapped visitor.
pub struct HeapObjectPointerVisitor<'a> {
    visitor: &'a mut dyn PointerVisitor,
}

impl<'a> HeapObjectPointerVisitor<'a> {
    pub fn new(visitor: &'a mut dyn PointerVisitor) -> Self {
        Self { visitor }
    }
}

impl HeapObjectVisitor for HeapObjectPointerVisitor<'_> {
    fn visit(&mut self, object: HeapObject) -> usize {
        unsafe {
            object.iterate_pointers(self.visitor);
            object.size()
        }
    }
}
