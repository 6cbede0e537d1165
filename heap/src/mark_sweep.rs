use object::{HeapObject, PointerVisitor, Value};

use crate::old_space::OldSpace;
use crate::space::SemiSpace;

/// Explicit worklist for tri-color marking; the object graph is cyclic, so
/// recursion is not an option.
pub struct MarkingStack {
    stack: Vec<HeapObject>,
}

impl MarkingStack {
    pub fn new() -> MarkingStack {
        MarkingStack { stack: Vec::with_capacity(128) }
    }

    pub fn push(&mut self, object: HeapObject) {
        self.stack.push(object);
    }

    pub fn pop(&mut self) -> Option<HeapObject> {
        self.stack.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Default for MarkingStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the transitive closure of everything it visits, across both the
/// new-space and the old-space (new-space marks only inform liveness; they
/// are cleared again after the cycle).
///
/// When constructed with a stack chain slot, every live stack object is
/// additionally linked through its `next` field; the program GC uses the
/// resulting chain to cook frames.
pub struct MarkingVisitor {
    new_space: *mut SemiSpace,
    old_space: *mut OldSpace,
    marking_stack: *mut MarkingStack,
    stack_chain: *mut Value,
    number_of_stacks: usize,
}

impl MarkingVisitor {
    /// # Safety
    ///
    /// The spaces and the marking stack must outlive the visitor.
    pub unsafe fn new(
        new_space: *mut SemiSpace,
        old_space: *mut OldSpace,
        marking_stack: *mut MarkingStack,
    ) -> Self {
        Self {
            new_space,
            old_space,
            marking_stack,
            stack_chain: core::ptr::null_mut(),
            number_of_stacks: 0,
        }
    }

    /// # Safety
    ///
    /// As [`MarkingVisitor::new`]; `stack_chain` must point at the
    /// program's chain slot, initialized to smi 0.
    pub unsafe fn with_stack_chain(
        new_space: *mut SemiSpace,
        old_space: *mut OldSpace,
        marking_stack: *mut MarkingStack,
        stack_chain: *mut Value,
    ) -> Self {
        let mut visitor = Self::new(new_space, old_space, marking_stack);
        visitor.stack_chain = stack_chain;
        visitor
    }

    pub fn number_of_stacks(&self) -> usize {
        self.number_of_stacks
    }

    unsafe fn mark_slot(&mut self, slot: *mut Value) {
        let value = *slot;
        if !value.is_heap_object() {
            return;
        }
        let address = value.address();
        let newly = if (*self.new_space).contains(address) {
            (*self.new_space).mark(address)
        } else if (*self.old_space).contains(address) {
            (*self.old_space).mark(address)
        } else {
            // Program-space pointer; the shared-heap cycle never moves it.
            return;
        };
        if !newly {
            return;
        }
        let object = HeapObject::at(address);
        if !self.stack_chain.is_null() && object.is_stack() {
            object.set_stack_next(*self.stack_chain);
            *self.stack_chain = object.to_value();
            self.number_of_stacks += 1;
        }
        (*self.marking_stack).push(object);
    }
}

impl PointerVisitor for MarkingVisitor {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            self.mark_slot(slot);
            slot = slot.add(1);
        }
    }
}

/// Drain the marking stack to a fixpoint.
///
/// # Safety
///
/// `marking_stack` must be the one the visitor pushes to.
pub unsafe fn process_marking_stack(
    marking_stack: *mut MarkingStack,
    visitor: &mut MarkingVisitor,
) {
    while let Some(object) = (*marking_stack).pop() {
        object.iterate_pointers(visitor);
    }
}

/// Compaction fix-up: rewrites pointers into old-space through the
/// destination table computed by the current compaction.
pub struct FixPointersVisitor {
    old_space: *const OldSpace,
}

impl FixPointersVisitor {
    /// # Safety
    ///
    /// `old_space` must outlive the visitor and have a valid destination
    /// table until `finish_compaction`.
    pub unsafe fn new(old_space: *const OldSpace) -> Self {
        Self { old_space }
    }
}

impl PointerVisitor for FixPointersVisitor {
    unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
        let mut slot = start;
        while slot < end {
            let value = *slot;
            if value.is_heap_object() {
                let address = value.address();
                if (*self.old_space).contains(address) {
                    if let Some(new_address) =
                        (*self.old_space).forwarding_address_of(address)
                    {
                        *slot = Value::from_address(new_address);
                    }
                }
            }
            slot = slot.add(1);
        }
    }
}
