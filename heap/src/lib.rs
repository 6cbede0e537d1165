mod chunk;
mod mark_sweep;
mod old_space;
mod scavenger;
mod space;
mod system;
mod two_space;

pub use chunk::Chunk;
pub use mark_sweep::{
    process_marking_stack, FixPointersVisitor, MarkingStack, MarkingVisitor,
};
pub use old_space::OldSpace;
pub use scavenger::{
    process_weak_pointers_after_scavenge, GenerationalScavengeVisitor,
    ScavengeVisitor,
};
pub use space::{
    filler_size, write_filler, NoAllocationFailureScope, SemiSpace,
    WeakPointer, FREE_REGION_MARKER, ONE_WORD_FILLER,
};
pub use system::{map_memory, unmap_memory, PAGE_SIZE};
pub use two_space::TwoSpaceHeap;

#[cfg(test)]
mod tests {
    use super::*;
    use object::{
        HeapObject, HeapObjectVisitor, InstanceFormat, PointerVisitor, Value,
        WORD_SIZE,
    };
    use std::cell::Cell;
    use std::rc::Rc;

    // ── Fixtures ───────────────────────────────────────────────────

    /// A tiny immutable "program space" holding the classes the mutable
    /// heap's objects point at; the shared-heap collectors never move it.
    struct TestClasses {
        _program: Box<SemiSpace>,
        meta: HeapObject,
        instance: HeapObject,
    }

    fn make_classes() -> TestClasses {
        let mut program = Box::new(SemiSpace::new(16 * 1024));
        unsafe {
            let meta =
                HeapObject::at(program.allocate(4 * WORD_SIZE).unwrap());
            meta.set_class(meta);
            meta.set_super_class(Value::ZERO);
            meta.set_instance_format(InstanceFormat::class());
            meta.set_methods(Value::ZERO);

            let instance =
                HeapObject::at(program.allocate(4 * WORD_SIZE).unwrap());
            instance.set_class(meta);
            instance.set_super_class(Value::ZERO);
            instance.set_instance_format(InstanceFormat::instance(2));
            instance.set_methods(Value::ZERO);

            TestClasses { _program: program, meta, instance }
        }
    }

    /// Write a two-field instance at `address`.
    unsafe fn init_instance(address: usize, classes: &TestClasses) -> HeapObject {
        let object = HeapObject::at(address);
        object.set_class(classes.instance);
        object.clear_flags();
        object.set_field(0, Value::ZERO);
        object.set_field(1, Value::ZERO);
        object
    }

    const INSTANCE_SIZE: usize = 4 * WORD_SIZE;

    struct CountObjects {
        count: usize,
        bytes: usize,
    }

    impl HeapObjectVisitor for CountObjects {
        fn visit(&mut self, object: HeapObject) -> usize {
            let size = unsafe { object.size() };
            self.count += 1;
            self.bytes += size;
            size
        }
    }

    /// One full new-space scavenge, the way the program object drives it.
    unsafe fn scavenge(heap: &mut TwoSpaceHeap, roots: &mut [Value]) -> bool {
        let from: *mut SemiSpace = heap.new_space();
        let old: *mut OldSpace = heap.old_space();
        let to: *mut SemiSpace = heap.unused_space();
        (*to).reset();

        let mut visitor = GenerationalScavengeVisitor::new(from, to, old);
        if !roots.is_empty() {
            visitor.visit_block(
                roots.as_mut_ptr(),
                roots.as_mut_ptr().add(roots.len()),
            );
        }
        for slot in (*old).remembered_slots() {
            visitor.visit(slot as *mut Value);
        }
        visitor.complete_scavenge();
        process_weak_pointers_after_scavenge(from, to, old);
        let trigger = visitor.trigger_old_space_gc();
        (*old).prune_remembered_set(|address| unsafe { (*to).contains(address) });
        heap.swap_semi_spaces();
        trigger
    }

    fn test_heap() -> TwoSpaceHeap {
        TwoSpaceHeap::new(16 * 1024, 32 * 1024, 256 * 1024)
    }

    // ── Semi-space ─────────────────────────────────────────────────

    #[test]
    fn semi_space_bump_allocation_and_iteration() {
        let classes = make_classes();
        let mut space = SemiSpace::new(16 * 1024);
        unsafe {
            for _ in 0..3 {
                let address = space.allocate(INSTANCE_SIZE).unwrap();
                init_instance(address, &classes);
            }
        }
        assert_eq!(space.used(), 3 * INSTANCE_SIZE);

        space.flush();
        let mut count = CountObjects { count: 0, bytes: 0 };
        space.iterate_objects(&mut count);
        assert_eq!(count.count, 3);
        assert_eq!(count.bytes, 3 * INSTANCE_SIZE);
    }

    #[test]
    fn semi_space_fails_full_then_grows_in_scope() {
        let classes = make_classes();
        let mut space = SemiSpace::new(4096);
        unsafe {
            while let Some(address) = space.allocate(INSTANCE_SIZE) {
                init_instance(address, &classes);
            }
            let chunks_before = space.chunk_count();
            {
                let _scope = NoAllocationFailureScope::new(&mut space);
                let address = space.allocate(INSTANCE_SIZE).unwrap();
                init_instance(address, &classes);
            }
            assert_eq!(space.chunk_count(), chunks_before + 1);
            // Back out of the scope the space fails again once full.
            assert!(!space.in_no_failure_scope());
        }
    }

    #[test]
    fn object_containing_resolves_interior_addresses() {
        let classes = make_classes();
        let mut space = SemiSpace::new(4096);
        unsafe {
            let a = init_instance(
                space.allocate(INSTANCE_SIZE).unwrap(),
                &classes,
            );
            let b = init_instance(
                space.allocate(INSTANCE_SIZE).unwrap(),
                &classes,
            );
            space.flush();
            let interior = b.address() + WORD_SIZE;
            assert_eq!(space.object_containing(interior), Some(b));
            assert_eq!(space.object_containing(a.address()), Some(a));
            assert_eq!(space.object_containing(space.chunk_start(0) - 8), None);
        }
    }

    // ── Old-space sweep ────────────────────────────────────────────

    #[test]
    fn sweep_rebuilds_free_list_from_unmarked() {
        let classes = make_classes();
        let mut old = OldSpace::new(32 * 1024, 256 * 1024);
        unsafe {
            let a = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let b = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let c = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);

            old.mark(b.address());
            let used = old.sweep();
            assert_eq!(used, INSTANCE_SIZE);
            old.clear_mark_bits();

            // The region before b is reused first.
            let recycled = old.allocate(INSTANCE_SIZE).unwrap();
            assert_eq!(recycled, a.address());
            let _ = c;
        }
    }

    // ── Old-space compaction ───────────────────────────────────────

    #[test]
    fn compaction_slides_live_objects_and_fixes_pointers() {
        let classes = make_classes();
        let mut old = OldSpace::new(32 * 1024, 256 * 1024);
        unsafe {
            let a = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let b = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let c = init_instance(old.allocate(INSTANCE_SIZE).unwrap(), &classes);
            a.set_field(0, c.to_value());
            let mut root = a.to_value();

            old.mark(a.address());
            old.mark(c.address());

            old.compute_compaction_destinations();
            // b dies, so c slides into its slot.
            assert_eq!(old.forwarding_address_of(c.address()), Some(b.address()));
            assert_eq!(old.forwarding_address_of(a.address()), Some(a.address()));

            let mut fix = FixPointersVisitor::new(&old);
            old.perform_compaction(&mut fix);
            fix.visit(&mut root);
            old.finish_compaction();
            old.clear_mark_bits();

            assert_eq!(old.used(), 2 * INSTANCE_SIZE);
            let moved_a = HeapObject::from_value(root);
            assert_eq!(moved_a, a);
            assert_eq!(moved_a.field(0).address(), b.address());
        }
    }

    // ── Scavenging ─────────────────────────────────────────────────

    #[test]
    fn scavenge_preserves_reachable_and_reclaims_garbage() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let y = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let _garbage =
                init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            x.set_field(0, y.to_value());

            let mut roots = vec![x.to_value()];
            scavenge(&mut heap, &mut roots);

            assert_eq!(heap.new_space_ref().used(), 2 * INSTANCE_SIZE);
            let moved_x = HeapObject::from_value(roots[0]);
            assert_ne!(moved_x, x);
            let moved_y = HeapObject::from_value(moved_x.field(0));
            assert_eq!(moved_y.class(), classes.instance);
            assert_eq!(classes.meta.class(), classes.meta);
        }
    }

    #[test]
    fn cyclic_graph_scavenges_once() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let y = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            x.set_field(0, y.to_value());
            y.set_field(0, x.to_value());

            let mut roots = vec![x.to_value()];
            scavenge(&mut heap, &mut roots);

            assert_eq!(heap.new_space_ref().used(), 2 * INSTANCE_SIZE);
            let moved_x = HeapObject::from_value(roots[0]);
            let moved_y = HeapObject::from_value(moved_x.field(0));
            assert_eq!(moved_y.field(0), moved_x.to_value());
        }
    }

    #[test]
    fn promotion_on_second_survival() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let mut roots = vec![x.to_value()];

            scavenge(&mut heap, &mut roots);
            assert!(heap.new_space_ref().contains(roots[0].address()));

            scavenge(&mut heap, &mut roots);
            assert!(heap.old_space_ref().contains(roots[0].address()));
            assert_eq!(heap.old_space_ref().used(), INSTANCE_SIZE);
        }
    }

    #[test]
    fn remembered_set_keeps_young_target_alive() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let mut roots = vec![x.to_value()];
            scavenge(&mut heap, &mut roots);
            scavenge(&mut heap, &mut roots);
            let old_x = HeapObject::from_value(roots[0]);
            assert!(heap.old_space_ref().contains(old_x.address()));

            // Store a young pointer into the tenured object; the barrier
            // records the slot.
            let y = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            old_x.set_field(0, y.to_value());
            heap.record_write(old_x.slot_at(2), y.to_value());
            assert_eq!(heap.old_space_ref().remembered_set_size(), 1);

            // y is reachable only through the remembered set.
            let mut no_roots: Vec<Value> = Vec::new();
            scavenge(&mut heap, &mut no_roots);

            let moved_y = HeapObject::from_value(old_x.field(0));
            assert!(heap.new_space_ref().contains(moved_y.address()));
            assert_eq!(moved_y.class(), classes.instance);
            assert_eq!(heap.old_space_ref().remembered_set_size(), 1);
        }
    }

    #[test]
    fn promoted_object_slots_enter_remembered_set() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let mut roots = vec![x.to_value()];
            scavenge(&mut heap, &mut roots);

            // x survived once; give it a brand-new young neighbour, then
            // scavenge again: x promotes while y stays young.
            let x1 = HeapObject::from_value(roots[0]);
            let y = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            x1.set_field(0, y.to_value());

            scavenge(&mut heap, &mut roots);
            let promoted = HeapObject::from_value(roots[0]);
            assert!(heap.old_space_ref().contains(promoted.address()));
            let young = HeapObject::from_value(promoted.field(0));
            assert!(heap.new_space_ref().contains(young.address()));
            assert!(heap
                .old_space_ref()
                .remembered_set_contains(promoted.slot_at(2) as usize));
        }
    }

    // ── Weak pointers ──────────────────────────────────────────────

    #[test]
    fn weak_pointer_fires_on_death_and_follows_survivor() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let live = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let dead = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);

            let fired = Rc::new(Cell::new(false));
            let fired_clone = fired.clone();
            heap.new_space().register_weak_pointer(WeakPointer {
                object: dead.to_value(),
                callback: Box::new(move |_| fired_clone.set(true)),
            });
            heap.new_space().register_weak_pointer(WeakPointer {
                object: live.to_value(),
                callback: Box::new(|_| panic!("survivor must not fire")),
            });

            let mut roots = vec![live.to_value()];
            scavenge(&mut heap, &mut roots);
            assert!(fired.get());

            let survivors = heap.new_space().take_weak_pointers();
            assert_eq!(survivors.len(), 1);
            assert_eq!(survivors[0].object, roots[0]);
        }
    }

    // ── Marking ────────────────────────────────────────────────────

    #[test]
    fn marking_covers_both_spaces_and_chains_no_stacks() {
        let classes = make_classes();
        let mut heap = test_heap();
        unsafe {
            let x = init_instance(heap.allocate(INSTANCE_SIZE).unwrap(), &classes);
            let tenured =
                init_instance(heap.old_space().allocate(INSTANCE_SIZE).unwrap(), &classes);
            x.set_field(0, tenured.to_value());
            let mut roots = vec![x.to_value()];

            let new_space: *mut SemiSpace = heap.new_space();
            let old_space: *mut OldSpace = heap.old_space();
            let mut marking_stack = MarkingStack::new();
            let mut chain = Value::ZERO;
            let mut visitor = MarkingVisitor::with_stack_chain(
                new_space,
                old_space,
                &mut marking_stack,
                &mut chain,
            );
            visitor.visit_block(
                roots.as_mut_ptr(),
                roots.as_mut_ptr().add(roots.len()),
            );
            process_marking_stack(&mut marking_stack, &mut visitor);

            assert_eq!(visitor.number_of_stacks(), 0);
            assert_eq!(chain, Value::ZERO);
            assert!((*new_space).is_marked(x.address()));
            assert!((*old_space).is_marked(tenured.address()));

            (*new_space).clear_mark_bits();
            (*old_space).clear_mark_bits();
        }
    }
}
