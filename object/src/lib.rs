mod format;
mod heap_object;
mod value;
mod visitor;

pub use format::{InstanceFormat, Layout, Marker};
pub use heap_object::{round_up_to_word, HeapObject, CLASS_SIZE};
pub use value::{Value, WORD_SIZE};
pub use visitor::{HeapObjectPointerVisitor, HeapObjectVisitor, PointerVisitor};

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn smi_round_trip() {
        for &n in &[0isize, 1, -1, 42, -42, 1 << 28, -(1 << 28)] {
            let v = Value::from_word(n);
            assert!(v.is_smi());
            assert!(!v.is_heap_object());
            assert_eq!(unsafe { v.to_word() }, n);
        }
    }

    #[test]
    fn smi_zero_is_zero_bits() {
        assert_eq!(Value::from_word(0).raw(), 0);
        assert_eq!(Value::ZERO.raw(), 0);
    }

    #[test]
    fn heap_object_tagging() {
        let dummy: u64 = 0;
        let addr = &dummy as *const u64 as usize;
        let v = Value::from_address(addr);
        assert!(v.is_heap_object());
        assert!(!v.is_smi());
        assert_eq!(v.address(), addr);
    }

    #[test]
    fn portable_smi_range() {
        assert!(Value::is_valid_portable_smi(0));
        assert!(Value::is_valid_portable_smi((1 << 30) - 1));
        assert!(Value::is_valid_portable_smi(-(1 << 30)));
        assert!(!Value::is_valid_portable_smi(1 << 30));
        assert!(!Value::is_valid_portable_smi(-(1 << 30) - 1));
        // Valid natively on a 64-bit target, but not portably.
        #[cfg(target_pointer_width = "64")]
        {
            assert!(Value::is_valid_smi(1 << 40));
            assert!(!Value::is_valid_portable_smi(1 << 40));
        }
    }

    // ── Instance format packing ────────────────────────────────────

    #[test]
    fn format_round_trip() {
        let f = InstanceFormat::instance(3);
        assert_eq!(f.layout(), Layout::Instance);
        assert_eq!(f.marker(), Marker::None);
        assert_eq!(f.fixed_size(), 5 * WORD_SIZE);
        assert_eq!(f.field_count(), 3);

        let g = unsafe { InstanceFormat::from_smi(f.as_smi()) };
        assert_eq!(g.layout(), Layout::Instance);
        assert_eq!(g.fixed_size(), 5 * WORD_SIZE);
    }

    #[test]
    fn format_markers() {
        let f = InstanceFormat::instance_with_marker(0, Marker::Null);
        assert_eq!(f.marker(), Marker::Null);
        assert_eq!(f.fixed_size(), 2 * WORD_SIZE);
        assert_eq!(InstanceFormat::array().marker(), Marker::None);
    }

    #[test]
    fn zero_field_instance_is_two_words() {
        // The null/false/true adjacency invariant depends on this.
        assert_eq!(InstanceFormat::instance(0).fixed_size(), 2 * WORD_SIZE);
    }

    // ── Fabricated-object helpers ──────────────────────────────────

    /// A word-aligned scratch buffer posing as a heap.
    struct Scratch {
        words: Vec<usize>,
    }

    impl Scratch {
        fn new() -> Self {
            Self { words: vec![0; 256] }
        }

        fn object_at(&self, word_index: usize) -> HeapObject {
            HeapObject::at(&self.words[word_index] as *const usize as usize)
        }

        /// Fabricate a meta-class (self-referential) at `index`.
        fn make_meta_class(&mut self, index: usize) -> HeapObject {
            let meta = self.object_at(index);
            unsafe {
                meta.set_class(meta);
                meta.set_super_class(Value::ZERO);
                meta.set_instance_format(InstanceFormat::class());
                meta.set_methods(Value::ZERO);
            }
            meta
        }

        fn make_class(
            &mut self,
            index: usize,
            meta: HeapObject,
            format: InstanceFormat,
        ) -> HeapObject {
            let class = self.object_at(index);
            unsafe {
                class.set_class(meta);
                class.set_super_class(Value::ZERO);
                class.set_instance_format(format);
                class.set_methods(Value::ZERO);
            }
            class
        }
    }

    struct CollectSlots {
        slots: Vec<*mut Value>,
    }

    impl PointerVisitor for CollectSlots {
        unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
            let mut p = start;
            while p < end {
                self.slots.push(p);
                p = p.add(1);
            }
        }
    }

    // ── Layout and iteration ───────────────────────────────────────

    #[test]
    fn class_of_class_is_meta() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let array_class =
            scratch.make_class(8, meta, InstanceFormat::array());
        unsafe {
            assert_eq!(array_class.class(), meta);
            assert_eq!(meta.class(), meta);
            assert!(array_class.is_class());
            assert_eq!(array_class.size(), CLASS_SIZE);
        }
    }

    #[test]
    fn array_size_and_elements() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let array_class =
            scratch.make_class(8, meta, InstanceFormat::array());

        let array = scratch.object_at(16);
        unsafe {
            array.set_class(array_class);
            array.set_length(3);
            for i in 0..3 {
                array.set_element(i, Value::from_word(i as isize * 10));
            }
            assert!(array.is_array());
            assert_eq!(array.size(), (2 + 3) * WORD_SIZE);
            assert_eq!(array.element(2).to_word(), 20);
        }
    }

    #[test]
    fn byte_array_size_rounds_up() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let ba_class =
            scratch.make_class(8, meta, InstanceFormat::byte_array());

        let ba = scratch.object_at(16);
        unsafe {
            ba.set_class(ba_class);
            ba.set_length(5);
            assert_eq!(ba.size(), round_up_to_word(2 * WORD_SIZE + 5));
            ba.write_bytes(b"heaps");
            assert_eq!(ba.bytes(), b"heaps");
        }
    }

    #[test]
    fn function_layout_and_bytecode_addressing() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let function_class =
            scratch.make_class(8, meta, InstanceFormat::function());

        let function = scratch.object_at(16);
        unsafe {
            function.set_class(function_class);
            function.init_function(2, 1, 4);
            function.set_literal(0, Value::from_word(7));
            function.write_bytecodes(&[1, 2, 3, 4]);

            assert!(function.is_function());
            assert_eq!(function.arity(), 2);
            let base = function.bytecode_address_for(0);
            assert_eq!(function.bytecode_address_for(3), base + 3);
            assert!(function.contains_bytecode_address(base + 3));
            assert!(!function.contains_bytecode_address(base + 4));
            assert_eq!(
                function.size(),
                round_up_to_word(4 * WORD_SIZE + WORD_SIZE + 4)
            );
            assert_eq!(function.bytecodes(), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn instance_identity_hash_and_immutability() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let class =
            scratch.make_class(8, meta, InstanceFormat::instance(1));

        let instance = scratch.object_at(16);
        unsafe {
            instance.set_class(class);
            instance.clear_flags();
            instance.set_field(0, Value::from_word(99));

            instance.set_identity_hash(0xDEAD_BEEF);
            instance.set_immutable(true);
            assert_eq!(instance.identity_hash(), 0xDEAD_BEEF);
            assert!(instance.is_immutable());

            instance.set_identity_hash(1);
            assert!(instance.is_immutable(), "hash update keeps flags");
            assert_eq!(instance.field(0).to_word(), 99);
        }
    }

    #[test]
    fn iterate_pointers_visits_each_pointer_slot_once() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let class =
            scratch.make_class(8, meta, InstanceFormat::instance(2));

        let instance = scratch.object_at(16);
        unsafe {
            instance.set_class(class);
            instance.clear_flags();
            instance.set_field(0, Value::from_word(1));
            instance.set_field(1, Value::from_word(2));

            let mut collect = CollectSlots { slots: Vec::new() };
            instance.iterate_pointers(&mut collect);
            // class + 2 fields; the flags word is structural.
            assert_eq!(collect.slots.len(), 3);
            assert_eq!(collect.slots[0], instance.slot_at(0));
        }
    }

    #[test]
    fn stack_iteration_covers_live_slice_only() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let stack_class =
            scratch.make_class(8, meta, InstanceFormat::stack());

        let stack = scratch.object_at(16);
        unsafe {
            stack.set_class(stack_class);
            stack.set_length(8);
            stack.set_stack_top(5);
            stack.set_stack_next(Value::ZERO);
            for i in 0..8 {
                stack.set_stack_slot(i, Value::from_word(i as isize));
            }

            let mut collect = CollectSlots { slots: Vec::new() };
            stack.iterate_pointers(&mut collect);
            // class + next + slots[5..8].
            assert_eq!(collect.slots.len(), 5);
            assert_eq!(stack.size(), (4 + 8) * WORD_SIZE);
        }
    }

    #[test]
    fn dispatch_entry_skips_code_word() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let entry_class = scratch
            .make_class(8, meta, InstanceFormat::dispatch_table_entry());

        let entry = scratch.object_at(16);
        unsafe {
            entry.set_class(entry_class);
            entry.set_entry_target(Value::from_word(0));
            entry.set_entry_code(0xF00D_F00D);
            entry.set_entry_selector(Value::from_word(17));

            let mut collect = CollectSlots { slots: Vec::new() };
            entry.iterate_pointers(&mut collect);
            // class + target only.
            assert_eq!(collect.slots.len(), 2);

            let mut everything = CollectSlots { slots: Vec::new() };
            entry.iterate_everything(&mut everything);
            // class + target + selector.
            assert_eq!(everything.slots.len(), 3);
            assert_eq!(entry.entry_code(), 0xF00D_F00D);
        }
    }

    // ── Forwarding ─────────────────────────────────────────────────

    #[test]
    fn forwarding_overwrites_class_word() {
        let mut scratch = Scratch::new();
        let meta = scratch.make_meta_class(0);
        let class =
            scratch.make_class(8, meta, InstanceFormat::instance(0));

        let instance = scratch.object_at(16);
        unsafe {
            instance.set_class(class);
            instance.clear_flags();
            assert!(!instance.has_forwarding_address());

            let destination = scratch.object_at(32).address();
            instance.set_forwarding_address(destination);
            assert!(instance.has_forwarding_address());
            assert_eq!(instance.forwarding_address(), destination);
        }
    }
}
