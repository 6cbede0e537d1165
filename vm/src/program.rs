use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use heap::{
    process_marking_stack, process_weak_pointers_after_scavenge,
    FixPointersVisitor, GenerationalScavengeVisitor, MarkingStack,
    MarkingVisitor, NoAllocationFailureScope, OldSpace, ScavengeVisitor,
    SemiSpace, TwoSpaceHeap,
};
use object::{
    round_up_to_word, HeapObject, HeapObjectPointerVisitor, HeapObjectVisitor,
    InstanceFormat, Layout, Marker, PointerVisitor, Value, CLASS_SIZE,
    WORD_SIZE,
};

use crate::bytecode::{compute_intrinsic, IntrinsicsTable};
use crate::debug_info::DebugInfo;
use crate::flags::Flags;
use crate::frame::{push_initial_entry_frames, Frame};
use crate::lookup_cache::LookupCache;
use crate::port::{cleanup_ports_after_mark, cleanup_ports_after_scavenge};
use crate::process::{Process, ProcessState, Signal};
use crate::snapshot::PopularityCounter;
use crate::AllocationFailed;

pub const COMPILE_TIME_ERROR_EXIT_CODE: i32 = 254;
pub const UNCAUGHT_EXCEPTION_EXIT_CODE: i32 = 255;

const FUNCTION_HEADER_SIZE: usize = 4 * WORD_SIZE;
const STACK_HEADER_SIZE: usize = 4 * WORD_SIZE;
const INITIAL_STACK_LENGTH: usize = 256;

/// The per-program image: the immutable program heap with its well-known
/// roots, the shared mutable process heap, the process list, and the
/// caches (lookup cache, dispatch-table code words, breakpoint table)
/// that must be invalidated around a program GC.
pub struct Program {
    // Roots, visited in declaration order. The null/false/true triple is
    // allocated first and in this exact order so that
    // `&false - &null == &true - &false == 2 words`, which the
    // interpreter's boolean checks rely on.
    null_object: Value,
    false_object: Value,
    true_object: Value,
    empty_array: Value,
    empty_string: Value,
    meta_class: Value,
    object_class: Value,
    bool_class: Value,
    null_class: Value,
    array_class: Value,
    byte_array_class: Value,
    one_byte_string_class: Value,
    two_byte_string_class: Value,
    function_class: Value,
    stack_class: Value,
    coroutine_class: Value,
    port_class: Value,
    initializer_class: Value,
    dispatch_table_entry_class: Value,
    double_class: Value,
    large_integer_class: Value,
    num_class: Value,
    int_class: Value,
    smi_class: Value,
    boxed_class: Value,
    stack_overflow_error_class: Value,
    stack_overflow_error: Value,
    raw_retry_after_gc: Value,
    raw_wrong_argument_type: Value,
    raw_index_out_of_bounds: Value,
    raw_illegal_state: Value,
    dispatch_table: Value,
    native_failure_result: Value,
    entry: Value,

    program_heap: SemiSpace,
    process_heap: TwoSpaceHeap,
    process_list: Mutex<Vec<*mut Process>>,
    random: SmallRng,
    /// Head of the stack chain built during program GC; smi 0 when idle.
    stack_chain: Value,
    cooked_stack_deltas: Vec<Vec<usize>>,
    cache: Option<LookupCache>,
    debug_info: Option<DebugInfo>,
    exit_kind: Signal,
    flags: Flags,
}

impl Program {
    pub fn new(flags: Flags) -> Program {
        flags.validate().expect("invalid flags");
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ std::process::id() as u64;
        Program {
            null_object: Value::ZERO,
            false_object: Value::ZERO,
            true_object: Value::ZERO,
            empty_array: Value::ZERO,
            empty_string: Value::ZERO,
            meta_class: Value::ZERO,
            object_class: Value::ZERO,
            bool_class: Value::ZERO,
            null_class: Value::ZERO,
            array_class: Value::ZERO,
            byte_array_class: Value::ZERO,
            one_byte_string_class: Value::ZERO,
            two_byte_string_class: Value::ZERO,
            function_class: Value::ZERO,
            stack_class: Value::ZERO,
            coroutine_class: Value::ZERO,
            port_class: Value::ZERO,
            initializer_class: Value::ZERO,
            dispatch_table_entry_class: Value::ZERO,
            double_class: Value::ZERO,
            large_integer_class: Value::ZERO,
            num_class: Value::ZERO,
            int_class: Value::ZERO,
            smi_class: Value::ZERO,
            boxed_class: Value::ZERO,
            stack_overflow_error_class: Value::ZERO,
            stack_overflow_error: Value::ZERO,
            raw_retry_after_gc: Value::ZERO,
            raw_wrong_argument_type: Value::ZERO,
            raw_index_out_of_bounds: Value::ZERO,
            raw_illegal_state: Value::ZERO,
            dispatch_table: Value::ZERO,
            native_failure_result: Value::ZERO,
            entry: Value::ZERO,
            program_heap: SemiSpace::new(flags.program_space_size),
            process_heap: TwoSpaceHeap::new(
                flags.semi_space_size,
                flags.old_space_chunk_size,
                flags.old_space_budget,
            ),
            process_list: Mutex::new(Vec::new()),
            random: SmallRng::seed_from_u64(seed),
            stack_chain: Value::ZERO,
            cooked_stack_deltas: Vec::new(),
            cache: None,
            debug_info: None,
            exit_kind: Signal::Terminated,
            flags,
        }
    }

    // ── Root accessors ─────────────────────────────────────────────

    pub fn null_object(&self) -> Value {
        self.null_object
    }

    pub fn false_object(&self) -> Value {
        self.false_object
    }

    pub fn true_object(&self) -> Value {
        self.true_object
    }

    pub fn empty_array(&self) -> Value {
        self.empty_array
    }

    pub fn empty_string(&self) -> Value {
        self.empty_string
    }

    pub fn meta_class(&self) -> Value {
        self.meta_class
    }

    pub fn object_class(&self) -> Value {
        self.object_class
    }

    pub fn array_class(&self) -> Value {
        self.array_class
    }

    pub fn function_class(&self) -> Value {
        self.function_class
    }

    pub fn stack_class(&self) -> Value {
        self.stack_class
    }

    pub fn coroutine_class(&self) -> Value {
        self.coroutine_class
    }

    pub fn double_class(&self) -> Value {
        self.double_class
    }

    pub fn large_integer_class(&self) -> Value {
        self.large_integer_class
    }

    pub fn stack_overflow_error(&self) -> Value {
        self.stack_overflow_error
    }

    pub fn dispatch_table(&self) -> Value {
        self.dispatch_table
    }

    pub fn set_dispatch_table(&mut self, table: Value) {
        self.dispatch_table = table;
    }

    pub fn entry(&self) -> Value {
        self.entry
    }

    pub fn set_entry(&mut self, entry: Value) {
        self.entry = entry;
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn program_space(&self) -> &SemiSpace {
        &self.program_heap
    }

    pub fn process_heap(&mut self) -> &mut TwoSpaceHeap {
        &mut self.process_heap
    }

    pub fn exit_kind(&self) -> Signal {
        self.exit_kind
    }

    /// The snapshot-relative offset of a program-space object; only
    /// meaningful once the snapshot GC has packed the heap.
    pub fn offset_of(&self, object: HeapObject) -> usize {
        debug_assert!(self.program_heap.contains(object.address()));
        object.address() - self.program_heap.chunk_start(0)
    }

    pub fn object_at_offset(&self, offset: usize) -> HeapObject {
        HeapObject::at(self.program_heap.chunk_start(0) + offset)
    }

    pub fn exit_code(&self) -> i32 {
        match self.exit_kind {
            Signal::Terminated => 0,
            Signal::CompileTimeError => COMPILE_TIME_ERROR_EXIT_CODE,
            Signal::UncaughtException
            | Signal::UnhandledSignal
            | Signal::Killed => UNCAUGHT_EXCEPTION_EXIT_CODE,
            Signal::ShouldKill => {
                panic!("should-kill is not a terminal state")
            }
        }
    }

    // ── Initialization ─────────────────────────────────────────────

    /// Build the root set. Runs under a no-allocation-failure scope, so
    /// the program heap grows by chunks instead of failing.
    pub fn initialize(&mut self) {
        unsafe {
            let _scope =
                NoAllocationFailureScope::new(&mut self.program_heap);

            // null, false and true are reserved first, in this order, so
            // the interpreter can tell them apart by address arithmetic.
            let null_address = self.reserve(2 * WORD_SIZE);
            let false_address = self.reserve(2 * WORD_SIZE);
            let true_address = self.reserve(2 * WORD_SIZE);
            self.null_object = Value::from_address(null_address);

            // The meta-class is its own class.
            let meta_address = self.reserve(CLASS_SIZE);
            let meta = HeapObject::at(meta_address);
            meta.set_class(meta);
            meta.set_super_class(self.null_object);
            meta.set_instance_format(InstanceFormat::class());
            meta.set_methods(self.null_object);
            self.meta_class = meta.to_value();

            self.array_class = self.init_class(InstanceFormat::array());
            self.empty_array = must(self.create_array(0, self.null_object));

            self.object_class = self.init_class(InstanceFormat::instance(0));
            self.num_class = self.init_class(InstanceFormat::instance(0));
            self.set_super(self.num_class, self.object_class);
            self.int_class = self.init_class(InstanceFormat::instance(0));
            self.set_super(self.int_class, self.num_class);
            self.smi_class = self.init_class(InstanceFormat::instance(0));
            self.set_super(self.smi_class, self.int_class);
            self.large_integer_class =
                self.init_class(InstanceFormat::large_integer());
            self.set_super(self.large_integer_class, self.int_class);
            self.double_class = self.init_class(InstanceFormat::double());
            self.set_super(self.double_class, self.num_class);

            self.boxed_class = self.init_class(InstanceFormat::boxed());
            self.stack_class = self.init_class(InstanceFormat::stack());
            self.coroutine_class = self.init_class(
                InstanceFormat::instance_with_marker(2, Marker::Coroutine),
            );
            self.port_class = self.init_class(
                InstanceFormat::instance_with_marker(1, Marker::Port),
            );
            self.initializer_class =
                self.init_class(InstanceFormat::initializer());
            self.dispatch_table_entry_class =
                self.init_class(InstanceFormat::dispatch_table_entry());

            self.one_byte_string_class =
                self.init_class(InstanceFormat::one_byte_string());
            self.set_super(self.one_byte_string_class, self.object_class);
            self.two_byte_string_class =
                self.init_class(InstanceFormat::two_byte_string());
            self.set_super(self.two_byte_string_class, self.object_class);
            self.empty_string = must(self.create_one_byte_string(b""));

            self.function_class = self.init_class(InstanceFormat::function());
            self.byte_array_class =
                self.init_class(InstanceFormat::byte_array());

            // Null class and the null singleton.
            self.null_class = self.init_class(
                InstanceFormat::instance_with_marker(0, Marker::Null),
            );
            self.set_super(self.null_class, self.object_class);
            let null = HeapObject::at(null_address);
            null.set_class(HeapObject::from_value(self.null_class));
            null.clear_flags();
            null.set_identity_hash(self.random.random());
            null.set_immutable(true);

            // Booleans.
            self.bool_class = self.init_class(InstanceFormat::instance(0));
            self.set_super(self.bool_class, self.object_class);

            let false_class = self.init_class(
                InstanceFormat::instance_with_marker(0, Marker::False),
            );
            self.set_super(false_class, self.bool_class);
            HeapObject::from_value(false_class).set_methods(self.empty_array);
            self.false_object =
                self.init_singleton_instance(false_address, false_class);

            let true_class = self.init_class(
                InstanceFormat::instance_with_marker(0, Marker::True),
            );
            self.set_super(true_class, self.bool_class);
            HeapObject::from_value(true_class).set_methods(self.empty_array);
            self.true_object =
                self.init_singleton_instance(true_address, true_class);

            self.stack_overflow_error_class =
                self.init_class(InstanceFormat::instance(0));
            self.set_super(self.stack_overflow_error_class, self.object_class);
            self.stack_overflow_error =
                must(self.create_instance(self.stack_overflow_error_class));

            self.raw_retry_after_gc =
                must(self.create_one_byte_string(b"Retry after GC."));
            self.raw_wrong_argument_type =
                must(self.create_one_byte_string(b"Wrong argument type."));
            self.raw_index_out_of_bounds =
                must(self.create_one_byte_string(b"Index out of bounds."));
            self.raw_illegal_state =
                must(self.create_one_byte_string(b"Illegal state."));

            self.dispatch_table = self.null_object;
            self.native_failure_result = self.null_object;
            self.entry = self.null_object;
        }
        self.verify_object_placements();
    }

    fn reserve(&mut self, size: usize) -> usize {
        match self.program_heap.allocate(size) {
            Some(address) => address,
            None => panic!("program-space allocation failed during initialize"),
        }
    }

    unsafe fn init_class(&mut self, format: InstanceFormat) -> Value {
        let class = HeapObject::at(self.reserve(CLASS_SIZE));
        class.set_class(HeapObject::from_value(self.meta_class));
        class.set_super_class(self.null_object);
        class.set_instance_format(format);
        class.set_methods(self.null_object);
        class.to_value()
    }

    unsafe fn set_super(&mut self, class: Value, super_class: Value) {
        HeapObject::from_value(class).set_super_class(super_class);
    }

    unsafe fn init_singleton_instance(
        &mut self,
        address: usize,
        class: Value,
    ) -> Value {
        let object = HeapObject::at(address);
        object.set_class(HeapObject::from_value(class));
        object.clear_flags();
        object.set_identity_hash(self.random.random());
        object.set_immutable(true);
        object.to_value()
    }

    /// The null/false/true adjacency the interpreter's boolean checks use.
    pub fn verify_object_placements(&self) {
        let n = self.null_object.address();
        let f = self.false_object.address();
        let t = self.true_object.address();
        assert!(f - n == 2 * WORD_SIZE, "false must follow null by 2 words");
        assert!(t - f == 2 * WORD_SIZE, "true must follow false by 2 words");
    }

    // ── Program-space constructors ─────────────────────────────────

    fn allocate_program(&mut self, size: usize) -> Result<usize, AllocationFailed> {
        self.program_heap.allocate(size).ok_or(AllocationFailed)
    }

    pub fn create_class(
        &mut self,
        fields: usize,
    ) -> Result<Value, AllocationFailed> {
        let address = self.allocate_program(CLASS_SIZE)?;
        unsafe {
            let class = HeapObject::at(address);
            class.set_class(HeapObject::from_value(self.meta_class));
            class.set_super_class(self.object_class);
            class.set_instance_format(InstanceFormat::instance(fields));
            class.set_methods(self.null_object);
            Ok(class.to_value())
        }
    }

    pub fn create_array(
        &mut self,
        length: usize,
        fill: Value,
    ) -> Result<Value, AllocationFailed> {
        let address = self.allocate_program(2 * WORD_SIZE + length * WORD_SIZE)?;
        unsafe {
            let array = HeapObject::at(address);
            array.set_class(HeapObject::from_value(self.array_class));
            array.set_length(length);
            for index in 0..length {
                array.set_element(index, fill);
            }
            Ok(array.to_value())
        }
    }

    pub fn create_byte_array(
        &mut self,
        bytes: &[u8],
    ) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(2 * WORD_SIZE + bytes.len());
        let address = self.allocate_program(size)?;
        unsafe {
            let array = HeapObject::at(address);
            array.set_class(HeapObject::from_value(self.byte_array_class));
            array.set_length(bytes.len());
            array.write_bytes(bytes);
            Ok(array.to_value())
        }
    }

    pub fn create_one_byte_string(
        &mut self,
        bytes: &[u8],
    ) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(2 * WORD_SIZE + bytes.len());
        let address = self.allocate_program(size)?;
        unsafe {
            let string = HeapObject::at(address);
            string
                .set_class(HeapObject::from_value(self.one_byte_string_class));
            string.set_length(bytes.len());
            string.write_bytes(bytes);
            Ok(string.to_value())
        }
    }

    pub fn create_two_byte_string(
        &mut self,
        units: &[u16],
    ) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(2 * WORD_SIZE + 2 * units.len());
        let address = self.allocate_program(size)?;
        unsafe {
            let string = HeapObject::at(address);
            string
                .set_class(HeapObject::from_value(self.two_byte_string_class));
            string.set_length(units.len());
            for (index, &unit) in units.iter().enumerate() {
                string.set_code_unit(index, unit);
            }
            Ok(string.to_value())
        }
    }

    pub fn create_double(&mut self, value: f64) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(WORD_SIZE + 8);
        let address = self.allocate_program(size)?;
        unsafe {
            let double = HeapObject::at(address);
            double.set_class(HeapObject::from_value(self.double_class));
            double.set_double_value(value);
            Ok(double.to_value())
        }
    }

    pub fn create_large_integer(
        &mut self,
        value: i64,
    ) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(WORD_SIZE + 8);
        let address = self.allocate_program(size)?;
        unsafe {
            let boxed = HeapObject::at(address);
            boxed.set_class(HeapObject::from_value(self.large_integer_class));
            boxed.set_large_integer_value(value);
            Ok(boxed.to_value())
        }
    }

    /// A smi when the value fits the native smi range, a boxed large
    /// integer otherwise.
    pub fn create_integer(&mut self, value: i64) -> Result<Value, AllocationFailed> {
        if Value::is_valid_smi(value) {
            Ok(Value::from_word(value as isize))
        } else {
            self.create_large_integer(value)
        }
    }

    pub fn create_function(
        &mut self,
        arity: usize,
        literals: &[Value],
        bytecodes: &[u8],
    ) -> Result<Value, AllocationFailed> {
        let size = round_up_to_word(
            FUNCTION_HEADER_SIZE
                + literals.len() * WORD_SIZE
                + bytecodes.len(),
        );
        let address = self.allocate_program(size)?;
        unsafe {
            let function = HeapObject::at(address);
            function.set_class(HeapObject::from_value(self.function_class));
            function.init_function(arity, literals.len(), bytecodes.len());
            for (index, &literal) in literals.iter().enumerate() {
                function.set_literal(index, literal);
            }
            function.write_bytecodes(bytecodes);
            Ok(function.to_value())
        }
    }

    pub fn create_instance(&mut self, class: Value) -> Result<Value, AllocationFailed> {
        let format = unsafe { HeapObject::from_value(class).instance_format() };
        debug_assert!(format.layout() == Layout::Instance);
        let address = self.allocate_program(format.fixed_size())?;
        unsafe {
            let instance = HeapObject::at(address);
            instance.set_class(HeapObject::from_value(class));
            instance.clear_flags();
            instance.set_identity_hash(self.random.random());
            instance.set_immutable(true);
            instance.initialize_fields(format.fixed_size(), self.null_object);
            Ok(instance.to_value())
        }
    }

    pub fn create_initializer(
        &mut self,
        function: Value,
    ) -> Result<Value, AllocationFailed> {
        let address = self.allocate_program(2 * WORD_SIZE)?;
        unsafe {
            let initializer = HeapObject::at(address);
            initializer
                .set_class(HeapObject::from_value(self.initializer_class));
            initializer.set_initializer_function(function);
            Ok(initializer.to_value())
        }
    }

    pub fn create_dispatch_table_entry(
        &mut self,
    ) -> Result<Value, AllocationFailed> {
        let address = self.allocate_program(4 * WORD_SIZE)?;
        unsafe {
            let entry = HeapObject::at(address);
            entry.set_class(
                HeapObject::from_value(self.dispatch_table_entry_class),
            );
            entry.set_entry_target(self.null_object);
            entry.set_entry_code(0);
            entry.set_entry_selector(Value::from_word(0));
            Ok(entry.to_value())
        }
    }

    /// Build and install a dispatch table whose entry `i` targets the
    /// given function under the given selector.
    pub fn create_dispatch_table(
        &mut self,
        entries: &[(usize, Value)],
    ) -> Result<Value, AllocationFailed> {
        let table = self.create_array(entries.len(), self.null_object)?;
        for (index, &(selector, target)) in entries.iter().enumerate() {
            let entry = self.create_dispatch_table_entry()?;
            unsafe {
                let entry_object = HeapObject::from_value(entry);
                entry_object.set_entry_target(target);
                entry_object
                    .set_entry_selector(Value::from_word(selector as isize));
                HeapObject::from_value(table).set_element(index, entry);
            }
        }
        self.dispatch_table = table;
        Ok(table)
    }

    // ── Process-heap constructors ──────────────────────────────────

    pub fn create_stack(&mut self, length: usize) -> Result<Value, AllocationFailed> {
        let size = STACK_HEADER_SIZE + length * WORD_SIZE;
        let address =
            self.process_heap.allocate(size).ok_or(AllocationFailed)?;
        unsafe {
            let stack = HeapObject::at(address);
            stack.set_class(HeapObject::from_value(self.stack_class));
            stack.set_length(length);
            stack.set_stack_top(length - 1);
            stack.set_stack_next(Value::ZERO);
            stack.set_stack_slot(length - 1, Value::from_word(0));
            Ok(stack.to_value())
        }
    }

    pub fn create_coroutine(&mut self, stack: Value) -> Result<Value, AllocationFailed> {
        let format = unsafe {
            HeapObject::from_value(self.coroutine_class).instance_format()
        };
        let address = self
            .process_heap
            .allocate(format.fixed_size())
            .ok_or(AllocationFailed)?;
        unsafe {
            let coroutine = HeapObject::at(address);
            coroutine.set_class(HeapObject::from_value(self.coroutine_class));
            coroutine.clear_flags();
            coroutine.set_field(0, stack);
            coroutine.set_field(1, self.null_object);
            Ok(coroutine.to_value())
        }
    }

    // ── Process lifecycle ──────────────────────────────────────────

    pub fn spawn_process(&mut self, parent: *mut Process) -> Option<*mut Process> {
        let mut process = Box::new(Process::new(parent));
        match self.create_stack(INITIAL_STACK_LENGTH) {
            Ok(stack) => process.set_stack(stack),
            Err(AllocationFailed) => {
                // Retry after a GC; the half-built process is dropped.
                process.mark_allocation_failed();
                process.cleanup(Signal::Terminated);
                return None;
            }
        }

        // The counterpart of this is in schedule_process_for_deletion.
        if !parent.is_null() {
            unsafe { (*parent).process_triangle_count += 1 };
        }

        let raw = Box::into_raw(process);
        self.add_to_process_list(raw);
        Some(raw)
    }

    /// Spawn the main process with the entry function suspended at its
    /// first bytecode; `interpreter_entry` is the native code address the
    /// bottom frame returns to.
    pub fn process_spawn_for_main(
        &mut self,
        arguments: Vec<Vec<u8>>,
        interpreter_entry: usize,
    ) -> *mut Process {
        if self.flags.print_program_statistics {
            self.print_statistics();
        }
        self.verify_object_placements();

        let process = match self.spawn_process(core::ptr::null_mut()) {
            Some(process) => process,
            None => panic!("cannot allocate the main process"),
        };
        unsafe {
            (*process).set_arguments(arguments);
            let entry = HeapObject::from_value(self.entry);
            debug_assert!(entry.is_function());
            let bcp = entry.bytecode_address_for(0);
            let stack = HeapObject::from_value((*process).stack());
            push_initial_entry_frames(
                stack,
                entry.arity(),
                bcp,
                interpreter_entry,
                self.null_object,
            );
            (*process).update_stack_limit();
        }
        process
    }

    /// Walk up the process hierarchy draining triangle counts; returns
    /// true when the whole program is done. The main process's exit
    /// signal becomes the program's exit kind.
    pub fn schedule_process_for_deletion(
        &mut self,
        process: *mut Process,
        kind: Signal,
    ) -> bool {
        unsafe {
            debug_assert!(
                (*process).state() == ProcessState::WaitingForChildren
            );
            (*process).cleanup(kind);

            let mut current = process;
            while !current.is_null() {
                let parent = (*current).parent();
                (*current).process_triangle_count -= 1;
                debug_assert!((*current).process_triangle_count >= 0);
                if (*current).process_triangle_count > 0 {
                    return false;
                }
                if parent.is_null() {
                    self.exit_kind = (*current).links().exit_signal();
                }
                self.remove_from_process_list(current);
                drop(Box::from_raw(current));
                current = parent;
            }
        }
        true
    }

    fn add_to_process_list(&self, process: *mut Process) {
        self.process_list.lock().push(process);
    }

    fn remove_from_process_list(&self, process: *mut Process) {
        let mut list = self.process_list.lock();
        list.retain(|&p| p != process);
    }

    pub fn main_process(&self) -> Option<*mut Process> {
        self.process_list.lock().first().copied()
    }

    fn processes(&self) -> Vec<*mut Process> {
        self.process_list.lock().clone()
    }

    pub fn process_count(&self) -> usize {
        self.process_list.lock().len()
    }

    // ── Caches ─────────────────────────────────────────────────────

    pub fn ensure_cache(&mut self) -> &mut LookupCache {
        self.cache.get_or_insert_with(LookupCache::new)
    }

    pub fn clear_cache(&mut self) {
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
    }

    pub fn ensure_debug_info(&mut self) -> &mut DebugInfo {
        self.debug_info.get_or_insert_with(DebugInfo::new)
    }

    pub fn debug_info(&mut self) -> Option<&mut DebugInfo> {
        self.debug_info.as_mut()
    }

    // ── Dispatch table ─────────────────────────────────────────────

    /// Null out every entry's code word; they point at generated code the
    /// next program GC invalidates.
    pub fn clear_dispatch_table_intrinsics(&mut self) {
        let table = self.dispatch_table;
        if !table.is_heap_object() {
            return;
        }
        unsafe {
            let table = HeapObject::from_value(table);
            if !table.is_array() {
                return;
            }
            for index in 0..table.length() {
                let entry = HeapObject::from_value(table.element(index));
                entry.set_entry_code(0);
            }
        }
    }

    /// Recompute every entry's code word from the intrinsics table,
    /// falling back to the shared method entry.
    pub fn setup_dispatch_table_intrinsics(
        &mut self,
        intrinsics: &IntrinsicsTable,
        default_method_entry: usize,
    ) {
        let table = self.dispatch_table;
        if !table.is_heap_object() {
            return;
        }
        unsafe {
            let table = HeapObject::from_value(table);
            if !table.is_array() || table.length() == 0 {
                return;
            }
            let length = table.length();
            let mut hits = 0;
            let trampoline =
                HeapObject::from_value(table.element(0)).entry_target();

            for index in 0..length {
                let entry = HeapObject::from_value(table.element(index));
                if entry.entry_code() != 0 {
                    hits += 1;
                    continue;
                }
                let target = entry.entry_target();
                if target != trampoline {
                    hits += 1;
                }
                let code =
                    compute_intrinsic(HeapObject::from_value(target), intrinsics)
                        .unwrap_or(default_method_entry);
                entry.set_entry_code(code);
            }

            if self.flags.print_program_statistics {
                tracing::info!(
                    target: "program",
                    fill = hits as f64 * 100.0 / length as f64,
                    hits,
                    length,
                    "dispatch table fill"
                );
            }
        }
    }

    // ── Shared-heap root iteration ─────────────────────────────────

    /// Roots of the mutable process heap: every process's roots plus the
    /// stack chain head and the debugger's coroutines.
    pub fn iterate_shared_heap_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        for process in self.processes() {
            unsafe { (*process).iterate_roots(visitor) };
        }
        visitor.visit(&mut self.stack_chain as *mut Value);
        if let Some(debug_info) = &mut self.debug_info {
            debug_info.visit_pointers(visitor);
        }
    }

    /// Program roots in fixed order, then the entry function and the
    /// debugger's program pointers.
    pub fn iterate_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.null_object as *mut Value);
        visitor.visit(&mut self.false_object as *mut Value);
        visitor.visit(&mut self.true_object as *mut Value);
        visitor.visit(&mut self.empty_array as *mut Value);
        visitor.visit(&mut self.empty_string as *mut Value);
        visitor.visit(&mut self.meta_class as *mut Value);
        visitor.visit(&mut self.object_class as *mut Value);
        visitor.visit(&mut self.bool_class as *mut Value);
        visitor.visit(&mut self.null_class as *mut Value);
        visitor.visit(&mut self.array_class as *mut Value);
        visitor.visit(&mut self.byte_array_class as *mut Value);
        visitor.visit(&mut self.one_byte_string_class as *mut Value);
        visitor.visit(&mut self.two_byte_string_class as *mut Value);
        visitor.visit(&mut self.function_class as *mut Value);
        visitor.visit(&mut self.stack_class as *mut Value);
        visitor.visit(&mut self.coroutine_class as *mut Value);
        visitor.visit(&mut self.port_class as *mut Value);
        visitor.visit(&mut self.initializer_class as *mut Value);
        visitor.visit(&mut self.dispatch_table_entry_class as *mut Value);
        visitor.visit(&mut self.double_class as *mut Value);
        visitor.visit(&mut self.large_integer_class as *mut Value);
        visitor.visit(&mut self.num_class as *mut Value);
        visitor.visit(&mut self.int_class as *mut Value);
        visitor.visit(&mut self.smi_class as *mut Value);
        visitor.visit(&mut self.boxed_class as *mut Value);
        visitor.visit(&mut self.stack_overflow_error_class as *mut Value);
        visitor.visit(&mut self.stack_overflow_error as *mut Value);
        visitor.visit(&mut self.raw_retry_after_gc as *mut Value);
        visitor.visit(&mut self.raw_wrong_argument_type as *mut Value);
        visitor.visit(&mut self.raw_index_out_of_bounds as *mut Value);
        visitor.visit(&mut self.raw_illegal_state as *mut Value);
        visitor.visit(&mut self.dispatch_table as *mut Value);
        visitor.visit(&mut self.native_failure_result as *mut Value);
        visitor.visit(&mut self.entry as *mut Value);
        if let Some(debug_info) = &mut self.debug_info {
            debug_info.visit_program_pointers(visitor);
        }
    }

    // ── New-space GC ───────────────────────────────────────────────

    /// Scavenge the process heap's new-space, promoting second-time
    /// survivors, then collect old-space if the scavenge says so.
    pub fn collect_new_space(&mut self) {
        if self.process_heap.has_empty_new_space() {
            self.collect_old_space_if_needed(false);
            return;
        }

        let start = Instant::now();
        let (new_used_before, old_used_before) = (
            self.process_heap.new_space_ref().used(),
            self.process_heap.old_space_ref().used(),
        );

        self.process_heap.new_space().flush();

        unsafe {
            let from: *mut SemiSpace = self.process_heap.new_space();
            let old: *mut OldSpace = self.process_heap.old_space();
            let to: *mut SemiSpace = self.process_heap.unused_space();
            (*to).reset();

            let mut visitor = GenerationalScavengeVisitor::new(from, to, old);
            self.iterate_shared_heap_roots(&mut visitor);
            for slot in (*old).remembered_slots() {
                visitor.visit(slot as *mut Value);
            }
            visitor.complete_scavenge();

            process_weak_pointers_after_scavenge(from, to, old);
            for process in self.processes() {
                let ports = (*process).take_ports();
                (*process).set_ports(cleanup_ports_after_scavenge(from, ports));
            }
            (*old).prune_remembered_set(|address| unsafe {
                (*to).contains(address)
            });

            let from_used = (*from).used();
            let to_used = (*to).used();
            let trigger_old_space_gc = visitor.trigger_old_space_gc();
            self.process_heap.swap_semi_spaces();

            let old_growth = self
                .process_heap
                .old_space_ref()
                .used()
                .saturating_sub(old_used_before);
            let progress =
                (from_used - to_used).saturating_sub(old_growth);
            if progress > 0 {
                self.process_heap
                    .old_space()
                    .report_new_space_progress(progress);
            }

            if self.flags.print_heap_statistics {
                tracing::info!(
                    target: "gc",
                    elapsed_us = start.elapsed().as_micros() as u64,
                    new_before = new_used_before,
                    new_after = self.process_heap.new_space_ref().used(),
                    old_before = old_used_before,
                    old_after = self.process_heap.old_space_ref().used(),
                    "new-space GC"
                );
            }

            self.collect_old_space_if_needed(trigger_old_space_gc);
        }
        self.update_stack_limits();
    }

    fn collect_old_space_if_needed(&mut self, force: bool) {
        if force
            || self.process_heap.old_space_ref().needs_garbage_collection()
        {
            self.collect_old_space();
        }
    }

    // ── Old-space GC ───────────────────────────────────────────────

    pub fn collect_old_space(&mut self) {
        if self.flags.validate_heaps {
            self.validate_heaps();
        }

        let start = Instant::now();
        let used_before = self.process_heap.old_space_ref().used();

        self.perform_shared_garbage_collection();

        if self.flags.print_heap_statistics {
            tracing::info!(
                target: "gc",
                elapsed_us = start.elapsed().as_micros() as u64,
                used_before,
                used_after = self.process_heap.old_space_ref().used(),
                size = self.process_heap.old_space_ref().size(),
                "old-space GC"
            );
        }

        if self.flags.validate_heaps {
            self.validate_heaps();
        }
    }

    /// Mark from the shared-heap roots (through new-space as well, for
    /// liveness paths that cross it), then sweep or compact, alternating.
    fn perform_shared_garbage_collection(&mut self) {
        self.process_heap.new_space().flush();
        unsafe {
            let new_space: *mut SemiSpace = self.process_heap.new_space();
            let old_space: *mut OldSpace = self.process_heap.old_space();

            let mut marking_stack = MarkingStack::new();
            let mut marking_visitor = MarkingVisitor::new(
                new_space,
                old_space,
                &mut marking_stack,
            );
            self.iterate_shared_heap_roots(&mut marking_visitor);
            process_marking_stack(&mut marking_stack, &mut marking_visitor);

            if (*old_space).compacting() {
                // The previous cycle compacted, so there is no
                // fragmentation and it is fair to judge progress.
                (*old_space).evaluate_pointlessness(
                    self.flags.old_space_high_watermark,
                    self.flags.old_space_low_watermark,
                    self.flags.old_space_grow_factor,
                );
                (*old_space).clear_hard_limit_hit();
                self.sweep_shared_heap();
            } else {
                (*old_space).clear_hard_limit_hit();
                self.compact_shared_heap();
            }
        }
        self.process_heap.adjust_old_allocation_budget();
    }

    fn sweep_shared_heap(&mut self) {
        unsafe {
            let new_space: *mut SemiSpace = self.process_heap.new_space();
            let old_space: *mut OldSpace = self.process_heap.old_space();

            (*old_space).set_compacting(false);
            (*old_space).process_weak_pointers();
            for process in self.processes() {
                let ports = (*process).take_ports();
                (*process).set_ports(cleanup_ports_after_mark(
                    old_space, new_space, ports,
                ));
            }

            (*old_space).sweep();

            // Mark bits were only needed for the mark phase.
            (*new_space).clear_mark_bits();
            (*old_space).clear_mark_bits();

            self.rebuild_remembered_set();
        }
        self.update_stack_limits();
    }

    fn compact_shared_heap(&mut self) {
        unsafe {
            let new_space: *mut SemiSpace = self.process_heap.new_space();
            let old_space: *mut OldSpace = self.process_heap.old_space();

            (*old_space).set_compacting(true);
            (*old_space).compute_compaction_destinations();

            // Weak processing needs the liveness data, so it runs before
            // anything moves.
            (*old_space).process_weak_pointers();
            for process in self.processes() {
                let ports = (*process).take_ports();
                (*process).set_ports(cleanup_ports_after_mark(
                    old_space, new_space, ports,
                ));
            }

            let mut fix = FixPointersVisitor::new(old_space);
            (*old_space).perform_compaction(&mut fix);

            let mut new_space_fix = HeapObjectPointerVisitor::new(&mut fix);
            (*new_space).iterate_objects(&mut new_space_fix);

            self.iterate_shared_heap_roots(&mut fix);

            (*new_space).clear_mark_bits();
            (*old_space).clear_mark_bits();
            (*old_space).finish_compaction();

            self.rebuild_remembered_set();
        }
        self.update_stack_limits();
    }

    /// Old-space GCs free or move the slots the remembered set points at;
    /// rebuild it from the surviving objects.
    unsafe fn rebuild_remembered_set(&mut self) {
        struct Recorder {
            new_space: *const SemiSpace,
            slots: Vec<usize>,
        }
        impl PointerVisitor for Recorder {
            unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
                let mut slot = start;
                while slot < end {
                    let value = *slot;
                    if value.is_heap_object()
                        && (*self.new_space).contains(value.address())
                    {
                        self.slots.push(slot as usize);
                    }
                    slot = slot.add(1);
                }
            }
        }

        let mut recorder = Recorder {
            new_space: self.process_heap.new_space_ref(),
            slots: Vec::new(),
        };
        {
            let mut object_pass = HeapObjectPointerVisitor::new(&mut recorder);
            self.process_heap.old_space_ref().iterate_objects(&mut object_pass);
        }
        let old_space = self.process_heap.old_space();
        old_space.clear_remembered_set();
        for slot in recorder.slots {
            old_space.record_write(slot);
        }
    }

    fn update_stack_limits(&mut self) {
        for process in self.processes() {
            unsafe { (*process).update_stack_limit() };
        }
    }

    // ── Program GC ─────────────────────────────────────────────────

    /// Collect the program heap. This is the only operation that moves
    /// program objects, so everything keyed on program addresses (the
    /// lookup cache, dispatch-table code words, bytecode pointers in
    /// frames, breakpoint keys) is invalidated, carried across, and
    /// rebuilt around the move. The caller re-installs dispatch-table
    /// intrinsics afterwards.
    pub fn collect_garbage(&mut self) {
        self.clear_dispatch_table_intrinsics();
        self.clear_cache();

        let mut to =
            SemiSpace::new((self.program_heap.used() / 10).max(WORD_SIZE));
        self.prepare_program_gc();
        unsafe {
            let from: *mut SemiSpace = &mut self.program_heap;
            let to_ptr: *mut SemiSpace = &mut to;
            let _scope = NoAllocationFailureScope::new(to_ptr);
            let mut scavenger = ScavengeVisitor::new(from, to_ptr);
            self.perform_program_gc(&mut scavenger);
        }
        core::mem::swap(&mut self.program_heap, &mut to);
        drop(to);
        self.finish_program_gc();
    }

    /// The snapshot layout variant: re-box oversized smis for 32-bit
    /// portability, collect, then reshape. Copy order: doubles, the
    /// double class as their anchor, the null/false/true triple, the
    /// most popular objects, then everything else.
    pub fn snapshot_gc(&mut self, popularity_counter: &mut PopularityCounter) {
        #[cfg(target_pointer_width = "64")]
        self.rebox_oversized_smis();

        self.collect_garbage();

        self.clear_dispatch_table_intrinsics();
        self.clear_cache();

        let mut to =
            SemiSpace::new((self.program_heap.used() / 10).max(WORD_SIZE));
        self.prepare_program_gc();
        unsafe {
            let from: *mut SemiSpace = &mut self.program_heap;
            let to_ptr: *mut SemiSpace = &mut to;
            let _scope = NoAllocationFailureScope::new(to_ptr);
            let mut scavenger = ScavengeVisitor::new(from, to_ptr);

            // Boxed doubles go first; the popularity counter watches every
            // pointer while we sweep. Counting precedes the move: copying
            // installs a forwarding word over the class.
            walk_space_objects(from, |object, _| unsafe {
                object.iterate_pointers(popularity_counter);
                if object.is_double() {
                    let mut local = object.to_value();
                    scavenger.visit(&mut local as *mut Value);
                }
            });
            popularity_counter.find_most_popular();

            // The first object after the doubles is their class, the
            // deserializer's anchor; then the canonical triple.
            scavenger.visit(&mut self.double_class as *mut Value);
            scavenger.visit(&mut self.null_object as *mut Value);
            scavenger.visit(&mut self.false_object as *mut Value);
            scavenger.visit(&mut self.true_object as *mut Value);

            popularity_counter.visit_most_popular(&mut scavenger);

            self.perform_program_gc(&mut scavenger);
        }
        core::mem::swap(&mut self.program_heap, &mut to);
        drop(to);
        self.finish_program_gc();
    }

    /// Box every immediate integer that a 32-bit target could not
    /// represent as a smi. Only meaningful on 64-bit builds.
    #[cfg(target_pointer_width = "64")]
    fn rebox_oversized_smis(&mut self) {
        struct BigSmiFixer {
            to: *mut SemiSpace,
            large_integer_class: Value,
        }
        impl PointerVisitor for BigSmiFixer {
            unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
                let mut slot = start;
                while slot < end {
                    let value = *slot;
                    if value.is_smi() {
                        let n = value.to_word() as i64;
                        if !Value::is_valid_portable_smi(n) {
                            let address = (*self.to)
                                .allocate(round_up_to_word(WORD_SIZE + 8))
                                .unwrap_or_else(|| {
                                    panic!("re-boxing outside a no-allocation-failure scope")
                                });
                            let boxed = HeapObject::at(address);
                            boxed.set_class(HeapObject::from_value(
                                self.large_integer_class,
                            ));
                            boxed.set_large_integer_value(n);
                            *slot = boxed.to_value();
                        }
                    }
                    slot = slot.add(1);
                }
            }
        }

        self.program_heap.flush();
        unsafe {
            let space: *mut SemiSpace = &mut self.program_heap;
            let _scope = NoAllocationFailureScope::new(space);
            let mut fixer = BigSmiFixer {
                to: space,
                large_integer_class: self.large_integer_class,
            };
            walk_space_objects(space, |object, _| unsafe {
                object.iterate_everything(&mut fixer);
            });
        }
    }

    /// Get the mutable heap into a state where program pointers can be
    /// enumerated precisely: two GCs to drop floating garbage, a marking
    /// pass that chains every live stack, then cook the chained stacks.
    fn prepare_program_gc(&mut self) {
        if self.flags.validate_heaps {
            self.validate_heaps();
        }

        // An old-space GC is precise for global reachability...
        self.perform_shared_garbage_collection();
        // ...which makes the following scavenge precise as well: no
        // old-to-new floating garbage remains.
        self.collect_new_space();
        // One more old-space cycle, this time chaining up all live stacks
        // (it compacts, so the stacks do not move afterwards).
        let number_of_stacks = self.collect_mutable_garbage_and_chain_stacks();
        self.cook_stacks(number_of_stacks);
    }

    fn perform_program_gc(&mut self, scavenger: &mut ScavengeVisitor) {
        // Program roots in fixed order.
        self.iterate_roots(scavenger);

        // Program-space pointers held by the processes.
        for process in self.processes() {
            unsafe { (*process).iterate_program_pointers(scavenger) };
        }

        // Every pointer stored in process-heap objects. The stacks are
        // cooked, so their frames expose proper function references.
        self.process_heap.new_space().flush();
        {
            let mut pass = HeapObjectPointerVisitor::new(scavenger);
            self.process_heap.new_space_ref().iterate_objects(&mut pass);
            self.process_heap.old_space_ref().iterate_objects(&mut pass);
        }

        scavenger.complete_scavenge();
    }

    fn finish_program_gc(&mut self) {
        self.uncook_and_unchain_stacks();

        if let Some(debug_info) = &mut self.debug_info {
            unsafe { debug_info.update_breakpoints() };
        }

        self.verify_object_placements();

        if self.flags.validate_heaps {
            self.validate_heaps();
        }
    }

    /// Mark from the shared-heap roots with stack chaining on, compact,
    /// and report how many stacks were chained.
    fn collect_mutable_garbage_and_chain_stacks(&mut self) -> usize {
        debug_assert!(self.stack_chain == Value::ZERO);
        self.process_heap.new_space().flush();
        let number_of_stacks;
        unsafe {
            let new_space: *mut SemiSpace = self.process_heap.new_space();
            let old_space: *mut OldSpace = self.process_heap.old_space();

            let mut marking_stack = MarkingStack::new();
            let mut marking_visitor = MarkingVisitor::with_stack_chain(
                new_space,
                old_space,
                &mut marking_stack,
                &mut self.stack_chain,
            );
            self.iterate_shared_heap_roots(&mut marking_visitor);
            process_marking_stack(&mut marking_stack, &mut marking_visitor);
            number_of_stacks = marking_visitor.number_of_stacks();

            self.compact_shared_heap();
        }
        self.update_stack_limits();
        number_of_stacks
    }

    /// Replace each frame's bytecode pointer with its function pointer,
    /// keeping the offsets out-of-band, so the functions can move.
    fn cook_stacks(&mut self, number_of_stacks: usize) {
        self.program_heap.flush();
        self.cooked_stack_deltas = Vec::with_capacity(number_of_stacks);
        unsafe {
            let mut raw_current = self.stack_chain;
            for _ in 0..number_of_stacks {
                let stack = HeapObject::from_value(raw_current);
                let mut deltas = Vec::new();
                let mut frame = Frame::new(stack);
                while frame.move_previous() {
                    let function = match frame
                        .function_from_byte_code_pointer(&self.program_heap)
                    {
                        Some(function) => function,
                        // The native entry frame has no function.
                        None => continue,
                    };
                    let delta = frame.byte_code_pointer().raw()
                        - function.bytecode_address_for(0);
                    deltas.push(delta);
                    frame.set_byte_code_pointer(function.to_value());
                }
                self.cooked_stack_deltas.push(deltas);
                raw_current = stack.stack_next();
            }
            debug_assert!(raw_current == Value::ZERO);
        }
    }

    /// Reverse of `cook_stacks`, with the functions at their new homes.
    fn uncook_and_unchain_stacks(&mut self) {
        unsafe {
            let mut raw_current = self.stack_chain;
            for deltas in &self.cooked_stack_deltas {
                let stack = HeapObject::from_value(raw_current);
                let mut index = 0;
                let mut frame = Frame::new(stack);
                while frame.move_previous() {
                    let value = frame.byte_code_pointer();
                    // Cooked frames hold function references; the native
                    // entry frame kept its raw code address.
                    if !value.is_heap_object() {
                        continue;
                    }
                    let function = HeapObject::from_value(value);
                    let delta = deltas[index];
                    index += 1;
                    frame.set_byte_code_pointer(Value::from_raw(
                        function.bytecode_address_for(0) + delta,
                    ));
                }
                debug_assert!(index == deltas.len());
                raw_current = stack.stack_next();
                stack.set_stack_next(Value::from_word(0));
            }
            debug_assert!(raw_current == Value::ZERO);
        }
        self.cooked_stack_deltas.clear();
        self.stack_chain = Value::ZERO;
    }

    // ── Statistics and validation ──────────────────────────────────

    pub fn print_statistics(&mut self) {
        #[derive(Default)]
        struct Statistics {
            objects: usize,
            classes: usize,
            arrays: usize,
            array_bytes: usize,
            strings: usize,
            string_bytes: usize,
            functions: usize,
            function_bytes: usize,
            bytecode_bytes: usize,
        }
        struct StatisticsVisitor(Statistics);
        impl HeapObjectVisitor for StatisticsVisitor {
            fn visit(&mut self, object: HeapObject) -> usize {
                unsafe {
                    let size = object.size();
                    self.0.objects += 1;
                    match object.layout() {
                        Layout::Class => self.0.classes += 1,
                        Layout::Array => {
                            self.0.arrays += 1;
                            self.0.array_bytes += size;
                        }
                        Layout::OneByteString | Layout::TwoByteString => {
                            self.0.strings += 1;
                            self.0.string_bytes += size;
                        }
                        Layout::Function => {
                            self.0.functions += 1;
                            self.0.function_bytes += size;
                            self.0.bytecode_bytes += object.bytecode_size();
                        }
                        _ => {}
                    }
                    size
                }
            }
        }

        self.program_heap.flush();
        let mut visitor = StatisticsVisitor(Statistics::default());
        self.program_heap.iterate_objects(&mut visitor);
        let stats = visitor.0;
        tracing::info!(
            target: "program",
            size = self.program_heap.used(),
            objects = stats.objects,
            classes = stats.classes,
            arrays = stats.arrays,
            array_bytes = stats.array_bytes,
            strings = stats.strings,
            string_bytes = stats.string_bytes,
            functions = stats.functions,
            function_bytes = stats.function_bytes,
            bytecode_bytes = stats.bytecode_bytes,
            "program statistics"
        );
    }

    /// Consistency checks: class pointers must point at classes in
    /// program space; every reference must land in a known space;
    /// program-space objects must not reference the mutable heap.
    pub fn validate_heaps(&mut self) {
        struct ValidatePointers {
            program: *const SemiSpace,
            new_space: *const SemiSpace,
            old_space: *const OldSpace,
            allow_process_heap: bool,
        }
        impl PointerVisitor for ValidatePointers {
            unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
                let mut slot = start;
                while slot < end {
                    let value = *slot;
                    if value.is_heap_object() {
                        let address = value.address();
                        let in_program = (*self.program).contains(address);
                        let in_process = (*self.new_space).contains(address)
                            || (*self.old_space).contains(address);
                        if !in_program && !in_process {
                            panic!(
                                "heap validation: pointer {address:#x} is out of bounds"
                            );
                        }
                        if in_process && !self.allow_process_heap {
                            panic!(
                                "heap validation: program object references the process heap at {address:#x}"
                            );
                        }
                    }
                    slot = slot.add(1);
                }
            }
        }

        struct ValidateObjects {
            pointers: ValidatePointers,
            program: *const SemiSpace,
        }
        impl HeapObjectVisitor for ValidateObjects {
            fn visit(&mut self, object: HeapObject) -> usize {
                unsafe {
                    let class_word = object.read_word(0);
                    if !class_word.is_heap_object()
                        || !(*self.program).contains(class_word.address())
                        || !HeapObject::from_value(class_word).is_class()
                    {
                        panic!(
                            "heap validation: bad class word in object {:#x}",
                            object.address()
                        );
                    }
                    object.iterate_pointers(&mut self.pointers);
                    object.size()
                }
            }
        }

        self.program_heap.flush();
        self.process_heap.new_space().flush();

        let program: *const SemiSpace = &self.program_heap;
        let new_space: *const SemiSpace = self.process_heap.new_space_ref();
        let old_space: *const OldSpace = self.process_heap.old_space_ref();

        let mut program_pass = ValidateObjects {
            pointers: ValidatePointers {
                program,
                new_space,
                old_space,
                allow_process_heap: false,
            },
            program,
        };
        self.program_heap.iterate_objects(&mut program_pass);
        self.iterate_roots(&mut program_pass.pointers);

        let mut process_pass = ValidateObjects {
            pointers: ValidatePointers {
                program,
                new_space,
                old_space,
                allow_process_heap: true,
            },
            program,
        };
        self.process_heap.new_space_ref().iterate_objects(&mut process_pass);
        self.process_heap.old_space_ref().iterate_objects(&mut process_pass);
        self.iterate_shared_heap_roots(&mut process_pass.pointers);
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        let processes = core::mem::take(&mut *self.process_list.lock());
        debug_assert!(processes.is_empty(), "processes outlived the program");
        for process in processes {
            unsafe { drop(Box::from_raw(process)) };
        }
    }
}

fn must<T>(result: Result<T, AllocationFailed>) -> T {
    match result {
        Ok(value) => value,
        Err(AllocationFailed) => {
            panic!("allocation failed inside a no-allocation-failure scope")
        }
    }
}

/// Walk a space's objects through raw pointers so the callback may grow
/// the same space (re-boxing) or write forwarding words into it (the
/// snapshot double sweep). Sizes are read before the callback runs.
///
/// # Safety
///
/// `space` must be flushed and outlive the walk.
unsafe fn walk_space_objects(
    space: *mut SemiSpace,
    mut callback: impl FnMut(HeapObject, usize),
) {
    let mut chunk = 0;
    let mut address = (*space).chunk_start(0);
    loop {
        let limit = (*space).scan_limit(chunk);
        if address >= limit {
            if chunk == (*space).current_chunk() {
                break;
            }
            chunk += 1;
            address = (*space).chunk_start(chunk);
            continue;
        }
        if let Some(bytes) = heap::filler_size(address) {
            address += bytes;
            continue;
        }
        let object = HeapObject::at(address);
        let size = object.size();
        callback(object, size);
        address += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::debug_info::NO_BREAKPOINT_ID;
    use crate::port::Port;

    const INTERPRETER_ENTRY: usize = 0xE000;

    fn test_flags() -> Flags {
        Flags {
            validate_heaps: true,
            semi_space_size: 32 * 1024,
            old_space_chunk_size: 32 * 1024,
            old_space_budget: 128 * 1024,
            program_space_size: 32 * 1024,
            ..Flags::default()
        }
    }

    fn test_program() -> Program {
        let mut program = Program::new(test_flags());
        program.initialize();
        program
    }

    fn make_entry_function(program: &mut Program) -> Value {
        let bytecodes = [Opcode::LoadLocal as u8; 16];
        let entry = program
            .create_function(0, &[], &bytecodes)
            .expect("program heap full during test setup");
        program.set_entry(entry);
        entry
    }

    fn finish_process(program: &mut Program, process: *mut Process) {
        unsafe { (*process).set_state(ProcessState::WaitingForChildren) };
        assert!(program.schedule_process_for_deletion(process, Signal::Terminated));
    }

    // ── Initialization invariants ──────────────────────────────────

    #[test]
    fn boolean_singletons_are_word_adjacent() {
        let program = test_program();
        let null = program.null_object().address();
        let false_address = program.false_object().address();
        let true_address = program.true_object().address();
        assert_eq!(false_address - null, 2 * WORD_SIZE);
        assert_eq!(true_address - false_address, 2 * WORD_SIZE);
    }

    #[test]
    fn null_class_chain_and_immutability() {
        let program = test_program();
        unsafe {
            let null = HeapObject::from_value(program.null_object());
            assert!(null.is_null());
            assert!(null.is_immutable());
            let null_class = null.class();
            assert_eq!(null_class.super_class(), program.object_class());
            // The meta-class is its own class.
            let meta = HeapObject::from_value(program.meta_class());
            assert_eq!(meta.class(), meta);
        }
    }

    #[test]
    fn every_class_root_is_a_program_space_class() {
        let mut program = test_program();
        struct Check {
            program_space: *const SemiSpace,
        }
        impl PointerVisitor for Check {
            unsafe fn visit_block(&mut self, start: *mut Value, end: *mut Value) {
                let mut slot = start;
                while slot < end {
                    let value = *slot;
                    if value.is_heap_object() {
                        assert!((*self.program_space)
                            .contains(value.address()));
                    }
                    slot = slot.add(1);
                }
            }
        }
        let mut check = Check { program_space: program.program_space() };
        program.iterate_roots(&mut check);
    }

    // ── Process lifecycle and exit codes ───────────────────────────

    #[test]
    fn exit_code_tracks_main_process_signal() {
        let mut program = test_program();
        make_entry_function(&mut program);
        let process =
            program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);
        assert_eq!(program.process_count(), 1);
        assert_eq!(program.main_process(), Some(process));

        unsafe { (*process).set_state(ProcessState::WaitingForChildren) };
        let done = program
            .schedule_process_for_deletion(process, Signal::UncaughtException);
        assert!(done);
        assert_eq!(program.process_count(), 0);
        assert_eq!(program.exit_code(), UNCAUGHT_EXCEPTION_EXIT_CODE);
    }

    #[test]
    fn child_processes_keep_the_program_alive() {
        let mut program = test_program();
        make_entry_function(&mut program);
        let main =
            program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);
        let child = program.spawn_process(main).expect("spawn child");

        unsafe { (*main).set_state(ProcessState::WaitingForChildren) };
        assert!(!program.schedule_process_for_deletion(main, Signal::Terminated));
        // The child still holds the main process in the list.
        assert_eq!(program.process_count(), 2);

        unsafe { (*child).set_state(ProcessState::WaitingForChildren) };
        assert!(program.schedule_process_for_deletion(child, Signal::Terminated));
        assert_eq!(program.process_count(), 0);
        assert_eq!(program.exit_code(), 0);
    }

    // ── Breakpoints ────────────────────────────────────────────────

    #[test]
    fn one_shot_breakpoint_fires_once() {
        let mut program = test_program();
        let entry = HeapObject::from_value(make_entry_function(&mut program));
        let debug_info = program.ensure_debug_info();
        unsafe {
            let id = debug_info.set_breakpoint(entry, 7, true, None, 0);
            // Setting again at the same key coalesces.
            assert_eq!(
                debug_info.set_breakpoint(entry, 7, true, None, 0),
                id
            );

            let bcp = entry.bytecode_address_for(0) + 7;
            assert!(debug_info.should_break(bcp, 0));
            assert!(debug_info.is_at_breakpoint());
            assert_eq!(debug_info.current_breakpoint_id(), id);

            // The one-shot deleted itself.
            debug_info.clear_current_breakpoint();
            assert!(!debug_info.should_break(bcp, 0));
            assert_eq!(debug_info.breakpoint_count(), 0);
        }
    }

    #[test]
    fn step_over_breakpoint_requires_matching_height() {
        let mut program = test_program();
        let entry = HeapObject::from_value(make_entry_function(&mut program));
        let stack_value = program.create_stack(64).expect("stack");
        let coroutine =
            program.create_coroutine(stack_value).expect("coroutine");
        let debug_info = program.ensure_debug_info();
        unsafe {
            let stack = HeapObject::from_value(stack_value);
            debug_info.set_breakpoint(entry, 3, false, Some(coroutine), 3);
            let bcp = entry.bytecode_address_for(0) + 3;

            let expected_sp = stack.stack_slot_address(stack.length() - 3);
            assert!(debug_info.should_break(bcp, expected_sp));
            // A deeper stack pointer means a nested call: no break.
            assert!(!debug_info.should_break(bcp, expected_sp - WORD_SIZE));
            // The non-one-shot breakpoint is still installed.
            assert_eq!(debug_info.breakpoint_count(), 1);
        }
    }

    #[test]
    fn stepping_breaks_anywhere() {
        let mut program = test_program();
        let debug_info = program.ensure_debug_info();
        unsafe {
            assert!(!debug_info.should_break(0x7770, 0));
            debug_info.set_stepping();
            assert!(debug_info.should_break(0x7770, 0));
            assert_eq!(debug_info.current_breakpoint_id(), NO_BREAKPOINT_ID);
            debug_info.clear_stepping();
            debug_info.clear_current_breakpoint();
            assert!(!debug_info.should_break(0x7770, 0));
        }
    }

    // ── Program GC ─────────────────────────────────────────────────

    #[test]
    fn program_gc_preserves_frame_bytecode_offsets() {
        let mut program = test_program();
        // Padding that dies at the first program GC, forcing the entry
        // function to a different offset in the new space.
        for _ in 0..64 {
            program.create_array(16, program.null_object()).expect("array");
        }
        let entry = make_entry_function(&mut program);
        let process =
            program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);

        unsafe {
            let stack = HeapObject::from_value((*process).stack());
            let mut frame = Frame::new(stack);
            assert!(frame.move_previous());
            let base = HeapObject::from_value(entry).bytecode_address_for(0);
            frame.set_byte_code_pointer(Value::from_raw(base + 12));
        }

        program.collect_garbage();

        unsafe {
            let moved_entry = HeapObject::from_value(program.entry());
            assert_ne!(program.entry(), entry, "entry must have moved");
            let stack = HeapObject::from_value((*process).stack());
            let mut frame = Frame::new(stack);
            assert!(frame.move_previous());
            assert_eq!(
                frame.byte_code_pointer().raw(),
                moved_entry.bytecode_address_for(0) + 12
            );
            // The bottom frame kept its native entry address.
            assert!(frame.move_previous());
            assert_eq!(frame.byte_code_pointer().raw(), INTERPRETER_ENTRY);
        }

        finish_process(&mut program, process);
    }

    #[test]
    fn program_gc_rekeys_breakpoints() {
        let mut program = test_program();
        let entry = HeapObject::from_value(make_entry_function(&mut program));
        unsafe {
            program.ensure_debug_info().set_breakpoint(entry, 5, false, None, 0);
        }

        program.collect_garbage();

        let moved_entry = program.entry();
        let debug_info = program.debug_info().expect("debug info");
        let keys = debug_info.breakpoint_keys();
        assert_eq!(keys.len(), 1);
        let (key, function, index) = keys[0];
        assert_eq!(function, moved_entry);
        assert_eq!(index, 5);
        unsafe {
            let expected =
                HeapObject::from_value(moved_entry).bytecode_address_for(0) + 5;
            assert_eq!(key, expected);
            assert!(debug_info.should_break(expected, 0));
        }
    }

    #[test]
    fn collect_garbage_is_idempotent_on_heap_sizes() {
        let mut program = test_program();
        make_entry_function(&mut program);
        let process =
            program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);

        program.collect_garbage();
        let program_used = program.program_space().used();
        let old_used = program.process_heap().old_space_ref().used();

        program.collect_garbage();
        assert_eq!(program.program_space().used(), program_used);
        assert_eq!(program.process_heap().old_space_ref().used(), old_used);

        finish_process(&mut program, process);
    }

    #[test]
    fn lookup_cache_is_cleared_by_program_gc() {
        let mut program = test_program();
        make_entry_function(&mut program);
        let class = program.array_class();
        let target = program.entry();
        program.ensure_cache().insert(class, 3, target);
        assert_eq!(program.ensure_cache().lookup(class, 3), Some(target));

        program.collect_garbage();
        assert_eq!(program.ensure_cache().lookup(class, 3), None);
    }

    // ── Dispatch table ─────────────────────────────────────────────

    #[test]
    fn dispatch_table_intrinsics_round_trip() {
        let mut program = test_program();
        let trampoline = make_entry_function(&mut program);
        let getter = program
            .create_function(
                1,
                &[],
                &[Opcode::LoadField as u8, Opcode::Return as u8],
            )
            .expect("function");
        let table = program
            .create_dispatch_table(&[(0, trampoline), (1, getter)])
            .expect("dispatch table");

        let intrinsics =
            IntrinsicsTable { get_field: 0x2220, ..Default::default() };
        program.setup_dispatch_table_intrinsics(&intrinsics, 0x9990);
        unsafe {
            let table = HeapObject::from_value(table);
            let first = HeapObject::from_value(table.element(0));
            let second = HeapObject::from_value(table.element(1));
            // The trampoline entry has no intrinsic; it gets the shared
            // method entry. The getter starts with a load-field bytecode.
            assert_eq!(first.entry_code(), 0x9990);
            assert_eq!(second.entry_code(), 0x2220);
        }

        program.clear_dispatch_table_intrinsics();
        unsafe {
            let table = HeapObject::from_value(program.dispatch_table());
            assert_eq!(HeapObject::from_value(table.element(0)).entry_code(), 0);
            assert_eq!(HeapObject::from_value(table.element(1)).entry_code(), 0);
        }
    }

    // ── Ports ──────────────────────────────────────────────────────

    #[test]
    fn scavenge_drops_ports_with_dead_targets() {
        let mut program = test_program();
        make_entry_function(&mut program);
        let process =
            program.process_spawn_for_main(Vec::new(), INTERPRETER_ENTRY);

        unsafe {
            let stack = (*process).stack();
            let garbage = program.create_coroutine(stack).expect("coroutine");
            (*process).add_port(Port::new(1, garbage));
            (*process).add_port(Port::new(2, stack));

            program.collect_new_space();

            let ports = (*process).ports();
            assert_eq!(ports.len(), 1);
            assert_eq!(ports[0].id, 2);
            assert_eq!(ports[0].target, (*process).stack());
        }

        finish_process(&mut program, process);
    }

    // ── Snapshot reshaping ─────────────────────────────────────────

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn snapshot_gc_boxes_oversized_smis() {
        let mut program = test_program();
        let big = 1i64 << 40;
        assert!(Value::is_valid_smi(big));
        assert!(!Value::is_valid_portable_smi(big));
        let entry = program
            .create_function(
                0,
                &[Value::from_word(big as isize)],
                &[Opcode::Return as u8],
            )
            .expect("function");
        program.set_entry(entry);

        let mut popularity = PopularityCounter::new();
        program.snapshot_gc(&mut popularity);

        unsafe {
            let entry = HeapObject::from_value(program.entry());
            let literal = entry.literal(0);
            assert!(literal.is_heap_object());
            let boxed = HeapObject::from_value(literal);
            assert!(boxed.is_large_integer());
            assert_eq!(boxed.large_integer_value(), big);
            assert_eq!(
                boxed.class().to_value(),
                program.large_integer_class()
            );
        }
    }

    #[test]
    fn snapshot_gc_clusters_doubles_triple_and_popular_objects() {
        let mut program = test_program();

        let popular_class = program.create_class(0).expect("class");
        let single_class = program.create_class(0).expect("class");

        // 20 popular objects, each referenced by 10 single-slot arrays,
        // plus 300 singly-referenced ones, all hanging off the entry
        // function's literals.
        let mut literals = Vec::new();
        let mut popular = Vec::new();
        for _ in 0..20 {
            let object = program.create_instance(popular_class).expect("instance");
            popular.push(object);
            for _ in 0..10 {
                literals.push(program.create_array(1, object).expect("array"));
            }
        }
        for _ in 0..300 {
            let object = program.create_instance(single_class).expect("instance");
            literals.push(program.create_array(1, object).expect("array"));
        }
        literals.push(program.create_double(1.5).expect("double"));
        literals.push(program.create_double(2.5).expect("double"));

        let entry = program
            .create_function(0, &literals, &[Opcode::Return as u8])
            .expect("function");
        program.set_entry(entry);

        let mut popularity = PopularityCounter::new();
        program.snapshot_gc(&mut popularity);

        // Layout: doubles, then the double class as the deserializer's
        // anchor, then null/false/true, then the popular objects.
        let double_size = round_up_to_word(WORD_SIZE + 8);
        let double_class_offset =
            program.offset_of(HeapObject::from_value(program.double_class()));
        assert_eq!(double_class_offset, 2 * double_size);
        let null_offset =
            program.offset_of(HeapObject::from_value(program.null_object()));
        assert_eq!(null_offset, double_class_offset + CLASS_SIZE);
        program.verify_object_placements();

        // All popular objects sit inside the clustered prefix.
        let prefix_budget = 2 * double_size
            + CLASS_SIZE
            + 3 * 2 * WORD_SIZE
            + crate::snapshot::MOST_POPULAR_COUNT * CLASS_SIZE;
        unsafe {
            let entry = HeapObject::from_value(program.entry());
            for index in 0..20 * 10 {
                let array = HeapObject::from_value(entry.literal(index));
                let object = HeapObject::from_value(array.element(0));
                let offset = program.offset_of(object);
                assert!(
                    offset < prefix_budget,
                    "popular object at offset {offset}, budget {prefix_budget}"
                );
            }
        }
        assert!(program.program_space().used() > 4 * prefix_budget);
    }

}
