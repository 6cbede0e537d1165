use crate::format::{InstanceFormat, Layout, Marker};
use crate::value::{Value, WORD_SIZE};
use crate::visitor::PointerVisitor;

#[inline(always)]
pub const fn round_up_to_word(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

// Word offsets shared by all layouts.
const CLASS_OFFSET: usize = 0;

// Instance: [class][flags] fields...
const INSTANCE_FLAGS_OFFSET: usize = 1;
const INSTANCE_FIELDS_OFFSET: usize = 2;

// Class: [class][super][format][methods]
const CLASS_SUPER_OFFSET: usize = 1;
const CLASS_FORMAT_OFFSET: usize = 2;
const CLASS_METHODS_OFFSET: usize = 3;
pub const CLASS_SIZE: usize = 4 * WORD_SIZE;

// Array / byte array / strings: [class][length] payload...
const LENGTH_OFFSET: usize = 1;
const ARRAY_ELEMENTS_OFFSET: usize = 2;
const DATA_OFFSET: usize = 2 * WORD_SIZE;

// Function: [class][arity][literal count][bytecode size] literals... bytecode...
const FUNCTION_ARITY_OFFSET: usize = 1;
const FUNCTION_LITERAL_COUNT_OFFSET: usize = 2;
const FUNCTION_BYTECODE_SIZE_OFFSET: usize = 3;
const FUNCTION_LITERALS_OFFSET: usize = 4;

// Stack: [class][length][top][next] slots...
const STACK_TOP_OFFSET: usize = 2;
const STACK_NEXT_OFFSET: usize = 3;
const STACK_SLOTS_OFFSET: usize = 4;

// Dispatch table entry: [class][target][code][selector]
const ENTRY_TARGET_OFFSET: usize = 1;
const ENTRY_CODE_OFFSET: usize = 2;
const ENTRY_SELECTOR_OFFSET: usize = 3;

// Double / large integer: [class] + raw 8-byte payload.
const PAYLOAD_OFFSET: usize = WORD_SIZE;

// Initializer: [class][function]. Boxed: [class][value].
const SINGLE_FIELD_OFFSET: usize = 1;

// Instance flags word payload: bit 0 immutability, bits 1..33 identity hash.
const IMMUTABLE_BIT: isize = 1;
const HASH_SHIFT: u32 = 1;

/// An untagged pointer to a heap object. The first word of every heap object
/// is the tagged class pointer; everything else is derived from the class's
/// [`InstanceFormat`] plus, for variable layouts, a length word.
///
/// All accessors are unsafe: the address must point at a live, initialized
/// object of the layout the accessor assumes (`debug_assert`ed throughout).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeapObject(usize);

impl HeapObject {
    #[inline(always)]
    pub fn at(address: usize) -> Self {
        debug_assert!(address & (WORD_SIZE - 1) == 0);
        Self(address)
    }

    #[inline(always)]
    pub fn from_value(value: Value) -> Self {
        debug_assert!(value.is_heap_object());
        Self(value.address())
    }

    #[inline(always)]
    pub const fn address(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_value(self) -> Value {
        Value::from_address(self.0)
    }

    // ── Raw word access ────────────────────────────────────────────

    /// # Safety
    ///
    /// `index` must be a valid word offset inside this object.
    #[inline(always)]
    pub unsafe fn read_word(self, index: usize) -> Value {
        *(self.0 as *const Value).add(index)
    }

    /// # Safety
    ///
    /// `index` must be a valid word offset inside this object.
    #[inline(always)]
    pub unsafe fn write_word(self, index: usize, value: Value) {
        *(self.0 as *mut Value).add(index) = value;
    }

    #[inline(always)]
    pub fn slot_at(self, index: usize) -> *mut Value {
        (self.0 as *mut Value).wrapping_add(index)
    }

    // ── Class word and forwarding ──────────────────────────────────

    /// # Safety
    ///
    /// The object's class word must be initialized and not forwarded.
    #[inline(always)]
    pub unsafe fn class(self) -> HeapObject {
        let word = self.read_word(CLASS_OFFSET);
        debug_assert!(word.is_heap_object(), "bad class word at {:#x}", self.0);
        HeapObject::from_value(word)
    }

    /// # Safety
    ///
    /// The object must be addressable.
    #[inline(always)]
    pub unsafe fn set_class(self, class: HeapObject) {
        self.write_word(CLASS_OFFSET, class.to_value());
    }

    /// A copied object's class word holds the raw destination address, whose
    /// low two bits are `00` — distinguishable from a live class pointer
    /// (tag `01`).
    ///
    /// # Safety
    ///
    /// The first word must be initialized.
    #[inline(always)]
    pub unsafe fn has_forwarding_address(self) -> bool {
        !self.read_word(CLASS_OFFSET).is_heap_object()
    }

    /// # Safety
    ///
    /// [`Self::has_forwarding_address`] must be true.
    #[inline(always)]
    pub unsafe fn forwarding_address(self) -> usize {
        let word = self.read_word(CLASS_OFFSET);
        debug_assert!(!word.is_heap_object());
        word.raw()
    }

    /// # Safety
    ///
    /// The object must be in a from-space mid-collection; this destroys the
    /// class word.
    #[inline(always)]
    pub unsafe fn set_forwarding_address(self, address: usize) {
        debug_assert!(address & 0b11 == 0);
        self.write_word(CLASS_OFFSET, Value::from_raw(address));
    }

    /// # Safety
    ///
    /// The class word must be a class pointer or, mid-copy, the forwarding
    /// address of one; the class's format word must be valid.
    #[inline(always)]
    pub unsafe fn format(self) -> InstanceFormat {
        let word = self.read_word(CLASS_OFFSET);
        // During a program-space scavenge the class may already have been
        // copied; its first word then holds the raw destination address,
        // where the format word is intact.
        let class_addr =
            if word.is_heap_object() { word.address() } else { word.raw() };
        InstanceFormat::from_smi(
            HeapObject::at(class_addr).read_word(CLASS_FORMAT_OFFSET),
        )
    }

    // ── Size ───────────────────────────────────────────────────────

    /// Total size in bytes, derivable from the class word plus (for variable
    /// layouts) the length words.
    ///
    /// # Safety
    ///
    /// Class word and length words must be valid; other payload may be
    /// uninitialized.
    pub unsafe fn size(self) -> usize {
        let format = self.format();
        match format.layout() {
            Layout::Instance
            | Layout::Class
            | Layout::DispatchTableEntry
            | Layout::Initializer
            | Layout::Boxed => format.fixed_size(),
            Layout::Double | Layout::LargeInteger => {
                round_up_to_word(format.fixed_size())
            }
            Layout::Array | Layout::Stack => {
                format.fixed_size() + self.length() * WORD_SIZE
            }
            Layout::ByteArray | Layout::OneByteString => {
                round_up_to_word(format.fixed_size() + self.length())
            }
            Layout::TwoByteString => {
                round_up_to_word(format.fixed_size() + 2 * self.length())
            }
            Layout::Function => round_up_to_word(
                format.fixed_size()
                    + self.literal_count() * WORD_SIZE
                    + self.bytecode_size(),
            ),
        }
    }

    // ── Pointer iteration ──────────────────────────────────────────

    /// Visit every slot that can contain a heap pointer, exactly once.
    /// Includes the class word. Visitors see slots currently holding smis
    /// (fields, elements, literals can hold either) and filter by tag.
    ///
    /// # Safety
    ///
    /// The object must be fully initialized.
    pub unsafe fn iterate_pointers(self, visitor: &mut dyn PointerVisitor) {
        let format = self.format();
        visitor.visit(self.slot_at(CLASS_OFFSET));
        match format.layout() {
            Layout::Instance => {
                // The flags word is a structural smi (identity hash +
                // immutability); it is never a pointer.
                visitor.visit_block(
                    self.slot_at(INSTANCE_FIELDS_OFFSET),
                    self.slot_at(INSTANCE_FIELDS_OFFSET + format.field_count()),
                );
            }
            Layout::Class => {
                visitor.visit(self.slot_at(CLASS_SUPER_OFFSET));
                visitor.visit(self.slot_at(CLASS_METHODS_OFFSET));
            }
            Layout::Array => {
                visitor.visit_block(
                    self.slot_at(ARRAY_ELEMENTS_OFFSET),
                    self.slot_at(ARRAY_ELEMENTS_OFFSET + self.length()),
                );
            }
            Layout::Function => {
                visitor.visit_block(
                    self.slot_at(FUNCTION_LITERALS_OFFSET),
                    self.slot_at(FUNCTION_LITERALS_OFFSET + self.literal_count()),
                );
            }
            Layout::Stack => {
                visitor.visit(self.slot_at(STACK_NEXT_OFFSET));
                // Only the live slice; slots below the top are dead frames.
                visitor.visit_block(
                    self.slot_at(STACK_SLOTS_OFFSET + self.stack_top()),
                    self.slot_at(STACK_SLOTS_OFFSET + self.length()),
                );
            }
            Layout::DispatchTableEntry => {
                // The code word is a raw generated-code address and the
                // selector is always a smi.
                visitor.visit(self.slot_at(ENTRY_TARGET_OFFSET));
            }
            Layout::Initializer | Layout::Boxed => {
                visitor.visit(self.slot_at(SINGLE_FIELD_OFFSET));
            }
            Layout::ByteArray
            | Layout::OneByteString
            | Layout::TwoByteString
            | Layout::Double
            | Layout::LargeInteger => {}
        }
    }

    /// Visit every slot that can contain a user value, including slots
    /// currently holding immediates; the traversal the snapshot GC's
    /// integer re-boxing uses. Structural words (lengths, formats, the
    /// instance flags word, dispatch code words) are not user values and
    /// are skipped; the dispatch selector is visited in addition to the
    /// pointer slots.
    ///
    /// # Safety
    ///
    /// The object must be fully initialized.
    pub unsafe fn iterate_everything(self, visitor: &mut dyn PointerVisitor) {
        self.iterate_pointers(visitor);
        if self.format().layout() == Layout::DispatchTableEntry {
            visitor.visit(self.slot_at(ENTRY_SELECTOR_OFFSET));
        }
    }

    // ── Predicates ─────────────────────────────────────────────────

    /// # Safety
    ///
    /// Class word must be valid (for all predicates below).
    #[inline(always)]
    pub unsafe fn layout(self) -> Layout {
        self.format().layout()
    }

    pub unsafe fn is_instance(self) -> bool {
        self.layout() == Layout::Instance
    }

    pub unsafe fn is_class(self) -> bool {
        self.layout() == Layout::Class
    }

    pub unsafe fn is_array(self) -> bool {
        self.layout() == Layout::Array
    }

    pub unsafe fn is_byte_array(self) -> bool {
        self.layout() == Layout::ByteArray
    }

    pub unsafe fn is_string(self) -> bool {
        matches!(self.layout(), Layout::OneByteString | Layout::TwoByteString)
    }

    pub unsafe fn is_function(self) -> bool {
        self.layout() == Layout::Function
    }

    pub unsafe fn is_stack(self) -> bool {
        self.layout() == Layout::Stack
    }

    pub unsafe fn is_dispatch_table_entry(self) -> bool {
        self.layout() == Layout::DispatchTableEntry
    }

    pub unsafe fn is_double(self) -> bool {
        self.layout() == Layout::Double
    }

    pub unsafe fn is_large_integer(self) -> bool {
        self.layout() == Layout::LargeInteger
    }

    pub unsafe fn is_initializer(self) -> bool {
        self.layout() == Layout::Initializer
    }

    pub unsafe fn is_boxed(self) -> bool {
        self.layout() == Layout::Boxed
    }

    pub unsafe fn is_null(self) -> bool {
        self.format().marker() == Marker::Null
    }

    pub unsafe fn is_true(self) -> bool {
        self.format().marker() == Marker::True
    }

    pub unsafe fn is_false(self) -> bool {
        self.format().marker() == Marker::False
    }

    pub unsafe fn is_coroutine(self) -> bool {
        self.format().marker() == Marker::Coroutine
    }

    pub unsafe fn is_port(self) -> bool {
        self.format().marker() == Marker::Port
    }

    // ── Instance ───────────────────────────────────────────────────

    /// # Safety
    ///
    /// Must be an instance with `index < field_count`.
    #[inline(always)]
    pub unsafe fn field(self, index: usize) -> Value {
        debug_assert!(index < self.format().field_count());
        self.read_word(INSTANCE_FIELDS_OFFSET + index)
    }

    /// # Safety
    ///
    /// Must be an instance with `index < field_count`.
    #[inline(always)]
    pub unsafe fn set_field(self, index: usize, value: Value) {
        debug_assert!(index < self.format().field_count());
        self.write_word(INSTANCE_FIELDS_OFFSET + index, value);
    }

    /// Fill every field of a fresh instance.
    ///
    /// # Safety
    ///
    /// Must be an instance; `size` must be the instance's full size.
    pub unsafe fn initialize_fields(self, size: usize, filler: Value) {
        let mut offset = INSTANCE_FIELDS_OFFSET;
        while offset * WORD_SIZE < size {
            self.write_word(offset, filler);
            offset += 1;
        }
    }

    /// # Safety
    ///
    /// Must be an instance with an initialized flags word.
    #[inline(always)]
    pub unsafe fn identity_hash(self) -> u32 {
        (self.read_word(INSTANCE_FLAGS_OFFSET).to_word() >> HASH_SHIFT) as u32
    }

    /// # Safety
    ///
    /// Must be an instance with an initialized flags word.
    pub unsafe fn set_identity_hash(self, hash: u32) {
        let old = self.read_word(INSTANCE_FLAGS_OFFSET).to_word();
        let flags = ((hash as isize) << HASH_SHIFT) | (old & IMMUTABLE_BIT);
        self.write_word(INSTANCE_FLAGS_OFFSET, Value::from_word(flags));
    }

    /// # Safety
    ///
    /// Must be an instance with an initialized flags word.
    #[inline(always)]
    pub unsafe fn is_immutable(self) -> bool {
        self.read_word(INSTANCE_FLAGS_OFFSET).to_word() & IMMUTABLE_BIT != 0
    }

    /// # Safety
    ///
    /// Must be an instance with an initialized flags word.
    pub unsafe fn set_immutable(self, immutable: bool) {
        let old = self.read_word(INSTANCE_FLAGS_OFFSET).to_word();
        let flags =
            if immutable { old | IMMUTABLE_BIT } else { old & !IMMUTABLE_BIT };
        self.write_word(INSTANCE_FLAGS_OFFSET, Value::from_word(flags));
    }

    /// # Safety
    ///
    /// Must be a freshly allocated instance.
    pub unsafe fn clear_flags(self) {
        self.write_word(INSTANCE_FLAGS_OFFSET, Value::ZERO);
    }

    // ── Class ──────────────────────────────────────────────────────

    /// # Safety
    ///
    /// Must be a class.
    #[inline(always)]
    pub unsafe fn super_class(self) -> Value {
        debug_assert!(self.is_class());
        self.read_word(CLASS_SUPER_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a class.
    pub unsafe fn set_super_class(self, super_class: Value) {
        self.write_word(CLASS_SUPER_OFFSET, super_class);
    }

    /// # Safety
    ///
    /// Must be a class with an initialized format word.
    #[inline(always)]
    pub unsafe fn instance_format(self) -> InstanceFormat {
        debug_assert!(self.is_class());
        InstanceFormat::from_smi(self.read_word(CLASS_FORMAT_OFFSET))
    }

    /// # Safety
    ///
    /// Must be a (possibly fresh) class.
    pub unsafe fn set_instance_format(self, format: InstanceFormat) {
        self.write_word(CLASS_FORMAT_OFFSET, format.as_smi());
    }

    /// # Safety
    ///
    /// Must be a class.
    #[inline(always)]
    pub unsafe fn methods(self) -> Value {
        debug_assert!(self.is_class());
        self.read_word(CLASS_METHODS_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a class.
    pub unsafe fn set_methods(self, methods: Value) {
        self.write_word(CLASS_METHODS_OFFSET, methods);
    }

    // ── Variable-size length ───────────────────────────────────────

    /// Element count of arrays and stacks, byte/code-unit count of byte
    /// arrays and strings.
    ///
    /// # Safety
    ///
    /// Must be a variable-size object with an initialized length word.
    #[inline(always)]
    pub unsafe fn length(self) -> usize {
        self.read_word(LENGTH_OFFSET).to_word() as usize
    }

    /// # Safety
    ///
    /// Must be a freshly allocated variable-size object.
    pub unsafe fn set_length(self, length: usize) {
        self.write_word(LENGTH_OFFSET, Value::from_word(length as isize));
    }

    // ── Array ──────────────────────────────────────────────────────

    /// # Safety
    ///
    /// Must be an array with `index < length`.
    #[inline(always)]
    pub unsafe fn element(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.read_word(ARRAY_ELEMENTS_OFFSET + index)
    }

    /// # Safety
    ///
    /// Must be an array with `index < length`.
    #[inline(always)]
    pub unsafe fn set_element(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.write_word(ARRAY_ELEMENTS_OFFSET + index, value);
    }

    // ── Byte array / strings ───────────────────────────────────────

    /// # Safety
    ///
    /// Must be a byte array or one-byte string.
    #[inline(always)]
    pub unsafe fn bytes(self) -> &'static [u8] {
        let ptr = (self.0 + DATA_OFFSET) as *const u8;
        core::slice::from_raw_parts(ptr, self.length())
    }

    /// # Safety
    ///
    /// Must be a freshly allocated byte array or one-byte string with room
    /// for `data`.
    pub unsafe fn write_bytes(self, data: &[u8]) {
        debug_assert!(data.len() <= self.length());
        let ptr = (self.0 + DATA_OFFSET) as *mut u8;
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }

    /// # Safety
    ///
    /// Must be a two-byte string with `index < length`.
    #[inline(always)]
    pub unsafe fn code_unit(self, index: usize) -> u16 {
        debug_assert!(index < self.length());
        *((self.0 + DATA_OFFSET) as *const u16).add(index)
    }

    /// # Safety
    ///
    /// Must be a two-byte string with `index < length`.
    pub unsafe fn set_code_unit(self, index: usize, unit: u16) {
        debug_assert!(index < self.length());
        *((self.0 + DATA_OFFSET) as *mut u16).add(index) = unit;
    }

    // ── Function ───────────────────────────────────────────────────

    /// # Safety
    ///
    /// Must be a function.
    #[inline(always)]
    pub unsafe fn arity(self) -> usize {
        self.read_word(FUNCTION_ARITY_OFFSET).to_word() as usize
    }

    /// # Safety
    ///
    /// Must be a function.
    #[inline(always)]
    pub unsafe fn literal_count(self) -> usize {
        self.read_word(FUNCTION_LITERAL_COUNT_OFFSET).to_word() as usize
    }

    /// # Safety
    ///
    /// Must be a function.
    #[inline(always)]
    pub unsafe fn bytecode_size(self) -> usize {
        self.read_word(FUNCTION_BYTECODE_SIZE_OFFSET).to_word() as usize
    }

    /// # Safety
    ///
    /// Must be a freshly allocated function.
    pub unsafe fn init_function(
        self,
        arity: usize,
        literal_count: usize,
        bytecode_size: usize,
    ) {
        self.write_word(FUNCTION_ARITY_OFFSET, Value::from_word(arity as isize));
        self.write_word(
            FUNCTION_LITERAL_COUNT_OFFSET,
            Value::from_word(literal_count as isize),
        );
        self.write_word(
            FUNCTION_BYTECODE_SIZE_OFFSET,
            Value::from_word(bytecode_size as isize),
        );
    }

    /// # Safety
    ///
    /// Must be a function with `index < literal_count`.
    #[inline(always)]
    pub unsafe fn literal(self, index: usize) -> Value {
        debug_assert!(index < self.literal_count());
        self.read_word(FUNCTION_LITERALS_OFFSET + index)
    }

    /// # Safety
    ///
    /// Must be a function with `index < literal_count`.
    pub unsafe fn set_literal(self, index: usize, value: Value) {
        debug_assert!(index < self.literal_count());
        self.write_word(FUNCTION_LITERALS_OFFSET + index, value);
    }

    /// The stable-while-unmoved interior address of the bytecode at `offset`.
    ///
    /// # Safety
    ///
    /// Must be a function.
    #[inline(always)]
    pub unsafe fn bytecode_address_for(self, offset: usize) -> usize {
        debug_assert!(offset <= self.bytecode_size());
        self.0
            + FUNCTION_LITERALS_OFFSET * WORD_SIZE
            + self.literal_count() * WORD_SIZE
            + offset
    }

    /// # Safety
    ///
    /// Must be a function.
    pub unsafe fn contains_bytecode_address(self, address: usize) -> bool {
        let base = self.bytecode_address_for(0);
        base <= address && address < base + self.bytecode_size()
    }

    /// # Safety
    ///
    /// Must be a function.
    #[inline(always)]
    pub unsafe fn bytecodes(self) -> &'static [u8] {
        core::slice::from_raw_parts(
            self.bytecode_address_for(0) as *const u8,
            self.bytecode_size(),
        )
    }

    /// # Safety
    ///
    /// Must be a freshly allocated function sized for `bytes`.
    pub unsafe fn write_bytecodes(self, bytes: &[u8]) {
        debug_assert!(bytes.len() == self.bytecode_size());
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.bytecode_address_for(0) as *mut u8,
            bytes.len(),
        );
    }

    // ── Stack ──────────────────────────────────────────────────────

    /// Index of the highest live slot; the stack grows downward.
    ///
    /// # Safety
    ///
    /// Must be a stack.
    #[inline(always)]
    pub unsafe fn stack_top(self) -> usize {
        self.read_word(STACK_TOP_OFFSET).to_word() as usize
    }

    /// # Safety
    ///
    /// Must be a stack with `top <= length`.
    pub unsafe fn set_stack_top(self, top: usize) {
        debug_assert!(top <= self.length());
        self.write_word(STACK_TOP_OFFSET, Value::from_word(top as isize));
    }

    /// The program GC's stack chain link; smi 0 when unchained.
    ///
    /// # Safety
    ///
    /// Must be a stack.
    #[inline(always)]
    pub unsafe fn stack_next(self) -> Value {
        self.read_word(STACK_NEXT_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a stack.
    pub unsafe fn set_stack_next(self, next: Value) {
        self.write_word(STACK_NEXT_OFFSET, next);
    }

    /// # Safety
    ///
    /// Must be a stack with `index < length`.
    #[inline(always)]
    pub unsafe fn stack_slot(self, index: usize) -> Value {
        debug_assert!(index < self.length());
        self.read_word(STACK_SLOTS_OFFSET + index)
    }

    /// # Safety
    ///
    /// Must be a stack with `index < length`.
    #[inline(always)]
    pub unsafe fn set_stack_slot(self, index: usize, value: Value) {
        debug_assert!(index < self.length());
        self.write_word(STACK_SLOTS_OFFSET + index, value);
    }

    /// Raw address of slot `index`, for stack-limit math.
    ///
    /// # Safety
    ///
    /// Must be a stack with `index <= length`.
    #[inline(always)]
    pub unsafe fn stack_slot_address(self, index: usize) -> usize {
        debug_assert!(index <= self.length());
        self.0 + (STACK_SLOTS_OFFSET + index) * WORD_SIZE
    }

    // ── Dispatch table entry ───────────────────────────────────────

    /// # Safety
    ///
    /// Must be a dispatch table entry.
    #[inline(always)]
    pub unsafe fn entry_target(self) -> Value {
        self.read_word(ENTRY_TARGET_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a dispatch table entry.
    pub unsafe fn set_entry_target(self, target: Value) {
        self.write_word(ENTRY_TARGET_OFFSET, target);
    }

    /// The raw generated-code address; 0 when cleared.
    ///
    /// # Safety
    ///
    /// Must be a dispatch table entry.
    #[inline(always)]
    pub unsafe fn entry_code(self) -> usize {
        self.read_word(ENTRY_CODE_OFFSET).raw()
    }

    /// # Safety
    ///
    /// Must be a dispatch table entry.
    pub unsafe fn set_entry_code(self, code: usize) {
        self.write_word(ENTRY_CODE_OFFSET, Value::from_raw(code));
    }

    /// # Safety
    ///
    /// Must be a dispatch table entry.
    #[inline(always)]
    pub unsafe fn entry_selector(self) -> Value {
        self.read_word(ENTRY_SELECTOR_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a dispatch table entry.
    pub unsafe fn set_entry_selector(self, selector: Value) {
        debug_assert!(selector.is_smi());
        self.write_word(ENTRY_SELECTOR_OFFSET, selector);
    }

    // ── Double / large integer ─────────────────────────────────────

    /// # Safety
    ///
    /// Must be a double.
    #[inline(always)]
    pub unsafe fn double_value(self) -> f64 {
        *((self.0 + PAYLOAD_OFFSET) as *const f64)
    }

    /// # Safety
    ///
    /// Must be a double.
    pub unsafe fn set_double_value(self, value: f64) {
        *((self.0 + PAYLOAD_OFFSET) as *mut f64) = value;
    }

    /// # Safety
    ///
    /// Must be a large integer.
    #[inline(always)]
    pub unsafe fn large_integer_value(self) -> i64 {
        *((self.0 + PAYLOAD_OFFSET) as *const i64)
    }

    /// # Safety
    ///
    /// Must be a large integer.
    pub unsafe fn set_large_integer_value(self, value: i64) {
        *((self.0 + PAYLOAD_OFFSET) as *mut i64) = value;
    }

    // ── Initializer / boxed ────────────────────────────────────────

    /// # Safety
    ///
    /// Must be an initializer.
    #[inline(always)]
    pub unsafe fn initializer_function(self) -> Value {
        self.read_word(SINGLE_FIELD_OFFSET)
    }

    /// # Safety
    ///
    /// Must be an initializer.
    pub unsafe fn set_initializer_function(self, function: Value) {
        self.write_word(SINGLE_FIELD_OFFSET, function);
    }

    /// # Safety
    ///
    /// Must be a boxed object.
    #[inline(always)]
    pub unsafe fn boxed_value(self) -> Value {
        self.read_word(SINGLE_FIELD_OFFSET)
    }

    /// # Safety
    ///
    /// Must be a boxed object.
    pub unsafe fn set_boxed_value(self, value: Value) {
        self.write_word(SINGLE_FIELD_OFFSET, value);
    }
}

impl core::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HeapObject(0x{:x})", self.0)
    }
}
