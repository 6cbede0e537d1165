use crate::value::{Value, WORD_SIZE};

/// Object layout kind stored in bits 0..4 of an [`InstanceFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layout {
    Instance = 0,
    Class,
    Array,
    ByteArray,
    OneByteString,
    TwoByteString,
    Function,
    Stack,
    DispatchTableEntry,
    Double,
    LargeInteger,
    Initializer,
    Boxed,
}

impl Layout {
    pub const COUNT: usize = Self::Boxed as usize + 1;
}

/// Distinguishes well-known instance classes whose instances need cheap
/// predicates (`is_null`, `is_coroutine`, ...) without a class comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Marker {
    None = 0,
    Null,
    False,
    True,
    Coroutine,
    Port,
}

const LAYOUT_SHIFT: u32 = 0;
const LAYOUT_MASK: usize = 0xF;
const MARKER_SHIFT: u32 = 4;
const MARKER_MASK: usize = 0x7;
const SIZE_SHIFT: u32 = 8;
const SIZE_MASK: usize = 0xFFFF;

/// A class's packed layout descriptor.
///
/// ```text
/// bits 0..4:  layout kind
/// bits 4..7:  marker
/// bits 8..24: fixed size in bytes (header size for variable-size layouts)
/// ```
///
/// Stored in the class as a smi, so the descriptor survives GC unvisited.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct InstanceFormat(usize);

impl InstanceFormat {
    fn new(layout: Layout, marker: Marker, fixed_size: usize) -> Self {
        debug_assert!(fixed_size <= SIZE_MASK);
        debug_assert!(fixed_size.is_multiple_of(WORD_SIZE));
        Self(
            ((layout as usize) << LAYOUT_SHIFT)
                | ((marker as usize) << MARKER_SHIFT)
                | (fixed_size << SIZE_SHIFT),
        )
    }

    /// A fixed-size instance with `fields` pointer fields.
    pub fn instance(fields: usize) -> Self {
        Self::instance_with_marker(fields, Marker::None)
    }

    pub fn instance_with_marker(fields: usize, marker: Marker) -> Self {
        Self::new(Layout::Instance, marker, (2 + fields) * WORD_SIZE)
    }

    pub fn class() -> Self {
        Self::new(Layout::Class, Marker::None, 4 * WORD_SIZE)
    }

    pub fn array() -> Self {
        Self::new(Layout::Array, Marker::None, 2 * WORD_SIZE)
    }

    pub fn byte_array() -> Self {
        Self::new(Layout::ByteArray, Marker::None, 2 * WORD_SIZE)
    }

    pub fn one_byte_string() -> Self {
        Self::new(Layout::OneByteString, Marker::None, 2 * WORD_SIZE)
    }

    pub fn two_byte_string() -> Self {
        Self::new(Layout::TwoByteString, Marker::None, 2 * WORD_SIZE)
    }

    pub fn function() -> Self {
        Self::new(Layout::Function, Marker::None, 4 * WORD_SIZE)
    }

    pub fn stack() -> Self {
        Self::new(Layout::Stack, Marker::None, 4 * WORD_SIZE)
    }

    pub fn dispatch_table_entry() -> Self {
        Self::new(Layout::DispatchTableEntry, Marker::None, 4 * WORD_SIZE)
    }

    /// Boxed doubles carry a raw 8-byte payload after the class word.
    pub fn double() -> Self {
        Self::new(Layout::Double, Marker::None, WORD_SIZE + 8)
    }

    /// Boxed integers carry a raw `i64` payload after the class word.
    pub fn large_integer() -> Self {
        Self::new(Layout::LargeInteger, Marker::None, WORD_SIZE + 8)
    }

    pub fn initializer() -> Self {
        Self::new(Layout::Initializer, Marker::None, 2 * WORD_SIZE)
    }

    pub fn boxed() -> Self {
        Self::new(Layout::Boxed, Marker::None, 2 * WORD_SIZE)
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn layout(self) -> Layout {
        let raw = (self.0 >> LAYOUT_SHIFT) & LAYOUT_MASK;
        debug_assert!(raw < Layout::COUNT);
        unsafe { core::mem::transmute::<u8, Layout>(raw as u8) }
    }

    #[inline(always)]
    pub fn marker(self) -> Marker {
        let raw = (self.0 >> MARKER_SHIFT) & MARKER_MASK;
        debug_assert!(raw <= Marker::Port as usize);
        unsafe { core::mem::transmute::<u8, Marker>(raw as u8) }
    }

    /// Total size for fixed layouts; header size for variable layouts.
    #[inline(always)]
    pub fn fixed_size(self) -> usize {
        (self.0 >> SIZE_SHIFT) & SIZE_MASK
    }

    /// Number of pointer fields of a fixed-size instance.
    #[inline(always)]
    pub fn field_count(self) -> usize {
        debug_assert_eq!(self.layout(), Layout::Instance);
        self.fixed_size() / WORD_SIZE - 2
    }

    #[inline(always)]
    pub fn is_variable(self) -> bool {
        matches!(
            self.layout(),
            Layout::Array
                | Layout::ByteArray
                | Layout::OneByteString
                | Layout::TwoByteString
                | Layout::Function
                | Layout::Stack
        )
    }

    // ── Smi round trip ─────────────────────────────────────────────

    #[inline(always)]
    pub fn as_smi(self) -> Value {
        Value::from_word(self.0 as isize)
    }

    /// # Safety
    ///
    /// `value` must be a smi produced by [`InstanceFormat::as_smi`].
    #[inline(always)]
    pub unsafe fn from_smi(value: Value) -> Self {
        Self(value.to_word() as usize)
    }
}

impl core::fmt::Debug for InstanceFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstanceFormat")
            .field("layout", &self.layout())
            .field("marker", &self.marker())
            .field("fixed_size", &self.fixed_size())
            .finish()
    }
}
