use object::HeapObject;

/// The opcodes the core needs to see: enough to pick a dispatch-table
/// intrinsic from a function's first bytecode. The interpreter owns the
/// full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    LoadLocal = 0,
    LoadField,
    StoreField,
    Identical,
    ListIndexGet,
    ListIndexSet,
    ListLength,
    InvokeMethod,
    Return,
}

impl Opcode {
    pub const COUNT: usize = Self::Return as usize + 1;

    pub fn from_u8(raw: u8) -> Option<Opcode> {
        if (raw as usize) < Self::COUNT {
            // SAFETY: raw is within the enum's range.
            Some(unsafe { core::mem::transmute::<u8, Opcode>(raw) })
        } else {
            None
        }
    }
}

/// Raw entry points of the generated intrinsic stubs, filled into
/// dispatch-table code words. Address 0 means "no stub".
#[derive(Debug, Clone, Copy, Default)]
pub struct IntrinsicsTable {
    pub object_equals: usize,
    pub get_field: usize,
    pub set_field: usize,
    pub list_index_get: usize,
    pub list_index_set: usize,
    pub list_length: usize,
}

/// Pick the intrinsic stub for `function` from its first opcode, the way
/// the interpreter's fast paths expect.
///
/// # Safety
///
/// `function` must be a valid function object.
pub unsafe fn compute_intrinsic(
    function: HeapObject,
    intrinsics: &IntrinsicsTable,
) -> Option<usize> {
    let bytecodes = function.bytecodes();
    let first = Opcode::from_u8(*bytecodes.first()?)?;
    let code = match first {
        Opcode::LoadField => intrinsics.get_field,
        Opcode::StoreField => intrinsics.set_field,
        Opcode::Identical => intrinsics.object_equals,
        Opcode::ListIndexGet => intrinsics.list_index_get,
        Opcode::ListIndexSet => intrinsics.list_index_set,
        Opcode::ListLength => intrinsics.list_length,
        _ => 0,
    };
    if code == 0 {
        None
    } else {
        Some(code)
    }
}
