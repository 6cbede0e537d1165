use heap::SemiSpace;
use object::{HeapObject, Value};

/// Walks the frames of an execution stack, newest first.
///
/// Frame layout, with the stack growing downward through the slot array:
///
/// ```text
/// slot[top]     head cell: smi index of the newest frame's fp slot
/// ...
/// slot[fp + 1]  raw bytecode pointer of the frame (or, for the bottom
///               native entry frame, the interpreter entry address)
/// slot[fp]      smi index of the previous frame's fp slot; 0 terminates
/// slot[< fp]    locals and spilled expression stack
/// ```
///
/// Bytecode pointers are interior pointers into program space; they are
/// valid only while functions do not move and are cooked into
/// (function, delta) pairs around every program GC.
pub struct Frame {
    stack: HeapObject,
    fp: usize,
}

impl Frame {
    /// # Safety
    ///
    /// `stack` must be a valid stack object.
    pub unsafe fn new(stack: HeapObject) -> Frame {
        Frame { stack, fp: stack.stack_top() }
    }

    /// Step to the next older frame. Returns false at the bottom.
    ///
    /// # Safety
    ///
    /// The stack's frame chain must be intact.
    pub unsafe fn move_previous(&mut self) -> bool {
        let previous = self.stack.stack_slot(self.fp);
        debug_assert!(previous.is_smi());
        let previous = previous.to_word() as usize;
        if previous == 0 {
            return false;
        }
        debug_assert!(previous < self.stack.length());
        self.fp = previous;
        true
    }

    /// The frame's bytecode-pointer slot, unparsed: a raw interior pointer
    /// while running, a function reference while cooked.
    ///
    /// # Safety
    ///
    /// Must be positioned on a frame (after a successful `move_previous`).
    pub unsafe fn byte_code_pointer(&self) -> Value {
        self.stack.stack_slot(self.fp + 1)
    }

    /// # Safety
    ///
    /// As [`Frame::byte_code_pointer`].
    pub unsafe fn set_byte_code_pointer(&self, value: Value) {
        self.stack.set_stack_slot(self.fp + 1, value);
    }

    /// Recover the function owning this frame's bytecode pointer by
    /// searching the program-space chunk that contains it. Fails for the
    /// bottom frame, whose slot holds a native entry address.
    ///
    /// # Safety
    ///
    /// Program space must be flushed and not mid-move.
    pub unsafe fn function_from_byte_code_pointer(
        &self,
        program_space: &SemiSpace,
    ) -> Option<HeapObject> {
        let bcp = self.byte_code_pointer().raw();
        let object = program_space.object_containing(bcp)?;
        if object.is_function() && object.contains_bytecode_address(bcp) {
            Some(object)
        } else {
            None
        }
    }
}

/// Number of slots kept free below the deepest frame; the stack limit
/// handed to the interpreter points here.
pub const STACK_OVERFLOW_SLACK: usize = 8;

/// Prepare a fresh execution stack: a bottom frame returning to the
/// native interpreter entry and on top of it the program's entry function
/// suspended at `bcp`, with `arity` argument slots filled with
/// `argument_fill`.
///
/// # Safety
///
/// `stack` must be a stack object with room for the frames; `bcp` and
/// `entry_code` must be word-aligned-agnostic raw addresses (they are
/// stored untagged).
pub unsafe fn push_initial_entry_frames(
    stack: HeapObject,
    arity: usize,
    bcp: usize,
    entry_code: usize,
    argument_fill: Value,
) {
    let length = stack.length();
    debug_assert!(arity + 6 + STACK_OVERFLOW_SLACK <= length);
    let mut sp = length;

    for _ in 0..arity {
        sp -= 1;
        stack.set_stack_slot(sp, argument_fill);
    }

    // Bottom frame: "returns" to the native interpreter entry.
    sp -= 1;
    stack.set_stack_slot(sp, Value::from_raw(entry_code));
    sp -= 1;
    stack.set_stack_slot(sp, Value::from_word(0));
    let native_fp = sp;

    // Entry-function frame, suspended at bcp.
    sp -= 1;
    stack.set_stack_slot(sp, Value::from_raw(bcp));
    sp -= 1;
    stack.set_stack_slot(sp, Value::from_word(native_fp as isize));
    let entry_fp = sp;

    // Head cell the walker starts from.
    sp -= 1;
    stack.set_stack_slot(sp, Value::from_word(entry_fp as isize));
    stack.set_stack_top(sp);
}
