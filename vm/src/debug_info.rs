use std::collections::HashMap;

use object::{HeapObject, PointerVisitor, Value};

pub const NO_BREAKPOINT_ID: i32 = -1;

/// A breakpoint at (function, bytecode offset). The table key is the
/// absolute bytecode pointer, which a program GC invalidates whenever it
/// moves the function; `DebugInfo::update_breakpoints` rekeys afterwards.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    function: Value,
    bytecode_index: usize,
    id: i32,
    is_one_shot: bool,
    /// Set for step-over breakpoints: the coroutine whose stack height
    /// must match for the break to fire.
    coroutine: Option<Value>,
    stack_height: usize,
}

impl Breakpoint {
    fn new(
        function: Value,
        bytecode_index: usize,
        id: i32,
        is_one_shot: bool,
        coroutine: Option<Value>,
        stack_height: usize,
    ) -> Breakpoint {
        Breakpoint {
            function,
            bytecode_index,
            id,
            is_one_shot,
            coroutine,
            stack_height,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn function(&self) -> Value {
        self.function
    }

    pub fn bytecode_index(&self) -> usize {
        self.bytecode_index
    }

    pub fn is_one_shot(&self) -> bool {
        self.is_one_shot
    }

    /// The stack of the step-over coroutine, if any.
    ///
    /// # Safety
    ///
    /// A set coroutine must be a live coroutine instance.
    pub unsafe fn stack(&self) -> Option<HeapObject> {
        let coroutine = self.coroutine?;
        let stack = HeapObject::from_value(coroutine).field(0);
        Some(HeapObject::from_value(stack))
    }

    pub fn stack_height(&self) -> usize {
        self.stack_height
    }

    /// Process-heap references (the coroutine).
    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        if let Some(coroutine) = &mut self.coroutine {
            visitor.visit(coroutine as *mut Value);
        }
    }

    /// Program-heap references (the function).
    pub fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.function as *mut Value);
    }
}

/// The debugger state the interpreter consults on every bytecode.
pub struct DebugInfo {
    is_stepping: bool,
    is_at_breakpoint: bool,
    current_breakpoint_id: i32,
    next_breakpoint_id: i32,
    breakpoints: HashMap<usize, Breakpoint>,
}

impl DebugInfo {
    pub fn new() -> DebugInfo {
        DebugInfo {
            is_stepping: false,
            is_at_breakpoint: false,
            current_breakpoint_id: NO_BREAKPOINT_ID,
            next_breakpoint_id: 0,
            breakpoints: HashMap::new(),
        }
    }

    // ── Interpreter-facing state ───────────────────────────────────

    pub fn is_stepping(&self) -> bool {
        self.is_stepping
    }

    pub fn set_stepping(&mut self) {
        self.is_stepping = true;
    }

    pub fn clear_stepping(&mut self) {
        self.is_stepping = false;
    }

    pub fn is_at_breakpoint(&self) -> bool {
        self.is_at_breakpoint
    }

    pub fn current_breakpoint_id(&self) -> i32 {
        self.current_breakpoint_id
    }

    pub fn clear_current_breakpoint(&mut self) {
        self.is_at_breakpoint = false;
        self.current_breakpoint_id = NO_BREAKPOINT_ID;
    }

    fn set_current_breakpoint(&mut self, id: i32) {
        self.is_at_breakpoint = true;
        self.current_breakpoint_id = id;
    }

    // ── Breakpoint table ───────────────────────────────────────────

    /// Install a breakpoint; setting one where a breakpoint already exists
    /// returns the existing id.
    ///
    /// # Safety
    ///
    /// `function` must be a valid function object and `bytecode_index`
    /// must lie within its bytecodes.
    pub unsafe fn set_breakpoint(
        &mut self,
        function: HeapObject,
        bytecode_index: usize,
        one_shot: bool,
        coroutine: Option<Value>,
        stack_height: usize,
    ) -> i32 {
        let key = function.bytecode_address_for(0) + bytecode_index;
        if let Some(existing) = self.breakpoints.get(&key) {
            return existing.id();
        }
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.insert(
            key,
            Breakpoint::new(
                function.to_value(),
                bytecode_index,
                id,
                one_shot,
                coroutine,
                stack_height,
            ),
        );
        id
    }

    pub fn delete_breakpoint(&mut self, id: i32) -> bool {
        let key = self
            .breakpoints
            .iter()
            .find(|(_, b)| b.id() == id)
            .map(|(&key, _)| key);
        match key {
            Some(key) => {
                self.breakpoints.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Consulted on every bytecode: `bcp` is the absolute bytecode
    /// pointer, `sp` the raw stack-pointer address. A step-over breakpoint
    /// only fires when the height matches; an unwound stack (sp above the
    /// expected slot) simply does not break.
    ///
    /// # Safety
    ///
    /// A matching breakpoint's coroutine stack must be live.
    pub unsafe fn should_break(&mut self, bcp: usize, sp: usize) -> bool {
        if let Some(breakpoint) = self.breakpoints.get(&bcp) {
            if let Some(stack) = breakpoint.stack() {
                let index = stack.length() - breakpoint.stack_height();
                let expected_sp = stack.stack_slot_address(index);
                debug_assert!(sp <= expected_sp);
                if expected_sp != sp {
                    return false;
                }
            }
            let id = breakpoint.id();
            let one_shot = breakpoint.is_one_shot();
            self.set_current_breakpoint(id);
            if one_shot {
                self.delete_breakpoint(id);
            }
            return true;
        }
        if self.is_stepping {
            self.set_current_breakpoint(NO_BREAKPOINT_ID);
            return true;
        }
        false
    }

    /// Rebuild the table from each breakpoint's (function, offset) after a
    /// program GC has moved functions.
    ///
    /// # Safety
    ///
    /// Every stored function value must have been updated to its new
    /// location already (the GC's root pass does this).
    pub unsafe fn update_breakpoints(&mut self) {
        let old = core::mem::take(&mut self.breakpoints);
        for (_, breakpoint) in old {
            let function = HeapObject::from_value(breakpoint.function());
            let key = function.bytecode_address_for(0)
                + breakpoint.bytecode_index();
            self.breakpoints.insert(key, breakpoint);
        }
    }

    /// The table's keys, for consistency checks.
    pub fn breakpoint_keys(&self) -> Vec<(usize, Value, usize)> {
        self.breakpoints
            .iter()
            .map(|(&key, b)| (key, b.function(), b.bytecode_index()))
            .collect()
    }

    // ── GC interface ───────────────────────────────────────────────

    /// Process-heap pointers (step-over coroutines).
    pub fn visit_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            breakpoint.visit_pointers(visitor);
        }
    }

    /// Program-heap pointers (breakpoint functions).
    pub fn visit_program_pointers(&mut self, visitor: &mut dyn PointerVisitor) {
        for breakpoint in self.breakpoints.values_mut() {
            breakpoint.visit_program_pointers(visitor);
        }
    }
}

impl Default for DebugInfo {
    fn default() -> Self {
        Self::new()
    }
}
