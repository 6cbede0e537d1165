use std::sync::atomic::{AtomicUsize, Ordering};

use object::{HeapObject, PointerVisitor, Value};

use crate::frame::STACK_OVERFLOW_SLACK;
use crate::port::Port;

/// How a process run ended; the main process's signal becomes the
/// program's exit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminated,
    CompileTimeError,
    UncaughtException,
    UnhandledSignal,
    Killed,
    /// Transient scheduler state, never a legal terminal signal.
    ShouldKill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Yielding,
    Breakpoint,
    WaitingForChildren,
    Terminated,
}

/// The process's link set, reduced to what the core consumes: the signal
/// its exit propagates.
#[derive(Debug)]
pub struct Links {
    exit_signal: Signal,
}

impl Links {
    fn new() -> Links {
        Links { exit_signal: Signal::Terminated }
    }

    pub fn exit_signal(&self) -> Signal {
        self.exit_signal
    }

    pub fn set_exit_signal(&mut self, signal: Signal) {
        self.exit_signal = signal;
    }
}

/// A mutator. Owned by the program through its process list; the core
/// only needs its roots, its stack, its ports, and the stack limit it
/// must refresh whenever the stack moves or shrinks.
pub struct Process {
    parent: *mut Process,
    /// Living descendants including this process itself; deletion walks up
    /// the parent chain while the count drains to zero.
    pub(crate) process_triangle_count: i32,
    state: ProcessState,
    links: Links,
    ports: Vec<Port>,
    stack: Value,
    stack_limit: AtomicUsize,
    arguments: Vec<Vec<u8>>,
    allocation_failed: bool,
}

impl Process {
    pub fn new(parent: *mut Process) -> Process {
        Process {
            parent,
            process_triangle_count: 1,
            state: ProcessState::Ready,
            links: Links::new(),
            ports: Vec::new(),
            stack: Value::ZERO,
            stack_limit: AtomicUsize::new(0),
            arguments: Vec::new(),
            allocation_failed: false,
        }
    }

    pub fn parent(&self) -> *mut Process {
        self.parent
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }

    pub fn allocation_failed(&self) -> bool {
        self.allocation_failed
    }

    pub(crate) fn mark_allocation_failed(&mut self) {
        self.allocation_failed = true;
    }

    // ── Stack ──────────────────────────────────────────────────────

    pub fn stack(&self) -> Value {
        self.stack
    }

    pub fn set_stack(&mut self, stack: Value) {
        debug_assert!(stack.is_heap_object());
        self.stack = stack;
        self.update_stack_limit();
    }

    /// Refresh the overflow-check address after the stack may have moved.
    /// The limit is read by the interpreter thread, hence the atomic.
    pub fn update_stack_limit(&mut self) {
        if !self.stack.is_heap_object() {
            return;
        }
        let stack = HeapObject::from_value(self.stack);
        let limit = unsafe { stack.stack_slot_address(STACK_OVERFLOW_SLACK) };
        self.stack_limit.store(limit, Ordering::Release);
    }

    pub fn stack_limit(&self) -> usize {
        self.stack_limit.load(Ordering::Acquire)
    }

    // ── Ports ──────────────────────────────────────────────────────

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn take_ports(&mut self) -> Vec<Port> {
        core::mem::take(&mut self.ports)
    }

    pub fn set_ports(&mut self, ports: Vec<Port>) {
        self.ports = ports;
    }

    pub fn add_port(&mut self, port: Port) {
        self.ports.push(port);
    }

    // ── Arguments ──────────────────────────────────────────────────

    pub fn set_arguments(&mut self, arguments: Vec<Vec<u8>>) {
        self.arguments = arguments;
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.arguments
    }

    // ── GC interface ───────────────────────────────────────────────

    /// Strong roots for the shared-heap collectors. Ports are weak and
    /// deliberately absent.
    pub fn iterate_roots(&mut self, visitor: &mut dyn PointerVisitor) {
        visitor.visit(&mut self.stack as *mut Value);
    }

    /// Slots that may hold program-space pointers, visited by the program
    /// GC's scavenger (which ignores everything outside program space).
    pub fn iterate_program_pointers(
        &mut self,
        visitor: &mut dyn PointerVisitor,
    ) {
        visitor.visit(&mut self.stack as *mut Value);
    }

    /// Record the terminal signal and drop resources; the process stays in
    /// the list until `schedule_process_for_deletion` unlinks it.
    pub fn cleanup(&mut self, kind: Signal) {
        debug_assert!(kind != Signal::ShouldKill);
        self.links.set_exit_signal(kind);
        self.ports.clear();
        self.state = ProcessState::Terminated;
    }
}
