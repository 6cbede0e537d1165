pub mod bytecode;
pub mod debug_info;
pub mod flags;
pub mod frame;
pub mod lookup_cache;
pub mod port;
pub mod process;
pub mod program;
pub mod snapshot;

pub use bytecode::{compute_intrinsic, IntrinsicsTable, Opcode};
pub use debug_info::{Breakpoint, DebugInfo, NO_BREAKPOINT_ID};
pub use flags::Flags;
pub use frame::{push_initial_entry_frames, Frame, STACK_OVERFLOW_SLACK};
pub use lookup_cache::LookupCache;
pub use port::Port;
pub use process::{Links, Process, ProcessState, Signal};
pub use program::{
    Program, COMPILE_TIME_ERROR_EXIT_CODE, UNCAUGHT_EXCEPTION_EXIT_CODE,
};
pub use snapshot::{PopularityCounter, MOST_POPULAR_COUNT};

/// Allocation returned the failure sentinel: no chunk had room and the
/// caller was not inside a no-allocation-failure scope. Callers retry
/// after a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationFailed;
