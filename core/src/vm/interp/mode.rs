//! Compile-time dispatch-loop variants.
//!
//! `run::<M>` is monomorphized per mode so the unprofiled loop carries no profiling or debugger
//! checks at all; the branches on `M::PROFILE` and `M::DEBUG` fold away.

use crate::vm::frame::ExecutionMode;

pub(crate) trait ExecMode {
    const MODE: ExecutionMode;
    /// Record value types, call sites, and per-loop implicit calls.
    const PROFILE: bool;
    /// Call the debug hook before every instruction and intercept exceptions.
    const DEBUG: bool;
}

pub(crate) struct Unprofiled;
pub(crate) struct Profiling;
pub(crate) struct Debugging;

impl ExecMode for Unprofiled {
    const MODE: ExecutionMode = ExecutionMode::Unprofiled;
    const PROFILE: bool = false;
    const DEBUG: bool = false;
}

impl ExecMode for Profiling {
    const MODE: ExecutionMode = ExecutionMode::Profiling;
    const PROFILE: bool = true;
    const DEBUG: bool = false;
}

impl ExecMode for Debugging {
    const MODE: ExecutionMode = ExecutionMode::Debugging;
    const PROFILE: bool = false;
    const DEBUG: bool = true;
}
