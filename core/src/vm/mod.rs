//! Interpreter activation-frame engine
//!
//! Frame planning and allocation, the register/slot model, the mode-specialized dispatch loops,
//! closure/scope materialization, the try/catch/finally state machine with bailout replay, the
//! loop-body JIT handoff, and generator suspension.

mod alloc;
mod builder;
mod bytecode;
mod context;
mod debug;
mod encoding;
mod engine;
mod frame;
mod function;
mod generator;
mod guards;
mod interp;
mod jit;
mod module;
mod numeric;
mod profile;
mod scope;

pub use alloc::{AllocationRegion, AllocatorStats, FrameAllocator, FrameStorage};
pub use builder::{FunctionBuilder, Label};
pub use bytecode::*;
pub use context::{CallFrameInfo, ExecutionContext, ImplicitCallFlags, Library};
pub use debug::{DebugHook, ExceptionAction, StepAction, StepInfo, TracingHook};
pub use encoding::{
    DisasmLine, Instruction, LARGE_LAYOUT_PREFIX, LayoutSize, MEDIUM_LAYOUT_PREFIX, OpInfo, Operand, OperandKind,
    decode_at, disassemble, encode_into, layout_of, patch_target,
};
pub use engine::Engine;
pub use frame::{Activation, ExecutionMode, ForInEnumerator, FrameFlags, FrameLayout};
pub use function::{ClosureShape, FunctionBody, FunctionId, FunctionKind, LoopHeader, ScopeKind};
pub use generator::{GeneratorObject, GeneratorSnapshot, GeneratorStatus, IteratorStep};
pub use interp::{BailOutRecord, EhBailoutData, EhBailoutNode, HandlerKind};
pub use jit::{ClosureRegisters, LoopBodyFrame, NativeLoopBody, OptimizingBackend};
pub use module::{AsmItem, AssemblyFunction, AssemblyModule, ConstValue, Program};
pub use numeric::{NumType, NumValue, NumericConsts, NumericLayout, NumericSlots, Simd128};
pub use profile::{CallSiteProfile, DynamicProfileInfo, ValueTypes};
pub use scope::{FrameDisplay, Scope, ScopeSlots};

#[cfg(test)]
mod vm_test;
