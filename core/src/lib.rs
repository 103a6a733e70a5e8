//! Activation-frame interpreter engine: frame planning and allocation, mode-specialized
//! dispatch, try/catch/finally with bailout replay, loop-body JIT handoff, and generators.

pub mod config;
pub mod error;
pub mod val;

// Frame engine, bytecode, and assembly modules
pub mod vm;

pub use config::EngineConfig;
pub use error::{VmError, VmResult};
pub use val::Val;
pub use vm::Engine;
