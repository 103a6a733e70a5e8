use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Slot count above which frames leave the reusable stack pool for the arena.
pub const DEFAULT_LOCALS_THRESHOLD: usize = 32 * 1024;

/// Engine tuning knobs. Every field has a default so partial TOML files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames planned above this many slots are served by the arena allocator.
    pub locals_threshold: usize,
    /// Total live arena slots before allocation fails with out-of-memory.
    pub max_arena_slots: usize,
    /// Total live stack-pool slots before a call fails with stack overflow.
    pub max_stack_slots: usize,
    /// Interpreted call depth (including nested handler loops) before stack overflow.
    pub max_call_depth: usize,
    /// Largest array an `NewArray` instruction may request.
    pub max_array_length: usize,
    pub loop_jit_enabled: bool,
    /// Interpreted iterations after which a loop body is offered to the backend.
    pub loop_jit_threshold: u32,
    /// Number of initial calls of a function that run in the profiling loop.
    pub profile_calls: u32,
    /// Iterations an unprofiled loop runs before switching to profiling at a loop boundary.
    /// Zero disables auto-profiling.
    pub min_profile_iterations: u32,
    /// Instructions a `finally` body may execute while a resource-exhaustion error unwinds.
    pub exhaustion_finally_budget: u32,
    /// Select the debugging loop for every call when a debug hook is installed.
    pub debug_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            locals_threshold: DEFAULT_LOCALS_THRESHOLD,
            max_arena_slots: 4 * 1024 * 1024,
            max_stack_slots: 256 * 1024,
            max_call_depth: 200,
            max_array_length: 1 << 24,
            loop_jit_enabled: true,
            loop_jit_threshold: 1_000,
            profile_calls: 1,
            min_profile_iterations: 0,
            exhaustion_finally_budget: 1_024,
            debug_mode: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(src).context("invalid engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_call_depth > 0, "max_call_depth must be positive");
        ensure!(self.locals_threshold > 0, "locals_threshold must be positive");
        ensure!(
            self.max_stack_slots >= self.locals_threshold,
            "max_stack_slots ({}) must be at least locals_threshold ({})",
            self.max_stack_slots,
            self.locals_threshold
        );
        Ok(())
    }
}
