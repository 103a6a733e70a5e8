use std::{
    cell::{Cell, RefCell},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::frame::FrameLayout;
use super::function::FunctionKind;
use crate::config::EngineConfig;
use crate::error::{VmError, VmResult};
use crate::val::Val;

/// Where an activation's slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationRegion {
    /// Thread-local slot pool reused across calls.
    #[default]
    Stack,
    /// Secondary allocator for frames above the locals threshold.
    Arena,
    /// Owned by a generator object and kept across suspensions.
    Heap,
}

const MAX_POOLED_BUFFERS: usize = 64;

thread_local! {
    static TLS_SLOT_POOL: RefCell<Vec<Vec<Val>>> = const { RefCell::new(Vec::new()) };
    static TLS_STACK_SLOTS: Cell<usize> = const { Cell::new(0) };
}

/// Pool-backed slots charged against the thread's stack budget until dropped.
#[derive(Debug)]
pub struct PooledSlots {
    slots: Vec<Val>,
    charged: usize,
}

impl Drop for PooledSlots {
    fn drop(&mut self) {
        let mut slots = std::mem::take(&mut self.slots);
        slots.clear();
        let charged = self.charged;
        let _ = TLS_STACK_SLOTS.try_with(|used| used.set(used.get().saturating_sub(charged)));
        let _ = TLS_SLOT_POOL.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOLED_BUFFERS {
                pool.push(slots);
            }
        });
    }
}

/// Arena-backed slots returned to the shared budget when dropped.
#[derive(Debug)]
pub struct ArenaSlots {
    slots: Vec<Val>,
    charged: usize,
    budget: Arc<AtomicUsize>,
}

impl Drop for ArenaSlots {
    fn drop(&mut self) {
        self.budget.fetch_sub(self.charged, Ordering::Relaxed);
    }
}

/// Value-slot storage of one activation, whatever region backs it.
#[derive(Debug)]
pub enum FrameStorage {
    Stack(PooledSlots),
    Arena(ArenaSlots),
    Heap(Vec<Val>),
}

impl FrameStorage {
    #[inline]
    pub fn slots(&self) -> &[Val] {
        match self {
            FrameStorage::Stack(s) => &s.slots,
            FrameStorage::Arena(s) => &s.slots,
            FrameStorage::Heap(s) => s,
        }
    }

    #[inline]
    pub fn slots_mut(&mut self) -> &mut [Val] {
        match self {
            FrameStorage::Stack(s) => &mut s.slots,
            FrameStorage::Arena(s) => &mut s.slots,
            FrameStorage::Heap(s) => s,
        }
    }

    pub fn region(&self) -> AllocationRegion {
        match self {
            FrameStorage::Stack(_) => AllocationRegion::Stack,
            FrameStorage::Arena(_) => AllocationRegion::Arena,
            FrameStorage::Heap(_) => AllocationRegion::Heap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AllocatorStats {
    pub stack_slots_in_use: usize,
    pub arena_slots_in_use: usize,
    pub heap_slots_allocated: u64,
}

/// Frame storage provider: thread-local pool, bounded arena, or heap.
#[derive(Debug)]
pub struct FrameAllocator {
    locals_threshold: usize,
    max_stack_slots: usize,
    max_arena_slots: usize,
    arena_in_use: Arc<AtomicUsize>,
    heap_slots: AtomicU64,
}

impl FrameAllocator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            locals_threshold: config.locals_threshold,
            max_stack_slots: config.max_stack_slots,
            max_arena_slots: config.max_arena_slots,
            arena_in_use: Arc::new(AtomicUsize::new(0)),
            heap_slots: AtomicU64::new(0),
        }
    }

    /// Region policy: generators are heap-resident, oversized frames go to the arena.
    pub fn region_for(&self, layout: &FrameLayout, kind: FunctionKind) -> AllocationRegion {
        if kind == FunctionKind::Generator {
            AllocationRegion::Heap
        } else if layout.total_slots() as usize > self.locals_threshold {
            AllocationRegion::Arena
        } else {
            AllocationRegion::Stack
        }
    }

    /// Obtain `layout.value_slots()` slots filled with `undefined`, charging `total_slots()`.
    pub fn allocate(&self, layout: &FrameLayout, region: AllocationRegion) -> VmResult<FrameStorage> {
        let len = layout.value_slots() as usize;
        let charged = layout.total_slots() as usize;
        match region {
            AllocationRegion::Stack => {
                let used = TLS_STACK_SLOTS.with(Cell::get);
                if used + charged > self.max_stack_slots {
                    trace!(
                        target: "tern::vm::alloc",
                        requested = charged,
                        in_use = used,
                        "frame_allocator.stack_probe_failed"
                    );
                    return Err(VmError::StackOverflow);
                }
                TLS_STACK_SLOTS.with(|cell| cell.set(used + charged));
                let mut slots = TLS_SLOT_POOL
                    .with(|pool| pool.borrow_mut().pop())
                    .unwrap_or_default();
                slots.clear();
                slots.resize(len, Val::Undefined);
                Ok(FrameStorage::Stack(PooledSlots { slots, charged }))
            }
            AllocationRegion::Arena => {
                let prev = self.arena_in_use.fetch_add(charged, Ordering::Relaxed);
                if prev + charged > self.max_arena_slots {
                    self.arena_in_use.fetch_sub(charged, Ordering::Relaxed);
                    trace!(
                        target: "tern::vm::alloc",
                        requested = charged,
                        in_use = prev,
                        "frame_allocator.arena_exhausted"
                    );
                    return Err(VmError::OutOfMemory);
                }
                trace!(
                    target: "tern::vm::alloc",
                    slots = charged,
                    total_slots = prev + charged,
                    "frame_allocator.arena_alloc"
                );
                Ok(FrameStorage::Arena(ArenaSlots {
                    slots: vec![Val::Undefined; len],
                    charged,
                    budget: Arc::clone(&self.arena_in_use),
                }))
            }
            AllocationRegion::Heap => {
                let prev = self.heap_slots.fetch_add(charged as u64, Ordering::Relaxed);
                trace!(
                    target: "tern::vm::alloc",
                    slots = charged,
                    total_slots = prev + charged as u64,
                    "frame_allocator.heap_alloc"
                );
                Ok(FrameStorage::Heap(vec![Val::Undefined; len]))
            }
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            stack_slots_in_use: TLS_STACK_SLOTS.with(Cell::get),
            arena_slots_in_use: self.arena_in_use.load(Ordering::Relaxed),
            heap_slots_allocated: self.heap_slots.load(Ordering::Relaxed),
        }
    }

    pub fn locals_threshold(&self) -> usize {
        self.locals_threshold
    }
}
