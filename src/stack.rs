//! Stack allocation and reuse.
//!
//! `corosensei::stack::DefaultStack` does the mmap-plus-guard-page
//! allocation (the part that needs platform-specific
//! `mprotect`/`VirtualProtect` calls); `StackPool` recycles those
//! allocations so a tight `reset()` loop doesn't pay for a fresh mapping
//! every time.

use std::sync::{Arc, Mutex};

use corosensei::stack::DefaultStack;

/// Default stack size for a spawned [`crate::fiber::Fiber`].
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// How many spare stacks a single pool will hold onto before it starts
/// letting them deallocate normally.
const POOL_CAPACITY: usize = 256;

/// A pool of same-sized stacks, so that a tight `reset()` loop recycles
/// memory instead of mapping and unmapping on every iteration.
#[derive(Clone)]
pub struct StackPool {
    size: usize,
    spares: Arc<Mutex<Vec<DefaultStack>>>,
}

impl StackPool {
    pub fn new(size: usize) -> StackPool {
        StackPool {
            size,
            spares: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Take a stack of this pool's size, reusing a spare one if available.
    pub fn take(&self) -> std::io::Result<DefaultStack> {
        if let Some(stack) = self.spares.lock().unwrap().pop() {
            return Ok(stack);
        }
        DefaultStack::new(self.size)
    }

    /// Return a stack to the pool for later reuse.
    pub fn give(&self, stack: DefaultStack) {
        let mut spares = self.spares.lock().unwrap();
        if spares.len() < POOL_CAPACITY {
            spares.push(stack);
        }
    }
}
