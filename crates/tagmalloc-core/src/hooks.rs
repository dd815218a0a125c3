//! User-installable entry hooks.
//!
//! When a hook is present the matching public entry bypasses the engine
//! entirely and returns whatever the hook produced. The post-extension
//! hook fires after every successful contiguous-heap adjustment.

use parking_lot::RwLock;

/// Replacement for allocate. Returns the user pointer or `None`.
pub type MallocHookFn = fn(bytes: usize) -> Option<usize>;
/// Replacement for release.
pub type FreeHookFn = fn(ptr: usize);
/// Replacement for reallocate.
pub type ReallocHookFn = fn(ptr: usize, bytes: usize) -> Option<usize>;
/// Replacement for aligned allocate.
pub type MemalignHookFn = fn(alignment: usize, bytes: usize) -> Option<usize>;
/// Notification after the contiguous heap moved.
pub type AfterMorecoreHookFn = fn();

/// The full hook set; absent entries fall through to the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookTable {
    pub malloc: Option<MallocHookFn>,
    pub free: Option<FreeHookFn>,
    pub realloc: Option<ReallocHookFn>,
    pub memalign: Option<MemalignHookFn>,
    pub after_morecore: Option<AfterMorecoreHookFn>,
}

pub(crate) struct Hooks {
    table: RwLock<HookTable>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HookTable::default()),
        }
    }

    /// Installs a new table, returning the previous one.
    pub fn install(&self, table: HookTable) -> HookTable {
        std::mem::replace(&mut *self.table.write(), table)
    }

    /// Snapshot of the current table.
    #[inline]
    pub fn get(&self) -> HookTable {
        *self.table.read()
    }

    #[inline]
    pub fn fire_after_morecore(&self) {
        if let Some(h) = self.table.read().after_morecore {
            h();
        }
    }
}
