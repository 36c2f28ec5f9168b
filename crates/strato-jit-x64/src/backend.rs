//! OS registration seam for the unwind table.
//!
//! The allocator/table logic is platform-neutral; what differs per platform
//! is how (whether) the OS exception dispatcher learns about the table.
//! [`UnwindBackend`] is that seam: the Win64 implementation feeds the
//! growable-function-table machinery, everything else gets [`NullBackend`]
//! and relies on the manual [`CodeCache::lookup_unwind_info`] path.
//!
//! [`CodeCache::lookup_unwind_info`]: crate::cache::CodeCache::lookup_unwind_info

use std::io;
use std::sync::Arc;

use crate::unwind::UnwindTable;

/// Platform hook for exposing the unwind table to the OS.
///
/// Implementations must unregister in their `Drop`: the cache drops its
/// backend before the table and arena, so the OS never observes freed
/// memory during a racing exception.
pub trait UnwindBackend: Send + Sync + std::fmt::Debug {
    /// Registers the (initially empty) fixed-capacity table, bounded by the
    /// arena at `[arena_base, arena_base + arena_len)`.
    fn register(
        &mut self,
        table: Arc<UnwindTable>,
        arena_base: usize,
        arena_len: usize,
    ) -> io::Result<()>;

    /// Called after the table's published count grew to `count`. Counts are
    /// monotonic and only ever cover fully-written entries.
    fn grow(&self, count: u32);
}

/// Backend for targets without OS-level JIT unwind registration.
#[derive(Debug, Default)]
pub struct NullBackend;

impl UnwindBackend for NullBackend {
    fn register(
        &mut self,
        _table: Arc<UnwindTable>,
        _arena_base: usize,
        _arena_len: usize,
    ) -> io::Result<()> {
        Ok(())
    }

    fn grow(&self, _count: u32) {}
}

#[cfg(windows)]
mod win64;
#[cfg(windows)]
pub use win64::Win64Backend;

/// The default backend for this build target.
pub(crate) fn platform_backend() -> Box<dyn UnwindBackend> {
    #[cfg(windows)]
    {
        Box::new(Win64Backend::new())
    }
    #[cfg(not(windows))]
    {
        Box::new(NullBackend)
    }
}
