//! Generated-code cache for the x64 JIT backend.
//!
//! The cache owns two fixed virtual-address regions:
//! - the **generated-code arena**, a file-mapping-backed executable region
//!   that machine code, data blobs, and per-function unwind-info blocks are
//!   bump-allocated into, with pages committed on demand; and
//! - the **indirection table**, one `u32` slot per 4-byte-aligned guest
//!   address, giving JIT-generated code an O(1) guest-address → host-entry
//!   resolution on the dynamic call path.
//!
//! Placement is designed for concurrent compiler workers: a single mutex
//! covers only the pointer-bump bookkeeping, after which each worker copies
//! into its own disjoint byte range, builds unwind info, and finally
//! publishes the indirection slot, so a racing reader either sees the old
//! sentinel (and takes the slow dispatch path) or a fully-written function.
//!
//! Exception unwinding through JIT frames is served by a fixed-capacity,
//! address-sorted table of [`unwind::RuntimeFunction`] entries, registered
//! with the OS through the [`backend::UnwindBackend`] seam (Win64 growable
//! function tables on Windows, a null backend elsewhere).

mod arena;
mod indirection;

pub mod backend;
pub mod cache;
pub mod unwind;

pub use cache::{CodeCache, CodeCacheError, CodeCacheOptions};
pub use unwind::RuntimeFunction;

/// Base guest address covered by the indirection table.
pub const INDIRECTION_TABLE_BASE: u32 = 0x8000_0000;
/// Size in bytes of the indirection table's guest window.
pub const INDIRECTION_TABLE_SIZE: u32 = 0x1FFF_FFFF;
/// Fixed host address the generated-code arena is mapped at.
pub const GENERATED_CODE_BASE: u32 = 0xA000_0000;
/// Size in bytes of the generated-code arena.
pub const GENERATED_CODE_SIZE: u32 = 0x0FFF_FFFF;

/// Upper bound on placed functions. The unwind table is preallocated at this
/// capacity because its backing array must never move once registered with
/// the OS; the bound is picked high enough that real workloads never reach
/// it.
pub const MAX_FUNCTION_COUNT: usize = 100_000;

/// Granularity of demand commits into the arena.
pub const COMMIT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Alignment of every code/data placement within the arena.
pub const CODE_ALIGNMENT: usize = 16;

const _: () = {
    assert!(CODE_ALIGNMENT.is_power_of_two());
    assert!(COMMIT_CHUNK_SIZE % 4096 == 0);

    // The default guest window and arena must fit below 4 GiB: indirection
    // slots and `place_data` return values are guest-visible u32 addresses.
    assert!(INDIRECTION_TABLE_BASE as u64 + INDIRECTION_TABLE_SIZE as u64 <= u32::MAX as u64 + 1);
    assert!(GENERATED_CODE_BASE as u64 + GENERATED_CODE_SIZE as u64 <= u32::MAX as u64 + 1);

    // The two windows must not overlap; the indirection window ends where the
    // arena begins.
    assert!(INDIRECTION_TABLE_BASE as u64 + INDIRECTION_TABLE_SIZE as u64
        <= GENERATED_CODE_BASE as u64);

    // One indirection slot per 4-byte-aligned guest address.
    assert!(INDIRECTION_TABLE_BASE % 4 == 0);

    // An unwind-info block must fit in its fixed reservation.
    assert!(unwind::UNWIND_INFO_SIZE <= unwind::UNWIND_RESERVATION_SIZE);
    assert!(unwind::UNWIND_RESERVATION_SIZE % CODE_ALIGNMENT == 0);
};
