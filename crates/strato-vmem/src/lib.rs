//! Fixed-address virtual-memory primitives for the JIT code cache.
//!
//! The code cache needs a handful of operations the standard library does not
//! expose: reserving a virtual range at a *specific* address without touching
//! its commit charge, committing sub-ranges of it on demand, and backing the
//! generated-code arena with a shareable OS mapping so an external debugger
//! process can map the same bytes. [`Reservation`] and
//! [`FileMapping`]/[`MappedView`] wrap those operations behind RAII types;
//! everything else in the workspace goes through them rather than calling the
//! OS directly.
//!
//! Addresses here are plain `usize` host addresses. Callers own the policy of
//! where regions live; this crate only enforces that a fixed-address request
//! either lands exactly where asked or fails.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

use bitflags::bitflags;
use thiserror::Error;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as sys;

bitflags! {
    /// Page protection for [`Reservation::commit`] / [`MappedView::commit`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protect: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protect {
    pub const RW: Protect = Protect::READ.union(Protect::WRITE);
    pub const RWX: Protect = Protect::READ.union(Protect::WRITE).union(Protect::EXECUTE);
}

#[derive(Debug, Error)]
pub enum VmemError {
    /// The fixed-address reservation could not be made, most commonly because
    /// the range is already occupied by another mapping in this process.
    #[error("failed to reserve {len:#x} bytes at {addr:#x}: {source}")]
    Reserve {
        addr: usize,
        len: usize,
        source: io::Error,
    },
    #[error("failed to commit {len:#x} bytes at {addr:#x}: {source}")]
    Commit {
        addr: usize,
        len: usize,
        source: io::Error,
    },
    #[error("failed to create a {len:#x} byte shareable mapping: {source}")]
    CreateMapping { len: usize, source: io::Error },
    #[error("failed to map a {len:#x} byte view at {addr:#x}: {source}")]
    MapView {
        addr: usize,
        len: usize,
        source: io::Error,
    },
    /// An offset/length pair fell outside the region it addresses.
    #[error("range {offset:#x}+{len:#x} is out of bounds for a {region_len:#x} byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
}

/// Host page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::query_page_size)
}

/// Rounds `value` up to a multiple of `align`. `align` must be a power of two.
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align`. `align` must be a power of two.
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

fn check_range(region_len: usize, offset: usize, len: usize) -> Result<(), VmemError> {
    let end = offset.checked_add(len).ok_or(VmemError::OutOfBounds {
        offset,
        len,
        region_len,
    })?;
    if end > region_len {
        return Err(VmemError::OutOfBounds {
            offset,
            len,
            region_len,
        });
    }
    Ok(())
}

/// A reserved (not yet accessible) anonymous virtual range at a fixed address.
///
/// Reservation claims the address range without commit charge; [`commit`]
/// makes page-aligned sub-ranges accessible. The whole range is released on
/// drop.
///
/// [`commit`]: Reservation::commit
#[derive(Debug)]
pub struct Reservation {
    base: NonNull<u8>,
    len: NonZeroUsize,
}

// Safety: the reservation owns its range exclusively; the OS calls used on it
// are thread-safe.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserves `len` bytes exactly at `addr` (rounded up to whole pages).
    ///
    /// Fails if any part of the range is already mapped. The request is never
    /// satisfied at a different address: on kernels that treat the fixed
    /// address as a hint, a mapping that landed elsewhere is unmapped and
    /// reported as a conflict.
    pub fn at_fixed(addr: usize, len: usize) -> Result<Reservation, VmemError> {
        assert!(addr % page_size() == 0, "reservation base must be page aligned");
        let len = align_up(len, page_size());
        let len = NonZeroUsize::new(len).expect("reservation length must be non-zero");
        let base = sys::reserve_fixed(addr, len.get())
            .map_err(|source| VmemError::Reserve { addr, len: len.get(), source })?;
        Ok(Reservation { base, len })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Commits the pages covering `[offset, offset + len)` with `protect`.
    ///
    /// Committing already-committed pages is harmless, so concurrent callers
    /// may commit overlapping ranges.
    pub fn commit(&self, offset: usize, len: usize, protect: Protect) -> Result<(), VmemError> {
        check_range(self.len.get(), offset, len)?;
        let start = align_down(offset, page_size());
        let end = align_up(offset + len, page_size()).min(self.len.get());
        let addr = self.base.as_ptr() as usize + start;
        sys::commit_anonymous(addr, end - start, protect)
            .map_err(|source| VmemError::Commit { addr, len: end - start, source })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: base/len describe a mapping this object owns.
        unsafe { sys::release(self.base.as_ptr(), self.len.get()) };
    }
}

/// A shareable OS mapping object sized for an executable arena.
///
/// Backed by `memfd`/`shm` on Unix and a pagefile section (`SEC_RESERVE`) on
/// Windows. Another process handed the descriptor/handle can map the same
/// bytes, which is what lets an out-of-process debugger see generated code.
#[derive(Debug)]
pub struct FileMapping {
    handle: sys::MappingHandle,
    len: NonZeroUsize,
}

unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Creates a mapping object of `len` bytes (rounded up to whole pages).
    pub fn create(len: usize) -> Result<FileMapping, VmemError> {
        let len = align_up(len, page_size());
        let len = NonZeroUsize::new(len).expect("mapping length must be non-zero");
        let handle = sys::create_mapping(len.get())
            .map_err(|source| VmemError::CreateMapping { len: len.get(), source })?;
        Ok(FileMapping { handle, len })
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Maps the whole object as a reserved (inaccessible) view exactly at
    /// `addr`. Pages become accessible through [`MappedView::commit`].
    pub fn map_fixed(&self, addr: usize) -> Result<MappedView<'_>, VmemError> {
        assert!(addr % page_size() == 0, "view base must be page aligned");
        let base = sys::map_view_fixed(&self.handle, addr, self.len.get())
            .map_err(|source| VmemError::MapView { addr, len: self.len.get(), source })?;
        Ok(MappedView {
            base,
            len: self.len,
            mapping: self,
        })
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        sys::close_mapping(&mut self.handle);
    }
}

/// A reserved view of a [`FileMapping`] at a fixed address.
///
/// The borrow ties the view to its mapping object so the view can never
/// outlive the handle backing it. Unmapped on drop.
#[derive(Debug)]
pub struct MappedView<'m> {
    base: NonNull<u8>,
    len: NonZeroUsize,
    mapping: &'m FileMapping,
}

unsafe impl Send for MappedView<'_> {}
unsafe impl Sync for MappedView<'_> {}

impl MappedView<'_> {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Commits the pages covering `[offset, offset + len)` with `protect`.
    /// Idempotent for already-committed pages, like [`Reservation::commit`].
    pub fn commit(&self, offset: usize, len: usize, protect: Protect) -> Result<(), VmemError> {
        check_range(self.len.get(), offset, len)?;
        let start = align_down(offset, page_size());
        let end = align_up(offset + len, page_size()).min(self.len.get());
        let addr = self.base.as_ptr() as usize + start;
        sys::commit_view(&self.mapping.handle, addr, end - start, protect)
            .map_err(|source| VmemError::Commit { addr, len: end - start, source })
    }
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        // Safety: base/len describe a view this object owns.
        unsafe { sys::unmap_view(self.base.as_ptr(), self.len.get()) };
    }
}

/// Flushes the instruction cache for `[ptr, ptr + len)` after code bytes were
/// written there.
///
/// x86-64 keeps instruction fetch coherent with data writes, so the Unix
/// build is a no-op; Windows is called anyway per convention so tooling that
/// hooks `FlushInstructionCache` observes the new code.
pub fn flush_instruction_cache(ptr: *const u8, len: usize) {
    sys::flush_instruction_cache(ptr, len);
}
