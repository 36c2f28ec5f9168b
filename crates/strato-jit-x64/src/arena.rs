//! The generated-code arena: a fixed-address executable region, backed by a
//! shareable mapping, with demand-committed pages.
//!
//! Offsets are handed out by the cache's allocation lock; this type owns the
//! raw memory and keeps all pointer arithmetic behind bounds-checked
//! `write`/`fill`. Callers may touch a range only while they hold its
//! exclusive (never re-issued) reservation, which is what makes the
//! lock-free copies in `place_code`/`place_data` sound.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use strato_vmem::{FileMapping, MappedView, Protect, VmemError};

use crate::COMMIT_CHUNK_SIZE;

/// Lifetime workaround: the view borrows the mapping, and both live together
/// for the arena's whole life, so the pair is stored with the view's borrow
/// erased. `view` is declared first so it drops (unmaps) before `mapping`
/// closes the object it borrows from.
#[derive(Debug)]
pub(crate) struct CodeArena {
    view: MappedView<'static>,
    _mapping: Box<FileMapping>,
    /// High-water mark of committed bytes. Advances by CAS; racing threads
    /// may commit redundantly (the OS call is idempotent) but the mark never
    /// moves backward.
    commit_mark: AtomicUsize,
}

impl CodeArena {
    /// Creates the shareable mapping and maps it, reserved, exactly at
    /// `base`.
    pub(crate) fn map_fixed(base: usize, len: usize) -> Result<CodeArena, VmemError> {
        let mapping = Box::new(FileMapping::create(len)?);
        // Safety: the mapping box is never dropped (nor moved out) before
        // the view; field order above enforces the drop sequence.
        let view: MappedView<'static> =
            unsafe { std::mem::transmute(mapping.map_fixed(base)?) };
        Ok(CodeArena {
            view,
            _mapping: mapping,
            commit_mark: AtomicUsize::new(0),
        })
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.view.base()
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.view.base().as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.view.len()
    }

    pub(crate) fn commit_mark(&self) -> usize {
        self.commit_mark.load(Ordering::Acquire)
    }

    /// Ensures at least `high_mark` bytes are committed, advancing the mark
    /// in [`COMMIT_CHUNK_SIZE`] steps.
    ///
    /// Multiple threads race here after reserving ranges above the mark; the
    /// commit call is made before the CAS so a winner's pages are live by
    /// the time the new mark is observable, and a loser's redundant commit
    /// is harmless.
    pub(crate) fn ensure_committed(&self, high_mark: usize) -> Result<(), VmemError> {
        debug_assert!(high_mark <= self.view.len());
        let mut mark = self.commit_mark.load(Ordering::Acquire);
        while high_mark > mark {
            let new_mark = mark
                .saturating_add(COMMIT_CHUNK_SIZE)
                .min(self.view.len());
            self.view.commit(0, new_mark, Protect::RWX)?;
            match self
                .commit_mark
                .compare_exchange_weak(mark, new_mark, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => mark = new_mark,
                // Another thread advanced (or the exchange failed
                // spuriously); either way re-read and keep going until the
                // mark covers us.
                Err(observed) => mark = observed,
            }
        }
        Ok(())
    }

    /// Copies `bytes` into the arena at `offset`.
    ///
    /// The caller must hold the exclusive reservation of
    /// `[offset, offset + bytes.len())` and have committed through its end.
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) {
        let end = offset.checked_add(bytes.len()).expect("arena write overflows");
        assert!(end <= self.view.len(), "arena write out of bounds");
        debug_assert!(end <= self.commit_mark());
        // Safety: range is in bounds, committed, and exclusively reserved by
        // the caller; `bytes` cannot alias the arena (it is a safe slice).
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.view.base().as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Fills `[offset, offset + len)` with `byte`; same contract as
    /// [`write`](Self::write).
    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) {
        let end = offset.checked_add(len).expect("arena fill overflows");
        assert!(end <= self.view.len(), "arena fill out of bounds");
        debug_assert!(end <= self.commit_mark());
        // Safety: as in `write`.
        unsafe {
            std::ptr::write_bytes(self.view.base().as_ptr().add(offset), byte, len);
        }
    }
}
