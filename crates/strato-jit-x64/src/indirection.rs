//! Guest-address → host-code indirection table.
//!
//! A reserved window with one `u32` slot per 4-byte-aligned guest address,
//! mapped so the slot for guest address `g` lives at host address
//! `table_base + (g - guest_base)`. With the table reserved at
//! `guest_base` itself, generated code resolves a dynamic call target with
//! a single load from the guest address value.
//!
//! A slot holds either the current default sentinel ("not compiled, take
//! the slow dispatch path") or the truncated host entry address of the
//! compiled function. Publishes use `Release` stores and consumers
//! `Acquire` loads; a reader that races a publish simply sees the sentinel
//! and falls back, which is always correct.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use strato_vmem::{Reservation, VmemError};

#[derive(Debug)]
pub(crate) struct IndirectionTable {
    reservation: Reservation,
    guest_base: u32,
    window_len: u32,
    default_value: AtomicU32,
    /// Guest ranges committed so far, sorted and coalesced. Publishes into
    /// never-committed ranges are dropped (the reader then takes the slow
    /// path) instead of faulting on reserved-only pages.
    committed: Mutex<Vec<(u32, u32)>>,
}

impl IndirectionTable {
    /// Reserves the window at the host address numerically equal to
    /// `guest_base`.
    pub(crate) fn reserve(guest_base: u32, window_len: u32) -> Result<IndirectionTable, VmemError> {
        let reservation = Reservation::at_fixed(guest_base as usize, window_len as usize)?;
        Ok(IndirectionTable {
            reservation,
            guest_base,
            window_len,
            default_value: AtomicU32::new(0),
            committed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_default(&self, value: u32) {
        self.default_value.store(value, Ordering::Relaxed);
    }

    pub(crate) fn default_value(&self) -> u32 {
        self.default_value.load(Ordering::Relaxed)
    }

    fn contains(&self, guest_address: u32) -> bool {
        guest_address >= self.guest_base
            && (guest_address - self.guest_base) < self.window_len
    }

    fn slot(&self, guest_address: u32) -> &AtomicU32 {
        assert!(
            self.contains(guest_address),
            "guest address {guest_address:#x} outside the indirection window"
        );
        assert!(guest_address % 4 == 0, "guest addresses are 4-byte aligned");
        let offset = (guest_address - self.guest_base) as usize;
        // Safety: in-bounds, 4-aligned, and the slot is only reached through
        // this accessor after its page was committed.
        unsafe { &*(self.reservation.base().as_ptr().add(offset) as *const AtomicU32) }
    }

    fn is_committed(&self, guest_address: u32) -> bool {
        let ranges = self.committed.lock().expect("indirection range lock poisoned");
        ranges
            .iter()
            .any(|&(lo, hi)| guest_address >= lo && guest_address < hi)
    }

    /// Commits the slots covering `[guest_low, guest_high)` and fills them
    /// with the current default sentinel.
    pub(crate) fn commit_range(&self, guest_low: u32, guest_high: u32) -> Result<(), VmemError> {
        assert!(guest_low <= guest_high, "inverted guest range");
        if guest_low == guest_high {
            return Ok(());
        }
        assert!(
            self.contains(guest_low) && self.contains(guest_high - 1),
            "guest range {guest_low:#x}..{guest_high:#x} outside the indirection window"
        );
        assert!(guest_low % 4 == 0, "guest addresses are 4-byte aligned");

        let offset = (guest_low - self.guest_base) as usize;
        let len = (guest_high - guest_low) as usize;
        self.reservation
            .commit(offset, len, strato_vmem::Protect::RW)?;

        let default = self.default_value();
        for guest_address in (guest_low..guest_high).step_by(4) {
            self.slot(guest_address).store(default, Ordering::Relaxed);
        }

        let mut ranges = self.committed.lock().expect("indirection range lock poisoned");
        ranges.push((guest_low, guest_high));
        ranges.sort_unstable();
        // Coalesce overlapping/adjacent ranges so the scan stays short.
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for &(lo, hi) in ranges.iter() {
            match merged.last_mut() {
                Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        *ranges = merged;
        Ok(())
    }

    /// Publishes `host_address` for `guest_address` (`Release`, so a reader
    /// that observes it also observes everything written before the call).
    ///
    /// Publishes outside any committed range are dropped: the corresponding
    /// guest code region was never made executable, and a missing entry only
    /// costs the reader the slow path.
    pub(crate) fn store(&self, guest_address: u32, host_address: u32) {
        if !self.is_committed(guest_address) {
            tracing::warn!(
                guest_address,
                "indirection publish into uncommitted range dropped"
            );
            return;
        }
        self.slot(guest_address).store(host_address, Ordering::Release);
    }

    /// Reads the current slot value, or `None` if the range was never
    /// committed.
    pub(crate) fn load(&self, guest_address: u32) -> Option<u32> {
        if !self.contains(guest_address) || !self.is_committed(guest_address) {
            return None;
        }
        Some(self.slot(guest_address).load(Ordering::Acquire))
    }
}
