//! Win64 unwind metadata for JIT frames.
//!
//! Two pieces live here: the byte-exact encoding of the `UNWIND_INFO` block
//! each placed function gets, and the fixed-capacity [`UnwindTable`] of
//! [`RuntimeFunction`] entries the OS unwinder (or the manual lookup path)
//! searches.
//!
//! JIT prologues only ever do one thing to the stack: subtract a constant.
//! That keeps the encoding a closed three-way split on `stack_size`:
//! no allocation, a small allocation (`<= 128` bytes, packed into the op
//! info nibble), or a large allocation (size carried as a 16-bit slot
//! count). Frame pointers and nonvolatile spills are deliberately
//! unsupported; the emitter never produces them.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Size in bytes of an encoded unwind-info block.
///
/// 4 header bytes plus up to 6 unwind-code slots of 2 bytes each; the
/// three-way split above never uses more than 2 slots, but the block is
/// sized at the historical fixed reservation so every function's layout is
/// identical.
pub const UNWIND_INFO_SIZE: usize = 16;

/// Bytes reserved in the arena per function for unwind info (16-byte
/// aligned).
pub const UNWIND_RESERVATION_SIZE: usize = 16;

// https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;

const UNWIND_VERSION: u8 = 1;

// Prologue byte lengths of the two stack-allocation encodings the emitter
// uses: `sub rsp, imm8` and `sub rsp, imm32`.
const PROLOG_SIZE_SMALL: u8 = 4;
const PROLOG_SIZE_LARGE: u8 = 7;

/// One OS function-table entry. Field-for-field the Win64
/// `RUNTIME_FUNCTION` layout; all three members are offsets relative to the
/// arena base.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_data: u32,
}

const _: () = {
    assert!(std::mem::size_of::<RuntimeFunction>() == 12);
    assert!(std::mem::align_of::<RuntimeFunction>() == 4);
};

/// Builds the unwind-info block for a function whose prologue allocates
/// `stack_size` bytes.
///
/// `stack_size` must be a multiple of 8 and below 512 KiB (the large
/// encoding carries the size as a 16-bit count of 8-byte slots); violating
/// either is a caller bug in the emitter and asserts.
pub fn encode_unwind_info(stack_size: usize) -> [u8; UNWIND_INFO_SIZE] {
    let mut info = [0u8; UNWIND_INFO_SIZE];

    if stack_size == 0 {
        info[0] = UNWIND_VERSION;
        // SizeOfProlog, CountOfCodes, frame register/offset all zero: the
        // frame has no prologue unwind actions.
    } else if stack_size <= 128 {
        assert!(stack_size % 8 == 0, "stack allocation must be 8-byte aligned");
        info[0] = UNWIND_VERSION;
        info[1] = PROLOG_SIZE_SMALL;
        info[2] = 1; // CountOfCodes
        info[4] = PROLOG_SIZE_SMALL; // CodeOffset: end of the sub instruction
        info[5] = UWOP_ALLOC_SMALL | ((stack_size as u8 / 8 - 1) << 4);
    } else {
        assert!(stack_size % 8 == 0, "stack allocation must be 8-byte aligned");
        assert!(stack_size / 8 < 65536, "stack allocation too large to encode");
        info[0] = UNWIND_VERSION;
        info[1] = PROLOG_SIZE_LARGE;
        info[2] = 2; // CountOfCodes
        info[4] = PROLOG_SIZE_LARGE; // CodeOffset: end of the sub instruction
        info[5] = UWOP_ALLOC_LARGE; // OpInfo 0: size in the next slot
        let slots = (stack_size / 8) as u16;
        info[6..8].copy_from_slice(&slots.to_le_bytes());
    }

    info
}

/// Decoded form of an unwind-info block produced by [`encode_unwind_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedUnwindInfo {
    pub prolog_size: u8,
    pub allocation: StackAllocation,
}

/// The closed allocation shapes [`encode_unwind_info`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAllocation {
    None,
    Small { stack_size: u32 },
    Large { stack_size: u32 },
}

impl StackAllocation {
    pub fn stack_size(self) -> u32 {
        match self {
            StackAllocation::None => 0,
            StackAllocation::Small { stack_size } | StackAllocation::Large { stack_size } => {
                stack_size
            }
        }
    }
}

/// Parses an unwind-info block. Returns `None` for anything outside the
/// encoder's closed shape set (wrong version, frame register in use,
/// unexpected op codes).
pub fn decode_unwind_info(bytes: &[u8]) -> Option<DecodedUnwindInfo> {
    if bytes.len() < UNWIND_INFO_SIZE {
        return None;
    }
    let version = bytes[0] & 0x07;
    let flags = bytes[0] >> 3;
    if version != UNWIND_VERSION || flags != 0 || bytes[3] != 0 {
        return None;
    }
    let prolog_size = bytes[1];
    let count = bytes[2];

    let allocation = match count {
        0 => StackAllocation::None,
        1 => {
            let op = bytes[5] & 0x0F;
            let op_info = bytes[5] >> 4;
            if op != UWOP_ALLOC_SMALL || bytes[4] != prolog_size {
                return None;
            }
            StackAllocation::Small {
                stack_size: (u32::from(op_info) + 1) * 8,
            }
        }
        2 => {
            let op = bytes[5] & 0x0F;
            let op_info = bytes[5] >> 4;
            if op != UWOP_ALLOC_LARGE || op_info != 0 || bytes[4] != prolog_size {
                return None;
            }
            let slots = u16::from_le_bytes([bytes[6], bytes[7]]);
            StackAllocation::Large {
                stack_size: u32::from(slots) * 8,
            }
        }
        _ => return None,
    };

    Some(DecodedUnwindInfo {
        prolog_size,
        allocation,
    })
}

/// Fixed-capacity table of [`RuntimeFunction`] entries sorted by
/// `begin_address`.
///
/// The backing array is allocated once and never moves: a hard requirement
/// of OS function-table registration, and the reason running out of slots is
/// fatal instead of triggering a grow.
///
/// Slots are assigned in strictly increasing order by the allocator (so the
/// table stays sorted for free), but workers finish writing their entries in
/// arbitrary order. The published count therefore only ever advances over
/// the longest contiguous fully-written prefix; growth notifications are
/// delivered from inside the (short) publish lock so their counts are
/// monotonic.
#[derive(Debug)]
pub struct UnwindTable {
    entries: Box<[UnwindSlot]>,
    /// Entries `[0, published)` are fully written and visible to lookups.
    published: AtomicU32,
    pending: Mutex<Vec<u32>>,
}

#[derive(Debug)]
struct UnwindSlot(UnsafeCell<RuntimeFunction>);

// Safety: a slot is written exactly once, by the single worker that was
// handed its index, before the published count covers it; afterwards it is
// read-only.
unsafe impl Sync for UnwindSlot {}

impl UnwindTable {
    pub fn with_capacity(capacity: usize) -> UnwindTable {
        assert!(capacity > 0, "unwind table capacity must be non-zero");
        assert!(capacity <= u32::MAX as usize);
        let entries = (0..capacity)
            .map(|_| {
                UnwindSlot(UnsafeCell::new(RuntimeFunction {
                    begin_address: 0,
                    end_address: 0,
                    unwind_data: 0,
                }))
            })
            .collect();
        UnwindTable {
            entries,
            published: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries visible to lookups (and to the OS).
    pub fn published(&self) -> u32 {
        self.published.load(Ordering::Acquire)
    }

    /// Base pointer of the backing array, for OS registration. Stable for
    /// the table's lifetime.
    pub fn entries_ptr(&self) -> *const RuntimeFunction {
        self.entries.as_ptr() as *const RuntimeFunction
    }

    /// Reads a published entry by table index.
    pub fn entry(&self, index: u32) -> Option<RuntimeFunction> {
        if index >= self.published.load(Ordering::Acquire) {
            return None;
        }
        // Safety: published entries are fully written and never rewritten.
        Some(unsafe { *(self.entries.as_ptr().add(index as usize) as *const RuntimeFunction) })
    }

    /// Records `entry` at `slot` and advances the published count over the
    /// contiguous written prefix. If the count advanced, `notify_grown` is
    /// called with the new total while the publish lock is held, so
    /// successive notifications carry strictly increasing counts.
    pub(crate) fn publish(&self, slot: u32, entry: RuntimeFunction, notify_grown: impl FnOnce(u32)) {
        let index = slot as usize;
        assert!(index < self.entries.len(), "unwind table slot out of range");

        // Safety: the allocator hands out each slot index exactly once, and
        // the published count cannot cover this slot until we push it below.
        unsafe { *self.entries[index].0.get() = entry };

        let mut pending = self.pending.lock().expect("unwind publish lock poisoned");
        let mut count = self.published.load(Ordering::Relaxed);
        if slot == count {
            count += 1;
            // Absorb previously-finished out-of-order slots.
            while pending.contains(&count) {
                pending.retain(|&s| s != count);
                count += 1;
            }
            self.published.store(count, Ordering::Release);
            notify_grown(count);
        } else {
            pending.push(slot);
        }
    }

    /// Binary-searches the published entries for the one whose
    /// `[begin_address, end_address)` range contains `offset` (an
    /// arena-relative code offset).
    pub fn lookup(&self, offset: u32) -> Option<RuntimeFunction> {
        let index = self.lookup_index(offset)?;
        // Safety: `lookup_index` only returns published (fully written,
        // never rewritten) indices.
        Some(unsafe { *(self.entries.as_ptr().add(index) as *const RuntimeFunction) })
    }

    /// Index form of [`lookup`](Self::lookup), for callers that need a
    /// stable pointer into the backing array (the OS lookup callback).
    pub fn lookup_index(&self, offset: u32) -> Option<usize> {
        let count = self.published.load(Ordering::Acquire) as usize;
        // Safety: entries below `count` were fully written before the
        // Release store that published them, and are never written again.
        let entries: &[RuntimeFunction] = unsafe {
            std::slice::from_raw_parts(self.entries.as_ptr() as *const RuntimeFunction, count)
        };
        let index = entries.partition_point(|entry| entry.end_address <= offset);
        let entry = entries.get(index)?;
        (entry.begin_address <= offset).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encode_zero_stack() {
        let info = encode_unwind_info(0);
        assert_eq!(info[0], 1); // version 1, no flags
        assert_eq!(&info[1..4], &[0, 0, 0]);
        let decoded = decode_unwind_info(&info).unwrap();
        assert_eq!(decoded.prolog_size, 0);
        assert_eq!(decoded.allocation, StackAllocation::None);
    }

    #[test]
    fn encode_small_boundary() {
        for stack_size in [8usize, 64, 128] {
            let info = encode_unwind_info(stack_size);
            let decoded = decode_unwind_info(&info).unwrap();
            assert_eq!(decoded.prolog_size, PROLOG_SIZE_SMALL);
            assert_eq!(
                decoded.allocation,
                StackAllocation::Small {
                    stack_size: stack_size as u32
                }
            );
        }
    }

    #[test]
    fn encode_large_boundary() {
        for stack_size in [136usize, 4096, 524_280] {
            let info = encode_unwind_info(stack_size);
            let decoded = decode_unwind_info(&info).unwrap();
            assert_eq!(decoded.prolog_size, PROLOG_SIZE_LARGE);
            assert_eq!(
                decoded.allocation,
                StackAllocation::Large {
                    stack_size: stack_size as u32
                }
            );
        }
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn encode_rejects_oversized_stack() {
        let _ = encode_unwind_info(65536 * 8);
    }

    proptest! {
        // Every representable stack size survives an encode/decode round
        // trip in the expected shape class.
        #[test]
        fn roundtrip(slots in 0u32..65536) {
            let stack_size = (slots * 8) as usize;
            let info = encode_unwind_info(stack_size);
            let decoded = decode_unwind_info(&info).unwrap();
            prop_assert_eq!(decoded.allocation.stack_size() as usize, stack_size);
            match stack_size {
                0 => prop_assert_eq!(decoded.allocation, StackAllocation::None),
                1..=128 => prop_assert!(matches!(decoded.allocation, StackAllocation::Small { .. }), "expected Small allocation"),
                _ => prop_assert!(matches!(decoded.allocation, StackAllocation::Large { .. }), "expected Large allocation"),
            }
        }
    }

    #[test]
    fn publish_in_order_advances_immediately() {
        let table = UnwindTable::with_capacity(8);
        let entry = |begin: u32| RuntimeFunction {
            begin_address: begin,
            end_address: begin + 16,
            unwind_data: begin + 16,
        };

        let mut notified = Vec::new();
        table.publish(0, entry(0), |count| notified.push(count));
        table.publish(1, entry(32), |count| notified.push(count));
        assert_eq!(notified, vec![1, 2]);
        assert_eq!(table.published(), 2);
    }

    #[test]
    fn publish_out_of_order_holds_back_count() {
        let table = UnwindTable::with_capacity(8);
        let entry = |begin: u32| RuntimeFunction {
            begin_address: begin,
            end_address: begin + 16,
            unwind_data: begin + 16,
        };

        let mut notified = Vec::new();
        table.publish(1, entry(32), |count| notified.push(count));
        assert_eq!(table.published(), 0);
        // Slot 2 also finishes before slot 0.
        table.publish(2, entry(64), |count| notified.push(count));
        assert_eq!(table.published(), 0);
        // Slot 0 lands and releases the whole prefix at once.
        table.publish(0, entry(0), |count| notified.push(count));
        assert_eq!(notified, vec![3]);
        assert_eq!(table.published(), 3);
    }

    #[test]
    fn lookup_hits_exact_ranges() {
        let table = UnwindTable::with_capacity(8);
        table.publish(
            0,
            RuntimeFunction {
                begin_address: 0,
                end_address: 3,
                unwind_data: 16,
            },
            |_| {},
        );
        table.publish(
            1,
            RuntimeFunction {
                begin_address: 32,
                end_address: 40,
                unwind_data: 48,
            },
            |_| {},
        );

        assert_eq!(table.lookup(0).unwrap().end_address, 3);
        assert_eq!(table.lookup(2).unwrap().begin_address, 0);
        // Between functions (inside the unwind block) there is no entry.
        assert_eq!(table.lookup(3), None);
        assert_eq!(table.lookup(16), None);
        assert_eq!(table.lookup(35).unwrap().begin_address, 32);
        assert_eq!(table.lookup(40), None);
    }
}
