//! The generated-code cache.
//!
//! One `CodeCache` is constructed by the JIT backend at startup and shared
//! by reference across compiler worker threads; there is no global instance.
//! See the crate docs for the memory layout and the concurrency rules.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::error;

use strato_vmem::{align_up, page_size, VmemError};

use crate::arena::CodeArena;
use crate::backend::{platform_backend, UnwindBackend};
use crate::indirection::IndirectionTable;
use crate::unwind::{self, RuntimeFunction, UnwindTable, UNWIND_RESERVATION_SIZE};
use crate::{
    CODE_ALIGNMENT, COMMIT_CHUNK_SIZE, GENERATED_CODE_BASE, GENERATED_CODE_SIZE,
    INDIRECTION_TABLE_BASE, INDIRECTION_TABLE_SIZE, MAX_FUNCTION_COUNT,
};

/// Placement parameters for a cache instance.
///
/// The defaults are the production layout; tests construct caches in
/// disjoint windows by overriding the bases. Both windows are guest-visible
/// and must stay below 4 GiB: indirection slots and [`CodeCache::place_data`]
/// return truncated 32-bit addresses, and the validator keeps that
/// truncation lossless.
#[derive(Debug, Clone)]
pub struct CodeCacheOptions {
    pub indirection_table_base: u32,
    pub indirection_table_size: u32,
    pub generated_code_base: u32,
    pub generated_code_size: u32,
    pub max_function_count: usize,
}

impl Default for CodeCacheOptions {
    fn default() -> CodeCacheOptions {
        CodeCacheOptions {
            indirection_table_base: INDIRECTION_TABLE_BASE,
            indirection_table_size: INDIRECTION_TABLE_SIZE,
            generated_code_base: GENERATED_CODE_BASE,
            generated_code_size: GENERATED_CODE_SIZE,
            max_function_count: MAX_FUNCTION_COUNT,
        }
    }
}

impl CodeCacheOptions {
    fn validate(&self) -> Result<(), CodeCacheError> {
        let page = page_size() as u32;
        if self.indirection_table_size == 0 || self.generated_code_size == 0 {
            return Err(CodeCacheError::InvalidOptions("regions must be non-empty"));
        }
        if self.indirection_table_base % page != 0 || self.generated_code_base % page != 0 {
            return Err(CodeCacheError::InvalidOptions(
                "region bases must be page aligned",
            ));
        }
        if self.indirection_table_base as u64 + self.indirection_table_size as u64
            > u32::MAX as u64 + 1
            || self.generated_code_base as u64 + self.generated_code_size as u64
                > u32::MAX as u64 + 1
        {
            return Err(CodeCacheError::InvalidOptions(
                "regions must not extend past 4 GiB",
            ));
        }
        let ind_end = self.indirection_table_base as u64 + self.indirection_table_size as u64;
        let code_end = self.generated_code_base as u64 + self.generated_code_size as u64;
        if (self.indirection_table_base as u64) < code_end
            && (self.generated_code_base as u64) < ind_end
        {
            return Err(CodeCacheError::InvalidOptions(
                "indirection window and code arena overlap",
            ));
        }
        if self.max_function_count == 0 || self.max_function_count > u32::MAX as usize {
            return Err(CodeCacheError::InvalidOptions(
                "max_function_count out of range",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CodeCacheError {
    #[error("invalid code cache options: {0}")]
    InvalidOptions(&'static str),
    /// The indirection window could not be reserved, most commonly because
    /// the fixed range is occupied by another mapping in this process.
    #[error("unable to reserve the indirection table window: {0}")]
    IndirectionReserve(#[source] VmemError),
    /// The arena could not be created or mapped at its fixed base.
    #[error("unable to map the generated code arena: {0}")]
    ArenaMap(#[source] VmemError),
    #[error("unable to register the unwind table with the platform: {0}")]
    BackendRegister(#[source] std::io::Error),
    /// Demand commit of arena or indirection pages failed (host memory
    /// pressure). Fatal: the affected placement did not happen.
    #[error("unable to commit code cache pages: {0}")]
    Commit(#[source] VmemError),
    /// All unwind slots are in use. The table cannot grow (its backing
    /// array address is registered with the OS), so this is fatal.
    #[error("unwind table capacity {capacity} exhausted")]
    UnwindTableFull { capacity: usize },
    /// The bump cursor reached the end of the arena.
    #[error("generated code arena exhausted: {requested:#x} bytes requested, {remaining:#x} free")]
    ArenaExhausted { requested: usize, remaining: usize },
}

#[derive(Debug)]
struct FunctionMapEntry {
    /// Arena-relative code range, matching the unwind entry.
    begin: u32,
    end: u32,
    /// 0 for host-only code (trampolines and the like).
    guest_address: u32,
}

/// State mutated under the allocation mutex: the bump cursor, the next
/// unwind slot, and the (append-sorted) host-PC → guest-function map.
#[derive(Debug)]
struct AllocState {
    offset: usize,
    next_slot: u32,
    function_map: Vec<FunctionMapEntry>,
}

/// Thread-safe cache of JIT-generated machine code and its unwind metadata.
#[derive(Debug)]
pub struct CodeCache {
    options: CodeCacheOptions,
    // Field order is teardown order: the backend unregisters from the OS
    // before the unwind table and the arena it references are torn down.
    backend: Box<dyn UnwindBackend>,
    unwind_table: Arc<UnwindTable>,
    indirection: IndirectionTable,
    arena: CodeArena,
    alloc: Mutex<AllocState>,
}

impl CodeCache {
    /// Creates a cache with the platform's unwind backend.
    pub fn new(options: CodeCacheOptions) -> Result<CodeCache, CodeCacheError> {
        CodeCache::with_backend(options, platform_backend())
    }

    /// Creates a cache with an explicit unwind backend (tests, DWARF-based
    /// registration, ...).
    pub fn with_backend(
        options: CodeCacheOptions,
        mut backend: Box<dyn UnwindBackend>,
    ) -> Result<CodeCache, CodeCacheError> {
        options.validate()?;

        let indirection = IndirectionTable::reserve(
            options.indirection_table_base,
            options.indirection_table_size,
        )
        .map_err(|source| {
            error!(
                "unable to reserve the code cache indirection table at {:#x}..{:#x}; \
                 the range is likely occupied by another mapping",
                options.indirection_table_base,
                options.indirection_table_base as u64 + options.indirection_table_size as u64,
            );
            CodeCacheError::IndirectionReserve(source)
        })?;

        let arena = CodeArena::map_fixed(
            options.generated_code_base as usize,
            options.generated_code_size as usize,
        )
        .map_err(|source| {
            error!(
                "unable to map the generated code arena at {:#x}..{:#x}; the \
                 range is likely occupied by another mapping",
                options.generated_code_base,
                options.generated_code_base as u64 + options.generated_code_size as u64,
            );
            CodeCacheError::ArenaMap(source)
        })?;

        let unwind_table = Arc::new(UnwindTable::with_capacity(options.max_function_count));
        backend
            .register(Arc::clone(&unwind_table), arena.base_addr(), arena.len())
            .map_err(|source| {
                error!("unable to register the unwind function table: {source}");
                CodeCacheError::BackendRegister(source)
            })?;

        // First commit-mark advance happens before any code is placed.
        arena
            .ensure_committed(COMMIT_CHUNK_SIZE.min(arena.len()))
            .map_err(CodeCacheError::Commit)?;

        let alloc = Mutex::new(AllocState {
            offset: 0,
            next_slot: 0,
            function_map: Vec::with_capacity(options.max_function_count),
        });
        Ok(CodeCache {
            options,
            backend,
            unwind_table,
            indirection,
            arena,
            alloc,
        })
    }

    pub fn options(&self) -> &CodeCacheOptions {
        &self.options
    }

    /// Host base address of the generated-code arena.
    pub fn generated_code_base(&self) -> usize {
        self.arena.base_addr()
    }

    /// Bytes handed out by the bump allocator so far.
    pub fn used_bytes(&self) -> usize {
        self.alloc.lock().expect("allocation mutex poisoned").offset
    }

    /// Current high-water mark of committed arena bytes. Non-decreasing.
    pub fn commit_mark(&self) -> usize {
        self.arena.commit_mark()
    }

    /// Number of placed functions visible to unwind lookups.
    pub fn function_count(&self) -> u32 {
        self.unwind_table.published()
    }

    /// The unwind table backing OS registration, for debugger glue and
    /// tests.
    pub fn unwind_table(&self) -> &UnwindTable {
        &self.unwind_table
    }

    /// Sets the sentinel written into indirection slots by
    /// [`commit_executable_range`](Self::commit_executable_range). Readers
    /// finding it must take the slow dispatch path.
    pub fn set_indirection_default(&self, default_value: u32) {
        self.indirection.set_default(default_value);
    }

    /// Commits the indirection slots covering `[guest_low, guest_high)` and
    /// fills them with the current default. Called when a guest code region
    /// becomes nominally executable, before anything in it is compiled.
    pub fn commit_executable_range(
        &self,
        guest_low: u32,
        guest_high: u32,
    ) -> Result<(), CodeCacheError> {
        self.indirection
            .commit_range(guest_low, guest_high)
            .map_err(CodeCacheError::Commit)
    }

    /// Overwrites a single indirection slot, e.g. to repoint an address
    /// after re-JITting or to force it through the slow path.
    pub fn add_indirection(&self, guest_address: u32, host_address: u32) {
        self.indirection.store(guest_address, host_address);
    }

    /// Reads an indirection slot (`None` if its range was never committed).
    pub fn indirection_entry(&self, guest_address: u32) -> Option<u32> {
        self.indirection.load(guest_address)
    }

    /// Places a compiled function.
    ///
    /// Copies `machine_code` into the arena, constructs its unwind info
    /// (`stack_size` is the prologue's stack allocation), publishes the
    /// unwind table entry, and, for a non-zero `guest_address`, publishes
    /// the indirection slot last, so concurrent readers never observe a
    /// pointer to half-written code. Returns the host entry address.
    pub fn place_code(
        &self,
        guest_address: u32,
        machine_code: &[u8],
        stack_size: usize,
    ) -> Result<NonNull<u8>, CodeCacheError> {
        assert!(!machine_code.is_empty(), "machine code must not be empty");
        let code_len = machine_code.len();
        let padded_len = align_up(code_len, CODE_ALIGNMENT);

        // Lock scope: pointer bumps and the per-function slot only. The
        // copies and OS calls below run concurrently on disjoint ranges.
        let (code_offset, unwind_offset, slot, high_mark) = {
            let mut alloc = self.alloc.lock().expect("allocation mutex poisoned");

            if alloc.next_slot as usize >= self.unwind_table.capacity() {
                return Err(CodeCacheError::UnwindTableFull {
                    capacity: self.unwind_table.capacity(),
                });
            }
            let requested = padded_len + UNWIND_RESERVATION_SIZE;
            let remaining = self.arena.len() - alloc.offset;
            if requested > remaining {
                return Err(CodeCacheError::ArenaExhausted { requested, remaining });
            }

            let code_offset = alloc.offset;
            alloc.offset += padded_len;
            let unwind_offset = alloc.offset;
            alloc.offset += UNWIND_RESERVATION_SIZE;

            let slot = alloc.next_slot;
            alloc.next_slot += 1;

            // Appending under the allocation lock keeps the map sorted by
            // begin address, which the binary search in `lookup_function`
            // relies on.
            alloc.function_map.push(FunctionMapEntry {
                begin: code_offset as u32,
                end: (code_offset + code_len) as u32,
                guest_address,
            });

            (code_offset, unwind_offset, slot, alloc.offset)
        };

        self.arena
            .ensure_committed(high_mark)
            .map_err(CodeCacheError::Commit)?;

        self.arena.write(code_offset, machine_code);
        // Pad the tail of the code's 16-byte cell with int3.
        self.arena.fill(code_offset + code_len, padded_len - code_len, 0xCC);
        self.arena
            .write(unwind_offset, &unwind::encode_unwind_info(stack_size));

        let entry = RuntimeFunction {
            begin_address: code_offset as u32,
            end_address: (code_offset + code_len) as u32,
            unwind_data: unwind_offset as u32,
        };
        self.unwind_table
            .publish(slot, entry, |count| self.backend.grow(count));

        let host_address = self.arena.base_addr() + code_offset;
        strato_vmem::flush_instruction_cache(host_address as *const u8, code_len);

        // Publish last: everything the reader will jump into is in place.
        if guest_address != 0 {
            self.indirection.store(guest_address, host_address as u32);
        }

        // Safety: arena base is non-null and code_offset is in bounds.
        Ok(unsafe { NonNull::new_unchecked(host_address as *mut u8) })
    }

    /// Places a raw data blob (exception tables, constant pools) with the
    /// same bump/commit discipline as code, but no unwind entry or
    /// indirection. Returns the guest-visible (32-bit) address of the copy.
    pub fn place_data(&self, data: &[u8]) -> Result<u32, CodeCacheError> {
        assert!(!data.is_empty(), "data must not be empty");
        let padded_len = align_up(data.len(), CODE_ALIGNMENT);

        let (data_offset, high_mark) = {
            let mut alloc = self.alloc.lock().expect("allocation mutex poisoned");
            let remaining = self.arena.len() - alloc.offset;
            if padded_len > remaining {
                return Err(CodeCacheError::ArenaExhausted {
                    requested: padded_len,
                    remaining,
                });
            }
            let data_offset = alloc.offset;
            alloc.offset += padded_len;
            (data_offset, alloc.offset)
        };

        self.arena
            .ensure_committed(high_mark)
            .map_err(CodeCacheError::Commit)?;
        self.arena.write(data_offset, data);

        Ok((self.arena.base_addr() + data_offset) as u32)
    }

    /// Finds the unwind entry whose code range contains `host_pc`. This is
    /// the manual lookup path behind the OS callback registration mode; all
    /// addresses in the returned entry are arena-relative.
    pub fn lookup_unwind_info(&self, host_pc: u64) -> Option<RuntimeFunction> {
        let base = self.arena.base_addr() as u64;
        if host_pc < base || host_pc - base >= self.arena.len() as u64 {
            return None;
        }
        self.unwind_table.lookup((host_pc - base) as u32)
    }

    /// Maps a host PC back to the guest function whose compiled code
    /// contains it. Returns `None` between functions and for host-only code
    /// placed with a zero guest address.
    pub fn lookup_function(&self, host_pc: u64) -> Option<u32> {
        let base = self.arena.base_addr() as u64;
        if host_pc < base || host_pc - base >= self.arena.len() as u64 {
            return None;
        }
        let offset = (host_pc - base) as u32;

        let alloc = self.alloc.lock().expect("allocation mutex poisoned");
        let map = &alloc.function_map;
        let idx = map.partition_point(|entry| entry.begin <= offset).checked_sub(1)?;
        let entry = &map[idx];
        (offset < entry.end && entry.guest_address != 0).then_some(entry.guest_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unit tests share the process with the arena/indirection module tests;
    // all bases here stay inside 0x3000_0000..0x5000_0000 to avoid them.
    fn test_options(index: u32) -> CodeCacheOptions {
        let base = 0x3000_0000 + index * 0x0400_0000;
        CodeCacheOptions {
            indirection_table_base: base,
            indirection_table_size: 0x0010_0000,
            generated_code_base: base + 0x0100_0000,
            generated_code_size: 0x0100_0000,
            max_function_count: 64,
        }
    }

    #[test]
    fn validate_rejects_overlap() {
        let options = CodeCacheOptions {
            indirection_table_base: 0x3000_0000,
            indirection_table_size: 0x0200_0000,
            generated_code_base: 0x3100_0000,
            generated_code_size: 0x0100_0000,
            max_function_count: 4,
        };
        assert!(matches!(
            options.validate(),
            Err(CodeCacheError::InvalidOptions(_))
        ));
    }

    #[test]
    fn validate_rejects_past_4gib() {
        let options = CodeCacheOptions {
            generated_code_base: 0xFFFF_0000,
            generated_code_size: 0x0002_0000,
            ..test_options(0)
        };
        assert!(matches!(
            options.validate(),
            Err(CodeCacheError::InvalidOptions(_))
        ));
    }

    #[test]
    fn place_code_returns_aligned_addresses() {
        let cache = CodeCache::new(test_options(0)).unwrap();
        let a = cache.place_code(0, &[0xC3], 0).unwrap();
        let b = cache.place_code(0, &[0x90; 17], 0).unwrap();
        assert_eq!(a.as_ptr() as usize, cache.generated_code_base());
        assert_eq!((a.as_ptr() as usize) % CODE_ALIGNMENT, 0);
        assert_eq!((b.as_ptr() as usize) % CODE_ALIGNMENT, 0);
        // [0xC3] occupies one 16-byte cell plus its unwind reservation.
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            CODE_ALIGNMENT + UNWIND_RESERVATION_SIZE
        );
    }

    #[test]
    fn unwind_slots_exhaust_with_typed_error() {
        let options = CodeCacheOptions {
            max_function_count: 2,
            ..test_options(1)
        };
        let cache = CodeCache::new(options).unwrap();
        cache.place_code(0, &[0xC3], 0).unwrap();
        cache.place_code(0, &[0xC3], 0).unwrap();
        let err = cache.place_code(0, &[0xC3], 0).unwrap_err();
        assert!(matches!(err, CodeCacheError::UnwindTableFull { capacity: 2 }));
    }

    #[test]
    fn arena_exhausts_with_typed_error() {
        let options = CodeCacheOptions {
            generated_code_size: 0x1000,
            ..test_options(2)
        };
        let cache = CodeCache::new(options).unwrap();
        let err = cache.place_data(&[0u8; 0x2000]).unwrap_err();
        assert!(matches!(err, CodeCacheError::ArenaExhausted { .. }));
    }

    #[test]
    fn place_data_copies_blob() {
        let cache = CodeCache::new(test_options(3)).unwrap();
        let blob = [1u8, 2, 3, 4, 5];
        let addr = cache.place_data(&blob).unwrap();
        assert_eq!(addr as usize, cache.generated_code_base());
        // Safety: the range was just written and nothing else touches it.
        let copied = unsafe { std::slice::from_raw_parts(addr as usize as *const u8, blob.len()) };
        assert_eq!(copied, &blob);
    }

    #[test]
    fn lookup_function_attributes_host_pcs() {
        let cache = CodeCache::new(test_options(4)).unwrap();
        let guest_base = cache.options().indirection_table_base;
        cache.commit_executable_range(guest_base, guest_base + 0x1000).unwrap();

        let f0 = cache.place_code(guest_base + 0x10, &[0x90; 8], 0).unwrap();
        let trampoline = cache.place_code(0, &[0xC3], 0).unwrap();
        let f1 = cache.place_code(guest_base + 0x20, &[0x90; 4], 0).unwrap();

        let f0 = f0.as_ptr() as u64;
        assert_eq!(cache.lookup_function(f0), Some(guest_base + 0x10));
        assert_eq!(cache.lookup_function(f0 + 7), Some(guest_base + 0x10));
        // Inside the unwind block there is no function.
        assert_eq!(cache.lookup_function(f0 + 8), None);
        assert_eq!(cache.lookup_function(trampoline.as_ptr() as u64), None);
        assert_eq!(cache.lookup_function(f1.as_ptr() as u64), Some(guest_base + 0x20));
        assert_eq!(cache.lookup_function(0), None);
    }

    #[test]
    fn function_count_tracks_placements() {
        let cache = CodeCache::new(test_options(5)).unwrap();
        assert_eq!(cache.function_count(), 0);
        cache.place_code(0, &[0xC3], 0).unwrap();
        cache.place_code(0, &[0xC3], 8).unwrap();
        assert_eq!(cache.function_count(), 2);
        // Data placements don't consume unwind slots.
        cache.place_data(&[0u8; 64]).unwrap();
        assert_eq!(cache.function_count(), 2);
    }
}
