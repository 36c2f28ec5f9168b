//! Win64 growable-function-table registration.
//!
//! `RtlAddGrowableFunctionTable` / `RtlGrowFunctionTable` /
//! `RtlDeleteGrowableFunctionTable` only exist on Windows 8+, and only as
//! `ntdll` exports, so they are resolved at runtime. When they are missing
//! the table is exposed through `RtlInstallFunctionTableCallback` instead,
//! with lookups answered from [`UnwindTable`] directly.

use std::io;
use std::sync::Arc;

use winapi::shared::basetsd::{DWORD64, ULONG_PTR};
use winapi::shared::minwindef::DWORD;
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::winnt::{
    RtlDeleteFunctionTable, RtlInstallFunctionTableCallback, PRUNTIME_FUNCTION, PVOID,
};

use crate::unwind::UnwindTable;

use super::UnwindBackend;

type FnRtlAddGrowableFunctionTable = unsafe extern "system" fn(
    dynamic_table: *mut PVOID,
    function_table: PRUNTIME_FUNCTION,
    entry_count: DWORD,
    maximum_entry_count: DWORD,
    range_base: ULONG_PTR,
    range_end: ULONG_PTR,
) -> DWORD;
type FnRtlGrowFunctionTable =
    unsafe extern "system" fn(dynamic_table: PVOID, new_entry_count: DWORD);
type FnRtlDeleteGrowableFunctionTable = unsafe extern "system" fn(dynamic_table: PVOID);

struct CallbackContext {
    table: Arc<UnwindTable>,
    arena_base: u64,
    arena_len: u64,
}

unsafe extern "system" fn lookup_callback(control_pc: DWORD64, context: PVOID) -> PRUNTIME_FUNCTION {
    let ctx = &*(context as *const CallbackContext);
    if control_pc < ctx.arena_base || control_pc - ctx.arena_base >= ctx.arena_len {
        return std::ptr::null_mut();
    }
    let offset = (control_pc - ctx.arena_base) as u32;
    match ctx.table.lookup_index(offset) {
        Some(index) => ctx.table.entries_ptr().add(index) as PRUNTIME_FUNCTION,
        None => std::ptr::null_mut(),
    }
}

#[derive(Debug)]
enum Registration {
    None,
    Growable {
        handle: PVOID,
        grow: FnRtlGrowFunctionTable,
        delete: FnRtlDeleteGrowableFunctionTable,
    },
    Callback {
        table_id: DWORD64,
        context: *mut CallbackContext,
    },
}

/// Exposes the unwind table through the Windows dynamic function table APIs
/// so SEH and debuggers can unwind JIT frames.
#[derive(Debug)]
pub struct Win64Backend {
    registration: Registration,
    // Keeps the table (and so the array the OS points into) alive for as
    // long as the registration exists.
    _table: Option<Arc<UnwindTable>>,
}

// Safety: the raw handle/context are only passed to thread-safe ntdll calls;
// the context itself is immutable after registration.
unsafe impl Send for Win64Backend {}
unsafe impl Sync for Win64Backend {}

impl Win64Backend {
    pub fn new() -> Win64Backend {
        Win64Backend {
            registration: Registration::None,
            _table: None,
        }
    }

    fn resolve_growable_fns() -> Option<(
        FnRtlAddGrowableFunctionTable,
        FnRtlGrowFunctionTable,
        FnRtlDeleteGrowableFunctionTable,
    )> {
        let ntdll: Vec<u16> = "ntdll.dll\0".encode_utf16().collect();
        // Safety: well-formed module/symbol names; ntdll is always loaded.
        unsafe {
            let module = GetModuleHandleW(ntdll.as_ptr());
            if module.is_null() {
                return None;
            }
            let add = GetProcAddress(module, c"RtlAddGrowableFunctionTable".as_ptr());
            let grow = GetProcAddress(module, c"RtlGrowFunctionTable".as_ptr());
            let delete = GetProcAddress(module, c"RtlDeleteGrowableFunctionTable".as_ptr());
            if add.is_null() || grow.is_null() || delete.is_null() {
                return None;
            }
            Some((
                std::mem::transmute::<_, FnRtlAddGrowableFunctionTable>(add),
                std::mem::transmute::<_, FnRtlGrowFunctionTable>(grow),
                std::mem::transmute::<_, FnRtlDeleteGrowableFunctionTable>(delete),
            ))
        }
    }
}

impl Default for Win64Backend {
    fn default() -> Win64Backend {
        Win64Backend::new()
    }
}

impl UnwindBackend for Win64Backend {
    fn register(
        &mut self,
        table: Arc<UnwindTable>,
        arena_base: usize,
        arena_len: usize,
    ) -> io::Result<()> {
        assert!(matches!(self.registration, Registration::None));

        if let Some((add, grow, delete)) = Self::resolve_growable_fns() {
            let mut handle: PVOID = std::ptr::null_mut();
            // Safety: the entries array is fixed-capacity and never moves;
            // the registration is deleted before the table drops.
            let status = unsafe {
                add(
                    &mut handle,
                    table.entries_ptr() as PRUNTIME_FUNCTION,
                    table.published(),
                    table.capacity() as DWORD,
                    arena_base as ULONG_PTR,
                    (arena_base + arena_len) as ULONG_PTR,
                )
            };
            if status != 0 {
                return Err(io::Error::other(format!(
                    "RtlAddGrowableFunctionTable failed with status {status:#x}"
                )));
            }
            self.registration = Registration::Growable { handle, grow, delete };
            self._table = Some(table);
            return Ok(());
        }

        // Pre-growable-table systems: install a lookup callback the
        // dispatcher and debugger consult on demand. The low-bits tag on the
        // identifier is required by the API contract.
        let table_id = arena_base as DWORD64 | 0x3;
        let context = Box::into_raw(Box::new(CallbackContext {
            table: Arc::clone(&table),
            arena_base: arena_base as u64,
            arena_len: arena_len as u64,
        }));
        // Safety: callback/context stay valid until the matching
        // RtlDeleteFunctionTable in Drop.
        let installed = unsafe {
            RtlInstallFunctionTableCallback(
                table_id,
                arena_base as DWORD64,
                arena_len as DWORD,
                Some(lookup_callback),
                context as PVOID,
                std::ptr::null(),
            )
        };
        if installed == 0 {
            // Safety: never handed to the OS.
            drop(unsafe { Box::from_raw(context) });
            return Err(io::Error::other("RtlInstallFunctionTableCallback failed"));
        }
        self.registration = Registration::Callback { table_id, context };
        self._table = Some(table);
        Ok(())
    }

    fn grow(&self, count: u32) {
        if let Registration::Growable { handle, grow, .. } = self.registration {
            // Safety: handle came from a successful registration that is
            // still live.
            unsafe { grow(handle, count) };
        }
        // Callback mode needs no notification: lookups read the table
        // directly.
    }
}

impl Drop for Win64Backend {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.registration, Registration::None) {
            Registration::None => {}
            Registration::Growable { handle, delete, .. } => {
                // Safety: unregisters before the table/arena drop.
                unsafe { delete(handle) };
            }
            Registration::Callback { table_id, context } => {
                // Safety: matches the install above; after deletion the OS
                // no longer calls into the context, so it can be freed.
                unsafe {
                    RtlDeleteFunctionTable(table_id as PRUNTIME_FUNCTION);
                    drop(Box::from_raw(context));
                }
            }
        }
    }
}
