//! Windows backend: `VirtualAlloc`/`VirtualFree` for anonymous reservations
//! and a `SEC_RESERVE` pagefile section for the shareable arena object.

use std::io;
use std::ptr::{self, NonNull};

use winapi::shared::minwindef::DWORD;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
    FILE_MAP_ALL_ACCESS, FILE_MAP_EXECUTE,
};
use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{
    HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, SEC_RESERVE,
};

use crate::Protect;

pub(crate) fn query_page_size() -> usize {
    let mut info = unsafe { std::mem::zeroed() };
    // Safety: GetSystemInfo fills the provided struct.
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

fn page_bits(protect: Protect) -> DWORD {
    match (
        protect.contains(Protect::READ),
        protect.contains(Protect::WRITE),
        protect.contains(Protect::EXECUTE),
    ) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (_, true, false) => PAGE_READWRITE,
        (true, false, false) => PAGE_READONLY,
        (false, false, _) => PAGE_NOACCESS,
    }
}

pub(crate) fn reserve_fixed(addr: usize, len: usize) -> io::Result<NonNull<u8>> {
    // Safety: reserving at a caller-chosen address either succeeds there or
    // fails; it never relocates.
    let ptr = unsafe {
        VirtualAlloc(
            addr as *mut winapi::ctypes::c_void,
            len,
            MEM_RESERVE,
            PAGE_NOACCESS,
        )
    };
    NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
}

pub(crate) fn commit_anonymous(addr: usize, len: usize, protect: Protect) -> io::Result<()> {
    // Safety: `addr`/`len` lie within a reservation owned by the caller.
    let ptr = unsafe {
        VirtualAlloc(
            addr as *mut winapi::ctypes::c_void,
            len,
            MEM_COMMIT,
            page_bits(protect),
        )
    };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
/// `ptr` must be the base of a reservation owned by the caller.
pub(crate) unsafe fn release(ptr: *mut u8, _len: usize) {
    VirtualFree(ptr as *mut winapi::ctypes::c_void, 0, MEM_RELEASE);
}

#[derive(Debug)]
pub(crate) struct MappingHandle {
    handle: HANDLE,
}

pub(crate) fn create_mapping(len: usize) -> io::Result<MappingHandle> {
    // SEC_RESERVE so mapped views start out reserved and are committed on
    // demand, matching the Unix side.
    let handle = unsafe {
        CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null_mut(),
            PAGE_EXECUTE_READWRITE | SEC_RESERVE,
            (len as u64 >> 32) as DWORD,
            (len as u64 & 0xFFFF_FFFF) as DWORD,
            ptr::null(),
        )
    };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(MappingHandle { handle })
}

pub(crate) fn map_view_fixed(
    handle: &MappingHandle,
    addr: usize,
    len: usize,
) -> io::Result<NonNull<u8>> {
    // Safety: mapping at a caller-chosen address either succeeds there or
    // fails; it never relocates.
    let ptr = unsafe {
        MapViewOfFileEx(
            handle.handle,
            FILE_MAP_ALL_ACCESS | FILE_MAP_EXECUTE,
            0,
            0,
            len,
            addr as *mut winapi::ctypes::c_void,
        )
    };
    NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
}

pub(crate) fn commit_view(
    _handle: &MappingHandle,
    addr: usize,
    len: usize,
    protect: Protect,
) -> io::Result<()> {
    // Committing pages of a SEC_RESERVE view goes through VirtualAlloc, same
    // as an anonymous reservation.
    commit_anonymous(addr, len, protect)
}

/// # Safety
/// `ptr` must be the base of a view owned by the caller.
pub(crate) unsafe fn unmap_view(ptr: *mut u8, _len: usize) {
    UnmapViewOfFile(ptr as *const winapi::ctypes::c_void);
}

pub(crate) fn close_mapping(handle: &mut MappingHandle) {
    if !handle.handle.is_null() {
        // Safety: the handle owns its mapping object; close once on drop.
        unsafe { CloseHandle(handle.handle) };
        handle.handle = ptr::null_mut();
    }
}

pub(crate) fn flush_instruction_cache(ptr: *const u8, len: usize) {
    // Not strictly required on x86-64, but convention for JIT writers.
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr as *const winapi::ctypes::c_void, len);
    }
}
