//! Unix backend: `mmap`/`mprotect`/`munmap`, with `memfd`/`shm` providing the
//! shareable arena object.

use std::io;
use std::ptr::NonNull;

use crate::Protect;

pub(crate) fn query_page_size() -> usize {
    // Safety: sysconf has no memory-safety preconditions.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        // sysconf only fails for unknown names; fall back to the common case.
        return 4096;
    }
    value as usize
}

fn prot_bits(protect: Protect) -> libc::c_int {
    let mut prot = 0;
    if protect.contains(Protect::READ) {
        prot |= libc::PROT_READ;
    }
    if protect.contains(Protect::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protect.contains(Protect::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Maps at `addr` with `flags`, failing (and unmapping) if the kernel placed
/// the mapping anywhere else.
///
/// `MAP_FIXED_NOREPLACE` makes occupied ranges fail outright on Linux; the
/// address check below also covers kernels that silently ignore the flag and
/// fall back to hint behavior, and non-Linux systems where only the hint
/// exists. Plain `MAP_FIXED` is never used: it would clobber whatever is
/// already mapped there.
fn mmap_exact(
    addr: usize,
    len: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
) -> io::Result<NonNull<u8>> {
    #[cfg(target_os = "linux")]
    let flags = flags | libc::MAP_FIXED_NOREPLACE;

    // Safety: we pass a length we own no aliasing claims about; mmap validates
    // the rest.
    let ptr = unsafe { libc::mmap(addr as *mut libc::c_void, len, prot, flags, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    if ptr as usize != addr {
        // The kernel treated the address as a hint; give the mapping back.
        unsafe { libc::munmap(ptr, len) };
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    // mmap never returns null for a non-zero hint on success.
    Ok(NonNull::new(ptr as *mut u8).expect("mmap returned null"))
}

pub(crate) fn reserve_fixed(addr: usize, len: usize) -> io::Result<NonNull<u8>> {
    mmap_exact(
        addr,
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
    )
}

pub(crate) fn commit_anonymous(addr: usize, len: usize, protect: Protect) -> io::Result<()> {
    // Safety: `addr`/`len` lie within a reservation owned by the caller.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot_bits(protect)) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
/// `ptr`/`len` must describe a mapping owned by the caller.
pub(crate) unsafe fn release(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut libc::c_void, len);
}

#[derive(Debug)]
pub(crate) struct MappingHandle {
    fd: libc::c_int,
}

#[cfg(target_os = "linux")]
pub(crate) fn create_mapping(len: usize) -> io::Result<MappingHandle> {
    // Safety: name is a valid NUL-terminated string.
    let fd = unsafe {
        libc::memfd_create(
            b"strato-code-cache\0".as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut handle = MappingHandle { fd };
    // Safety: fd is a freshly created memfd we own.
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        let err = io::Error::last_os_error();
        close_mapping(&mut handle);
        return Err(err);
    }
    Ok(handle)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn create_mapping(len: usize) -> io::Result<MappingHandle> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    // Safety: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let serial = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = CString::new(format!("/strato-code-cache-{pid}-{serial}"))
        .expect("shm name contains no NUL");

    // Safety: name is a valid NUL-terminated string.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut handle = MappingHandle { fd };
    // The name only exists so shm_open can mint the object; unlink it right
    // away and keep the object alive through the descriptor.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    // Safety: fd is a freshly created shm object we own.
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        let err = io::Error::last_os_error();
        close_mapping(&mut handle);
        return Err(err);
    }
    Ok(handle)
}

pub(crate) fn map_view_fixed(
    handle: &MappingHandle,
    addr: usize,
    len: usize,
) -> io::Result<NonNull<u8>> {
    mmap_exact(
        addr,
        len,
        libc::PROT_NONE,
        libc::MAP_SHARED | libc::MAP_NORESERVE,
        handle.fd,
    )
}

pub(crate) fn commit_view(
    _handle: &MappingHandle,
    addr: usize,
    len: usize,
    protect: Protect,
) -> io::Result<()> {
    commit_anonymous(addr, len, protect)
}

/// # Safety
/// `ptr`/`len` must describe a view owned by the caller.
pub(crate) unsafe fn unmap_view(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut libc::c_void, len);
}

pub(crate) fn close_mapping(handle: &mut MappingHandle) {
    // Safety: the handle owns its descriptor; close once on drop.
    unsafe { libc::close(handle.fd) };
    handle.fd = -1;
}

pub(crate) fn flush_instruction_cache(_ptr: *const u8, _len: usize) {
    // x86-64 instruction fetch is coherent with data writes; nothing to do.
}
