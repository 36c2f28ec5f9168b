//! End-to-end scenario on the production address layout: reserve the real
//! windows, place a guest function, and check the host address, unwind
//! entry, encoded unwind bytes, and indirection slot all line up.
//!
//! This file holds the single test that uses the default (fixed) bases, so
//! nothing else in the process can race it for those ranges.

use strato_jit_x64::unwind::{decode_unwind_info, StackAllocation, UNWIND_INFO_SIZE};
use strato_jit_x64::{CodeCache, CodeCacheOptions};

#[test]
fn production_layout_place_and_look_up() {
    let cache = CodeCache::new(CodeCacheOptions::default()).unwrap();
    assert_eq!(cache.generated_code_base(), 0xA000_0000);

    cache.set_indirection_default(0);
    cache
        .commit_executable_range(0x8200_0000, 0x8201_0000)
        .unwrap();

    // nop; nop; ret
    let host = cache.place_code(0x8200_0000, &[0x90, 0x90, 0xC3], 0).unwrap();
    assert_eq!(host.as_ptr() as usize, 0xA000_0000);

    let entry = cache.lookup_unwind_info(host.as_ptr() as u64).unwrap();
    assert_eq!(entry.begin_address, 0);
    assert_eq!(entry.end_address, 3);

    assert_eq!(cache.indirection_entry(0x8200_0000), Some(0xA000_0000));
    assert_eq!(cache.lookup_function(host.as_ptr() as u64 + 2), Some(0x8200_0000));

    // The unwind block sits in the arena right behind the code cell; decode
    // it back out of memory.
    let info_addr = cache.generated_code_base() + entry.unwind_data as usize;
    // Safety: the block was fully written by place_code and is never moved.
    let info = unsafe { std::slice::from_raw_parts(info_addr as *const u8, UNWIND_INFO_SIZE) };
    let decoded = decode_unwind_info(info).unwrap();
    assert_eq!(decoded.allocation, StackAllocation::None);

    // A second function with a large frame lands in the next cell and
    // carries the large-allocation encoding.
    let second = cache.place_code(0x8200_0040, &[0xC3], 4096).unwrap();
    assert_eq!(second.as_ptr() as usize, 0xA000_0020);
    let entry = cache.lookup_unwind_info(second.as_ptr() as u64).unwrap();
    let info_addr = cache.generated_code_base() + entry.unwind_data as usize;
    // Safety: as above.
    let info = unsafe { std::slice::from_raw_parts(info_addr as *const u8, UNWIND_INFO_SIZE) };
    assert_eq!(
        decode_unwind_info(info).unwrap().allocation,
        StackAllocation::Large { stack_size: 4096 }
    );

    // PCs outside any function resolve to nothing.
    assert_eq!(cache.lookup_unwind_info(0xA000_0000 + 3), None);
    assert_eq!(cache.lookup_unwind_info(0x9FFF_FFFF), None);
    assert_eq!(cache.lookup_function(0xA000_0000 + 16), None);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn placed_code_is_executable() {
    let cache = CodeCache::new(CodeCacheOptions {
        indirection_table_base: 0x4000_0000,
        indirection_table_size: 0x0010_0000,
        generated_code_base: 0x4100_0000,
        generated_code_size: 0x0100_0000,
        max_function_count: 16,
    })
    .unwrap();

    // mov eax, 0x2A; ret
    let host = cache
        .place_code(0, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3], 0)
        .unwrap();

    // Safety: the bytes above are a complete, valid function for the host
    // ABI (no arguments, result in eax), and the arena is mapped executable.
    let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(host.as_ptr()) };
    assert_eq!(f(), 0x2A);
}
