//! Publish-after-write: a reader polling an indirection slot must never
//! observe a host address whose code bytes are not fully written yet.
//!
//! The writer places functions whose bodies are filled with a per-function
//! canary byte; the reader spins on each slot and, the moment it sees a
//! non-sentinel value, dereferences the published address and checks every
//! canary byte. The `Release` publish / `Acquire` poll pair is what makes
//! this race-free.

use std::thread;
use std::time::{Duration, Instant};

use strato_jit_x64::{CodeCache, CodeCacheOptions};

const FUNCTIONS: u32 = 512;
const CODE_LEN: usize = 48;
const SENTINEL: u32 = 0;

fn options() -> CodeCacheOptions {
    CodeCacheOptions {
        indirection_table_base: 0x3000_0000,
        indirection_table_size: 0x0010_0000,
        generated_code_base: 0x3100_0000,
        generated_code_size: 0x0100_0000,
        max_function_count: FUNCTIONS as usize,
    }
}

fn guest_address(index: u32) -> u32 {
    0x3000_0000 + 0x40 + index * 4
}

fn canary(index: u32) -> u8 {
    (index as u8) ^ 0xA5
}

#[test]
fn reader_never_observes_partially_written_code() {
    let cache = CodeCache::new(options()).unwrap();
    cache.set_indirection_default(SENTINEL);
    cache
        .commit_executable_range(0x3000_0000, 0x3000_0000 + 0x1000)
        .unwrap();

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for index in 0..FUNCTIONS {
                let code = vec![canary(index); CODE_LEN];
                cache.place_code(guest_address(index), &code, 0).unwrap();
            }
        });

        let reader = scope.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(30);
            for index in 0..FUNCTIONS {
                let host = loop {
                    match cache.indirection_entry(guest_address(index)) {
                        Some(SENTINEL) | None => {
                            assert!(
                                Instant::now() < deadline,
                                "function {index} was never published"
                            );
                            std::hint::spin_loop();
                        }
                        Some(host) => break host,
                    }
                };
                // Safety: the slot was published after the code copy
                // completed, and placed code is never moved or rewritten.
                let code =
                    unsafe { std::slice::from_raw_parts(host as usize as *const u8, CODE_LEN) };
                for (byte_index, &byte) in code.iter().enumerate() {
                    assert_eq!(
                        byte,
                        canary(index),
                        "function {index} byte {byte_index} visible before its write"
                    );
                }
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    });

    assert_eq!(cache.function_count(), FUNCTIONS);
}
