//! Layout checks for the structures the OS consumes by address.

use memoffset::offset_of;

use strato_jit_x64::unwind::{RuntimeFunction, UNWIND_INFO_SIZE, UNWIND_RESERVATION_SIZE};

#[test]
fn runtime_function_matches_win64_layout() {
    // RUNTIME_FUNCTION is three packed DWORDs; the OS indexes the table by
    // multiples of 12 bytes.
    assert_eq!(std::mem::size_of::<RuntimeFunction>(), 12);
    assert_eq!(std::mem::align_of::<RuntimeFunction>(), 4);
    assert_eq!(offset_of!(RuntimeFunction, begin_address), 0);
    assert_eq!(offset_of!(RuntimeFunction, end_address), 4);
    assert_eq!(offset_of!(RuntimeFunction, unwind_data), 8);
}

#[test]
fn unwind_block_fits_its_reservation() {
    assert_eq!(UNWIND_INFO_SIZE, 16);
    assert!(UNWIND_INFO_SIZE <= UNWIND_RESERVATION_SIZE);
    assert_eq!(UNWIND_RESERVATION_SIZE % 16, 0);
}
