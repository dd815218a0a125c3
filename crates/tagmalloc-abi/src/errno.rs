//! Thread-local error numbers.
//!
//! The allocator entry points report overflow and exhaustion through the
//! classical `errno` protocol; each thread owns its slot.

use std::cell::Cell;

/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Invalid argument.
pub const EINVAL: i32 = 22;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Reads the calling thread's errno value.
pub fn get_errno() -> i32 {
    ERRNO.with(Cell::get)
}

/// Sets the calling thread's errno value.
pub fn set_errno(value: i32) {
    ERRNO.with(|e| e.set(value));
}
