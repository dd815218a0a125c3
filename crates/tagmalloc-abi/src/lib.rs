//! # tagmalloc-abi
//!
//! C ABI surface over `tagmalloc-core`: the classical free-store entry
//! points backed by one process-global context with per-thread handles,
//! plus thread-local `errno` plumbing. Build as `cdylib` to interpose.

pub mod errno;
mod malloc_abi;
