//! Doubly-linked bin primitives.
//!
//! Chunks and bin headers share one ring discipline: `fd`/`bk` must close
//! over every neighbor, and large-bin members additionally thread one
//! representative per distinct size through the `fd_nextsize` ring in
//! decreasing size order. Removal verifies both rings and the boundary tag
//! before editing any pointer; a mismatch is fatal.

use crate::chunk::{
    bk, bk_nextsize, chunksize, fd, fd_nextsize, next_chunk, prev_size, set_bk, set_bk_nextsize,
    set_fd, set_fd_nextsize,
};
use crate::fatal::malloc_printerr;
use crate::size_class::in_smallbin_range;
use crate::sys::SystemMemory;

/// Unlinks `p` from whichever doubly-linked bin holds it, maintaining the
/// large-bin skip ring when present.
pub(crate) fn unlink_chunk(mem: &SystemMemory, p: usize) {
    if chunksize(mem, p) != prev_size(mem, next_chunk(mem, p)) {
        malloc_printerr("corrupted size vs. prev_size");
    }

    let forward = fd(mem, p);
    let backward = bk(mem, p);
    if bk(mem, forward) != p || fd(mem, backward) != p {
        malloc_printerr("corrupted double-linked list");
    }

    set_bk(mem, forward, backward);
    set_fd(mem, backward, forward);

    if !in_smallbin_range(chunksize(mem, p)) && fd_nextsize(mem, p) != 0 {
        let next_size = fd_nextsize(mem, p);
        let prev_size_link = bk_nextsize(mem, p);
        if bk_nextsize(mem, next_size) != p || fd_nextsize(mem, prev_size_link) != p {
            malloc_printerr("corrupted double-linked list (not small)");
        }

        if fd_nextsize(mem, forward) == 0 {
            if next_size == p {
                // p was the only distinct size; its successor inherits a
                // self-ring.
                set_fd_nextsize(mem, forward, forward);
                set_bk_nextsize(mem, forward, forward);
            } else {
                set_fd_nextsize(mem, forward, next_size);
                set_bk_nextsize(mem, forward, prev_size_link);
                set_bk_nextsize(mem, next_size, forward);
                set_fd_nextsize(mem, prev_size_link, forward);
            }
        } else {
            set_bk_nextsize(mem, next_size, prev_size_link);
            set_fd_nextsize(mem, prev_size_link, next_size);
        }
    }
}
