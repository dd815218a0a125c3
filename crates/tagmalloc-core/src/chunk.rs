//! Chunk layout and boundary-tag primitives.
//!
//! Every chunk starts with two header words: `prev_size` (meaningful only
//! when the physically previous chunk is free) and `size | flags`. The low
//! three bits of the size word carry P (previous chunk in use), M (chunk
//! was individually page-mapped), and A (chunk belongs to a non-primary
//! arena). A free chunk overlays its payload with `fd`/`bk` ring links and,
//! for large chunks, the `fd_nextsize`/`bk_nextsize` skip pair, and writes
//! its size into the successor's `prev_size` slot as the boundary tag.
//!
//! All accessors address memory through [`SystemMemory`] words; a chunk is
//! just its address.

use crate::sys::SystemMemory;

/// Size of the size/pointer word. 64-bit layout only.
pub const SIZE_SZ: usize = std::mem::size_of::<usize>();

/// Alignment of returned user pointers.
pub const MALLOC_ALIGNMENT: usize = 2 * SIZE_SZ;

/// Low-bit mask for [`MALLOC_ALIGNMENT`].
pub const MALLOC_ALIGN_MASK: usize = MALLOC_ALIGNMENT - 1;

/// Smallest chunk layout: header plus the two free-list links.
pub const MIN_CHUNK_SIZE: usize = 4 * SIZE_SZ;

/// Smallest allocatable chunk size after alignment rounding.
pub const MINSIZE: usize = (MIN_CHUNK_SIZE + MALLOC_ALIGN_MASK) & !MALLOC_ALIGN_MASK;

/// Previous chunk is in use.
pub const PREV_INUSE: usize = 0x1;
/// Chunk was obtained with an individual page mapping.
pub const IS_MMAPPED: usize = 0x2;
/// Chunk belongs to a non-primary arena.
pub const NON_MAIN_ARENA: usize = 0x4;
/// All flag bits of the size word.
pub const SIZE_BITS: usize = PREV_INUSE | IS_MMAPPED | NON_MAIN_ARENA;

const OFF_SIZE: usize = SIZE_SZ;
const OFF_FD: usize = 2 * SIZE_SZ;
const OFF_BK: usize = 3 * SIZE_SZ;
const OFF_FD_NEXTSIZE: usize = 4 * SIZE_SZ;
const OFF_BK_NEXTSIZE: usize = 5 * SIZE_SZ;

/// Converts a chunk address to the user pointer one header past it.
#[inline]
pub fn chunk2mem(p: usize) -> usize {
    p + 2 * SIZE_SZ
}

/// Converts a user pointer back to its chunk address.
#[inline]
pub fn mem2chunk(mem: usize) -> usize {
    mem - 2 * SIZE_SZ
}

/// Pads a request up to a usable chunk size without overflow checking.
#[inline]
pub const fn request2size(req: usize) -> usize {
    if req + SIZE_SZ + MALLOC_ALIGN_MASK < MINSIZE {
        MINSIZE
    } else {
        (req + SIZE_SZ + MALLOC_ALIGN_MASK) & !MALLOC_ALIGN_MASK
    }
}

/// Checked request padding. Fails once the padded value could exceed the
/// signed pointer-difference ceiling, guarding size wrap-arounds.
#[inline]
pub const fn checked_request2size(req: usize) -> Option<usize> {
    if req > isize::MAX as usize - MINSIZE {
        return None;
    }
    Some(request2size(req))
}

/// Whether a chunk address violates the alignment quantum.
#[inline]
pub fn misaligned_chunk(p: usize) -> bool {
    p & MALLOC_ALIGN_MASK != 0
}

#[inline]
pub fn prev_size(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p)
}

#[inline]
pub fn set_prev_size(mem: &SystemMemory, p: usize, size: usize) {
    mem.write(p, size);
}

#[inline]
pub fn chunksize_nomask(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p + OFF_SIZE)
}

#[inline]
pub fn chunksize(mem: &SystemMemory, p: usize) -> usize {
    chunksize_nomask(mem, p) & !SIZE_BITS
}

/// Overwrites size and flags in one store.
#[inline]
pub fn set_head(mem: &SystemMemory, p: usize, size_and_flags: usize) {
    mem.write(p + OFF_SIZE, size_and_flags);
}

/// Replaces the size while preserving the current flag bits.
#[inline]
pub fn set_head_size(mem: &SystemMemory, p: usize, size: usize) {
    let flags = chunksize_nomask(mem, p) & SIZE_BITS;
    mem.write(p + OFF_SIZE, size | flags);
}

/// Writes the boundary tag: this chunk's size into the successor's
/// `prev_size` slot.
#[inline]
pub fn set_foot(mem: &SystemMemory, p: usize, size: usize) {
    mem.write(p + size, size);
}

#[inline]
pub fn prev_inuse(mem: &SystemMemory, p: usize) -> bool {
    chunksize_nomask(mem, p) & PREV_INUSE != 0
}

#[inline]
pub fn chunk_is_mmapped(mem: &SystemMemory, p: usize) -> bool {
    chunksize_nomask(mem, p) & IS_MMAPPED != 0
}

#[inline]
pub fn chunk_non_main_arena(mem: &SystemMemory, p: usize) -> bool {
    chunksize_nomask(mem, p) & NON_MAIN_ARENA != 0
}

#[inline]
pub fn set_non_main_arena(mem: &SystemMemory, p: usize) {
    let v = chunksize_nomask(mem, p);
    mem.write(p + OFF_SIZE, v | NON_MAIN_ARENA);
}

#[inline]
pub fn next_chunk(mem: &SystemMemory, p: usize) -> usize {
    p + chunksize(mem, p)
}

#[inline]
pub fn prev_chunk(mem: &SystemMemory, p: usize) -> usize {
    p - prev_size(mem, p)
}

#[inline]
pub fn chunk_at_offset(p: usize, offset: usize) -> usize {
    p + offset
}

/// In-use test for `p` as recorded in the successor's P bit.
#[inline]
pub fn inuse(mem: &SystemMemory, p: usize) -> bool {
    let next = p + chunksize(mem, p);
    chunksize_nomask(mem, next) & PREV_INUSE != 0
}

#[inline]
pub fn inuse_bit_at_offset(mem: &SystemMemory, p: usize, offset: usize) -> bool {
    chunksize_nomask(mem, p + offset) & PREV_INUSE != 0
}

#[inline]
pub fn set_inuse_bit_at_offset(mem: &SystemMemory, p: usize, offset: usize) {
    let addr = p + offset + OFF_SIZE;
    let v = mem.read(addr);
    mem.write(addr, v | PREV_INUSE);
}

#[inline]
pub fn clear_inuse_bit_at_offset(mem: &SystemMemory, p: usize, offset: usize) {
    let addr = p + offset + OFF_SIZE;
    let v = mem.read(addr);
    mem.write(addr, v & !PREV_INUSE);
}

#[inline]
pub fn fd(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p + OFF_FD)
}

#[inline]
pub fn set_fd(mem: &SystemMemory, p: usize, v: usize) {
    mem.write(p + OFF_FD, v);
}

/// Release-ordered `fd` store used by the lock-free fast-bin push.
#[inline]
pub fn set_fd_release(mem: &SystemMemory, p: usize, v: usize) {
    mem.write_release(p + OFF_FD, v);
}

#[inline]
pub fn bk(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p + OFF_BK)
}

#[inline]
pub fn set_bk(mem: &SystemMemory, p: usize, v: usize) {
    mem.write(p + OFF_BK, v);
}

#[inline]
pub fn fd_nextsize(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p + OFF_FD_NEXTSIZE)
}

#[inline]
pub fn set_fd_nextsize(mem: &SystemMemory, p: usize, v: usize) {
    mem.write(p + OFF_FD_NEXTSIZE, v);
}

#[inline]
pub fn bk_nextsize(mem: &SystemMemory, p: usize) -> usize {
    mem.read(p + OFF_BK_NEXTSIZE)
}

#[inline]
pub fn set_bk_nextsize(mem: &SystemMemory, p: usize, v: usize) {
    mem.write(p + OFF_BK_NEXTSIZE, v);
}
