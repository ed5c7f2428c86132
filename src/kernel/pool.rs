//! Tagged pool allocations
//!
//! Setiap blok diawali header 16 byte `{tag, guard, size}` sehingga free
//! cukup dengan address dan tag, seperti pool allocator kernel.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use crate::error::Status;

const POOL_ALIGN: usize = 16;
const HEADER_SIZE: usize = 16;
const GUARD: u32 = u32::from_le_bytes(*b"Pool");

#[repr(C)]
#[derive(Clone, Copy)]
struct PoolHeader {
    tag: u32,
    guard: u32,
    size: usize,
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() <= HEADER_SIZE);

#[inline(always)]
fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.checked_add(HEADER_SIZE)?, POOL_ALIGN).ok()
}

/// Allocates `size` zeroed bytes. Returns None when memory is exhausted.
pub fn allocate(size: usize, tag: u32) -> Option<NonNull<u8>> {
    let layout = layout_for(size)?;

    // SAFETY: layout is never zero-sized (it always includes the header).
    let block = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

    // SAFETY: the block is at least HEADER_SIZE bytes and POOL_ALIGN aligned.
    unsafe {
        block
            .as_ptr()
            .cast::<PoolHeader>()
            .write(PoolHeader {
                tag,
                guard: GUARD,
                size,
            });
        NonNull::new(block.as_ptr().add(HEADER_SIZE))
    }
}

/// Releases a block from `allocate`.
///
/// Fails with `INVALID_PARAMETER` for null or when the header does not carry `tag`.
///
/// # Safety
/// `address` must be null or a live pointer returned by `allocate`.
pub unsafe fn free(address: *mut u8, tag: u32) -> Result<(), Status> {
    if address.is_null() {
        return Err(Status::INVALID_PARAMETER);
    }

    let block = address.sub(HEADER_SIZE);
    let header = ptr::read_unaligned(block.cast::<PoolHeader>());
    if header.guard != GUARD || header.tag != tag {
        log::debug!(
            "Pool free with tag {:08X} rejected (header tag {:08X})",
            tag,
            header.tag
        );
        return Err(Status::INVALID_PARAMETER);
    }

    let layout = layout_for(header.size).ok_or(Status::INVALID_PARAMETER)?;
    ptr::write_unaligned(
        block.cast::<PoolHeader>(),
        PoolHeader {
            tag: 0,
            guard: 0,
            size: 0,
        },
    );
    alloc::dealloc(block, layout);
    Ok(())
}
