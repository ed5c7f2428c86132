//! Bounds-checked read cursor over a caller-owned byte range
//!
//! Setiap advance dicek terhadap `end` sebelum posisi berubah, jadi cursor
//! tidak pernah menunjuk melewati buffer, apapun isinya.

use std::mem;

use crate::error::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// Plain scalar that can be reinterpreted from any byte pattern
pub trait Scalar: Copy + sealed::Sealed {}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Scalar for $ty {}
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize);

/// Read cursor. Invariant: `position <= buffer.len()`.
pub struct BinaryCursor<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BinaryCursor<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Reads the next `size_of::<T>()` bytes as `T` and advances
    #[inline(always)]
    pub fn read<T: Scalar>(&mut self) -> Result<T> {
        let size = mem::size_of::<T>();
        if size > self.bytes_left() {
            return Err(Error::DecodeOverrun);
        }

        // SAFETY: `size` bytes are in bounds and every bit pattern is a valid `T`.
        let value =
            unsafe { std::ptr::read_unaligned(self.buffer.as_ptr().add(self.position) as *const T) };

        self.position += size;
        Ok(value)
    }

    /// Borrows the next `count` bytes (zero-copy) and advances
    #[inline(always)]
    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.bytes_left() {
            return Err(Error::DecodeOverrun);
        }

        let start = self.position;
        self.position += count;
        Ok(&self.buffer[start..self.position])
    }

    /// Advances `count` bytes without returning anything
    #[inline(always)]
    pub fn ignore(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    #[inline(always)]
    pub fn bytes_left(&self) -> usize {
        self.buffer.len() - self.position
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.position
    }
}
