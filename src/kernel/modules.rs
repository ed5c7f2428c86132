//! Module directory and routine resolution
//!
//! Layout directory (native-endian):
//! ┌──────────────────────────────────────────────────────────┐
//! │ number_of_modules u32 │ reserved u32                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ image_base usize │ image_size u32 │ load_order_index u16 │
//! │ offset_to_file_name u16 │ full_path_name [u8; 256]       │
//! ├──────────────────────────────────────────────────────────┤
//! │ ... number_of_modules records                            │
//! └──────────────────────────────────────────────────────────┘
//!
//! Directory di-parse dengan `BinaryCursor`, jadi directory yang terpotong
//! gagal dengan `DecodeOverrun`, bukan membaca di luar buffer.

use std::mem;
use std::ptr::NonNull;

use super::Kernel;
use crate::config::ALLOCATION_TAG;
use crate::error::{Error, Result, Status};
use crate::protocol::BinaryCursor;

pub const INITIAL_QUERY_BUFFER_SIZE: usize = 0x1000;
pub const MAX_QUERY_ATTEMPTS: usize = 9;
pub const FULL_PATH_NAME_LEN: usize = 256;
pub const DIRECTORY_HEADER_SIZE: usize = 8;
pub const MODULE_RECORD_SIZE: usize = mem::size_of::<usize>() + 4 + 2 + 2 + FULL_PATH_NAME_LEN;

const ALLOWED_PREFIXES: [u8; 2] = [b'/', b'\\'];
const ALLOWED_SUFFIXES: [u8; 1] = [b'.'];

/// One loaded module as written into the directory
#[derive(Debug, Clone, Copy)]
pub struct ModuleEntry<'a> {
    pub image_base: usize,
    pub image_size: u32,
    pub load_order_index: u16,
    pub full_path: &'a [u8],
}

/// Serializes `entries` into `buffer`.
///
/// Fails with `INFO_LENGTH_MISMATCH` when the buffer cannot hold them all.
/// Paths longer than 255 bytes are truncated.
pub fn write_module_directory(
    entries: &[ModuleEntry<'_>],
    buffer: &mut [u8],
) -> std::result::Result<usize, Status> {
    let required = entries
        .len()
        .checked_mul(MODULE_RECORD_SIZE)
        .and_then(|records| records.checked_add(DIRECTORY_HEADER_SIZE))
        .ok_or(Status::INFO_LENGTH_MISMATCH)?;
    if buffer.len() < required {
        return Err(Status::INFO_LENGTH_MISMATCH);
    }

    let count = u32::try_from(entries.len()).map_err(|_| Status::INFO_LENGTH_MISMATCH)?;
    buffer[..4].copy_from_slice(&count.to_ne_bytes());
    buffer[4..DIRECTORY_HEADER_SIZE].fill(0);

    for (i, entry) in entries.iter().enumerate() {
        let record = &mut buffer[DIRECTORY_HEADER_SIZE + i * MODULE_RECORD_SIZE..]
            [..MODULE_RECORD_SIZE];
        let (base, rest) = record.split_at_mut(mem::size_of::<usize>());
        let (size, rest) = rest.split_at_mut(4);
        let (load_order, rest) = rest.split_at_mut(2);
        let (file_name_offset, path) = rest.split_at_mut(2);

        let path_len = entry.full_path.len().min(FULL_PATH_NAME_LEN - 1);
        let full_path = &entry.full_path[..path_len];
        let offset = full_path
            .iter()
            .rposition(|c| ALLOWED_PREFIXES.contains(c))
            .map_or(0, |i| i + 1) as u16;

        base.copy_from_slice(&entry.image_base.to_ne_bytes());
        size.copy_from_slice(&entry.image_size.to_ne_bytes());
        load_order.copy_from_slice(&entry.load_order_index.to_ne_bytes());
        file_name_offset.copy_from_slice(&offset.to_ne_bytes());
        path.fill(0);
        path[..path_len].copy_from_slice(full_path);
    }

    Ok(required)
}

/// True if `full_path` belongs to `module_name` (both already case-folded).
///
/// The last occurrence of the name must start the path or follow a path
/// separator, and must end the path or be followed by an extension dot.
pub fn is_module_in_full_path(full_path: &[u8], module_name: &[u8]) -> bool {
    let Some(index) = rfind(full_path, module_name) else {
        return false;
    };

    let prefix_ok = index == 0 || ALLOWED_PREFIXES.contains(&full_path[index - 1]);
    if !prefix_ok {
        return false;
    }

    let end = index + module_name.len();
    end == full_path.len() || ALLOWED_SUFFIXES.contains(&full_path[end])
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Scratch buffer from the kernel pool, released on drop
pub struct PoolBuffer<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
    data: NonNull<u8>,
    len: usize,
    tag: u32,
}

impl<'k, K: Kernel + ?Sized> PoolBuffer<'k, K> {
    pub fn new(kernel: &'k K, len: usize, tag: u32) -> Result<Self> {
        let data = kernel.allocate_pool(len, tag).ok_or(Error::OutOfMemory)?;
        Ok(Self {
            kernel,
            data,
            len,
            tag,
        })
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `data` is a live allocation of `len` bytes owned by this buffer.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K: Kernel + ?Sized> Drop for PoolBuffer<'_, K> {
    fn drop(&mut self) {
        // SAFETY: `data` came from `allocate_pool` with `tag` and is freed exactly once.
        if let Err(status) = unsafe { self.kernel.free_pool(self.data.as_ptr(), self.tag) } {
            log::warn!("Failed to release pool buffer: NT error {}", status);
        }
    }
}

/// A module located in the directory. Only the resolver creates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModule {
    base: usize,
}

impl ResolvedModule {
    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }
}

/// Finds modules and their exports by scanning the kernel's module directory.
///
/// Stateless: nothing is cached across calls.
pub struct ModuleResolver<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
}

impl<'k, K: Kernel + ?Sized> ModuleResolver<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        Self { kernel }
    }

    /// Finds a routine by module and export name
    pub fn find(&self, module_name: &[u8], routine_name: &[u8]) -> Result<usize> {
        let module = self.find_module(module_name)?;
        self.find_export(module, routine_name)
    }

    /// Finds a loaded module by name, case-insensitively and without its
    /// extension ("ntoskrnl" finds "ntoskrnl.exe").
    pub fn find_module(&self, module_name: &[u8]) -> Result<ResolvedModule> {
        let module_name_upper = module_name.to_ascii_uppercase();
        let (directory, written) = self.query_directory()?;

        let mut data = BinaryCursor::new(&directory.as_slice()[..written]);
        let count = data.read::<u32>()?;
        data.ignore(DIRECTORY_HEADER_SIZE - 4)?;

        let mut full_path = [0u8; FULL_PATH_NAME_LEN];
        for _ in 0..count {
            let image_base = data.read::<usize>()?;
            data.ignore(4 + 2 + 2)?;
            let raw_path = data.take(FULL_PATH_NAME_LEN)?;

            // The last byte always acts as terminator for over-long names
            let terminated = &raw_path[..FULL_PATH_NAME_LEN - 1];
            let path_len = terminated
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(terminated.len());
            let path = &mut full_path[..path_len];
            path.copy_from_slice(&terminated[..path_len]);
            path.make_ascii_uppercase();

            if is_module_in_full_path(path, &module_name_upper) {
                return Ok(ResolvedModule { base: image_base });
            }
        }

        Err(Error::ModuleNotFound(module_name.escape_ascii().to_string()))
    }

    /// Resolves one export inside an already-located module
    pub fn find_export(&self, module: ResolvedModule, routine_name: &[u8]) -> Result<usize> {
        // SAFETY: `module.base` was read from the kernel's own directory.
        let routine = unsafe { self.kernel.find_exported_routine(module.base, routine_name) };
        match routine {
            Some(address) if address != 0 => Ok(address),
            _ => Err(Error::SymbolNotFound(routine_name.escape_ascii().to_string())),
        }
    }

    /// Queries the directory, doubling the buffer on length mismatch.
    ///
    /// Gives up after `MAX_QUERY_ATTEMPTS` queries with the last status.
    fn query_directory(&self) -> Result<(PoolBuffer<'k, K>, usize)> {
        let mut size = INITIAL_QUERY_BUFFER_SIZE;
        let mut attempts_left = MAX_QUERY_ATTEMPTS;

        loop {
            let mut buffer = PoolBuffer::new(self.kernel, size, ALLOCATION_TAG)?;
            attempts_left -= 1;

            match self.kernel.query_module_information(buffer.as_mut_slice()) {
                Ok(written) => return Ok((buffer, written.min(size))),
                Err(Status::INFO_LENGTH_MISMATCH) if attempts_left > 0 => {
                    size = size.checked_mul(2).ok_or(Error::OutOfMemory)?;
                }
                Err(status) => return Err(Error::Native(status)),
            }
        }
    }
}
