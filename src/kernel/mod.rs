//! Kernel Layer: the privileged execution context
//!
//! Semua akses ke layanan privileged lewat trait `Kernel`, sehingga resolver
//! dan dispatcher tidak peduli apakah yang di belakangnya kernel sungguhan,
//! proses host, atau kernel palsu untuk test.

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod elf;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod host;
mod modules;
pub mod pool;

use std::ptr::NonNull;

use crate::error::Status;

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub use host::HostKernel;
pub use modules::{
    is_module_in_full_path, write_module_directory, ModuleEntry, ModuleResolver, PoolBuffer,
    ResolvedModule, DIRECTORY_HEADER_SIZE, FULL_PATH_NAME_LEN, INITIAL_QUERY_BUFFER_SIZE,
    MAX_QUERY_ATTEMPTS, MODULE_RECORD_SIZE,
};

/// Privileged services the bridge is built on
pub trait Kernel: Send + Sync {
    /// Fills `buffer` with the loaded-module directory and returns the bytes written.
    ///
    /// Fails with `Status::INFO_LENGTH_MISMATCH` when `buffer` is too small.
    fn query_module_information(&self, buffer: &mut [u8]) -> Result<usize, Status>;

    /// Looks up an exported symbol inside a loaded module by its exact name bytes.
    ///
    /// # Safety
    /// `module_base` must be an image base reported by `query_module_information`
    /// for a module that is still loaded.
    unsafe fn find_exported_routine(&self, module_base: usize, name: &[u8]) -> Option<usize>;

    /// Zero-initialized allocation of `size` bytes tagged with `tag`
    fn allocate_pool(&self, size: usize, tag: u32) -> Option<NonNull<u8>>;

    /// Releases an allocation made by `allocate_pool` with the same `tag`.
    ///
    /// # Safety
    /// `address` must come from `allocate_pool` and must not have been freed.
    unsafe fn free_pool(&self, address: *mut u8, tag: u32) -> Result<(), Status>;
}
