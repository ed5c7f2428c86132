//! Host-process kernel
//!
//! Backs `Kernel` with the current process: loaded shared objects play the
//! role of kernel modules, the dynamic loader is the directory source.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use goblin::elf::program_header::PT_LOAD;

use super::modules::{write_module_directory, ModuleEntry};
use super::{elf, pool, Kernel};
use crate::error::Status;

type PhdrCallback =
    unsafe extern "C" fn(info: *mut libc::dl_phdr_info, size: libc::size_t, data: *mut c_void) -> c_int;
type IteratePhdr = unsafe extern "C" fn(callback: Option<PhdrCallback>, data: *mut c_void) -> c_int;

const ITERATE_PHDR_NAME: &[u8] = b"dl_iterate_phdr\0";

/// Resolved address of the directory routine, 0 until first use
static ITERATE_PHDR: AtomicUsize = AtomicUsize::new(0);

/// Looks the routine up once; concurrent first callers publish the same value.
fn iterate_phdr() -> Option<IteratePhdr> {
    let mut address = ITERATE_PHDR.load(Ordering::Acquire);
    if address == 0 {
        // SAFETY: the name is NUL-terminated and RTLD_DEFAULT is always valid.
        let resolved = unsafe { libc::dlsym(libc::RTLD_DEFAULT, ITERATE_PHDR_NAME.as_ptr().cast()) };
        if resolved.is_null() {
            log::debug!("dl_iterate_phdr is not available");
            return None;
        }
        address = match ITERATE_PHDR.compare_exchange(
            0,
            resolved as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => resolved as usize,
            Err(published) => published,
        };
    }

    // SAFETY: the address was returned by dlsym for this exact symbol.
    Some(unsafe { std::mem::transmute::<usize, IteratePhdr>(address) })
}

struct LoadedObject {
    base: usize,
    size: u32,
    path: Vec<u8>,
}

struct Collector<'a> {
    objects: Vec<LoadedObject>,
    main_program: &'a [u8],
    out_of_memory: bool,
}

unsafe extern "C" fn collect(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let collector = &mut *data.cast::<Collector<'_>>();
    let info = &*info;
    if info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
        return 0;
    }

    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let mut low = u64::MAX;
    let mut high = 0u64;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        low = low.min(phdr.p_vaddr & !0xfff);
        high = high.max(phdr.p_vaddr + phdr.p_memsz);
    }
    if low == u64::MAX {
        return 0;
    }

    let name: &[u8] = if info.dlpi_name.is_null() {
        &[]
    } else {
        CStr::from_ptr(info.dlpi_name as *const c_char).to_bytes()
    };
    let path = if name.is_empty() && collector.objects.is_empty() {
        collector.main_program
    } else {
        name
    };

    let mut owned = Vec::new();
    if owned.try_reserve_exact(path.len()).is_err() || collector.objects.try_reserve(1).is_err() {
        collector.out_of_memory = true;
        return 1;
    }
    owned.extend_from_slice(path);

    collector.objects.push(LoadedObject {
        base: (info.dlpi_addr as usize).wrapping_add(low as usize),
        size: u32::try_from(high - low).unwrap_or(u32::MAX),
        path: owned,
    });
    0
}

/// Kernel services provided by the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernel;

impl HostKernel {
    pub fn new() -> Self {
        Self
    }
}

impl Kernel for HostKernel {
    fn query_module_information(&self, buffer: &mut [u8]) -> Result<usize, Status> {
        let iterate = iterate_phdr().ok_or(Status::NOT_FOUND)?;

        let main_program = std::env::current_exe()
            .map(|path| path.as_os_str().as_bytes().to_vec())
            .unwrap_or_default();
        let mut collector = Collector {
            objects: Vec::new(),
            main_program: &main_program,
            out_of_memory: false,
        };

        // SAFETY: `collect` only touches the collector passed alongside it.
        unsafe {
            iterate(Some(collect), (&mut collector as *mut Collector<'_>).cast());
        }
        if collector.out_of_memory {
            return Err(Status::NO_MEMORY);
        }

        let entries: Vec<ModuleEntry<'_>> = collector
            .objects
            .iter()
            .enumerate()
            .map(|(i, object)| ModuleEntry {
                image_base: object.base,
                image_size: object.size,
                load_order_index: i as u16,
                full_path: &object.path,
            })
            .collect();

        write_module_directory(&entries, buffer)
    }

    unsafe fn find_exported_routine(&self, module_base: usize, name: &[u8]) -> Option<usize> {
        elf::find_export(module_base, name)
    }

    fn allocate_pool(&self, size: usize, tag: u32) -> Option<NonNull<u8>> {
        pool::allocate(size, tag)
    }

    unsafe fn free_pool(&self, address: *mut u8, tag: u32) -> Result<(), Status> {
        pool::free(address, tag)
    }
}
