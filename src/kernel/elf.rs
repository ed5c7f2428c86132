//! In-memory ELF export lookup
//!
//! Membaca dynamic section dari image yang sudah di-load (bukan file di disk):
//! ELF header → program headers → PT_DYNAMIC → symbol/string/hash tables.
//!
//! Design principles:
//! - Semua read pakai `read_unaligned`, tidak ada reference ke memori image
//! - GNU hash dulu, fallback ke SysV hash
//! - Symbol undefined dan hidden-version dilewati

use std::ffi::{c_void, CStr, OsStr};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::symver::VERSYM_HIDDEN;
use goblin::elf64::dynamic::{
    Dyn, DT_GNU_HASH, DT_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB, DT_VERSYM, SIZEOF_DYN,
};
use goblin::elf64::header::{Header, EI_CLASS, ELFCLASS64, ELFMAG, SELFMAG};
use goblin::elf64::program_header::{ProgramHeader, PT_DYNAMIC, PT_LOAD, SIZEOF_PHDR};
use goblin::elf64::sym::{
    st_bind, st_type, Sym, SIZEOF_SYM, STB_GLOBAL, STB_GNU_UNIQUE, STB_WEAK, STT_GNU_IFUNC,
    STT_TLS,
};
use libloading::os::unix::Library;

const PAGE_MASK: u64 = !0xfff;

#[inline(always)]
unsafe fn read<T: Copy>(address: usize) -> T {
    ptr::read_unaligned(address as *const T)
}

/// Tables pulled out of one image's dynamic section
struct DynamicTables {
    bias: usize,
    symtab: usize,
    strtab: usize,
    strsz: Option<usize>,
    gnu_hash: Option<usize>,
    hash: Option<usize>,
    versym: Option<usize>,
}

impl DynamicTables {
    /// # Safety
    /// `image_base` must be the address of a mapped ELF header.
    unsafe fn locate(image_base: usize) -> Option<Self> {
        let ehdr: Header = read(image_base);
        if ehdr.e_ident[..SELFMAG] != ELFMAG[..] || ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
            return None;
        }
        if ehdr.e_phentsize as usize != SIZEOF_PHDR {
            return None;
        }

        let phdrs = image_base + ehdr.e_phoff as usize;
        let mut first_load = None;
        let mut dynamic = None;
        for i in 0..ehdr.e_phnum as usize {
            let phdr: ProgramHeader = read(phdrs + i * SIZEOF_PHDR);
            match phdr.p_type {
                PT_LOAD if first_load.is_none() => first_load = Some(phdr.p_vaddr & PAGE_MASK),
                PT_DYNAMIC => dynamic = Some(phdr.p_vaddr),
                _ => {}
            }
        }

        let bias = image_base.wrapping_sub(first_load? as usize);
        let dynamic = bias.wrapping_add(dynamic? as usize);

        // The loader relocates d_ptr entries in place, except for images it
        // did not map itself (the vDSO), which still hold link-time addresses.
        let rebase = |value: u64| {
            let value = value as usize;
            if value < bias {
                bias.wrapping_add(value)
            } else {
                value
            }
        };

        let mut symtab = None;
        let mut strtab = None;
        let mut tables = Self {
            bias,
            symtab: 0,
            strtab: 0,
            strsz: None,
            gnu_hash: None,
            hash: None,
            versym: None,
        };

        let mut entry = dynamic;
        loop {
            let dyn_entry: Dyn = read(entry);
            match dyn_entry.d_tag {
                DT_NULL => break,
                DT_SYMTAB => symtab = Some(rebase(dyn_entry.d_val)),
                DT_STRTAB => strtab = Some(rebase(dyn_entry.d_val)),
                DT_STRSZ => tables.strsz = Some(dyn_entry.d_val as usize),
                DT_GNU_HASH => tables.gnu_hash = Some(rebase(dyn_entry.d_val)),
                DT_HASH => tables.hash = Some(rebase(dyn_entry.d_val)),
                DT_VERSYM => tables.versym = Some(rebase(dyn_entry.d_val)),
                _ => {}
            }
            entry += SIZEOF_DYN;
        }

        tables.symtab = symtab?;
        tables.strtab = strtab?;
        Some(tables)
    }

    #[inline(always)]
    unsafe fn symbol(&self, index: usize) -> Sym {
        read(self.symtab + index * SIZEOF_SYM)
    }

    unsafe fn name_matches(&self, sym: &Sym, name: &[u8]) -> bool {
        let offset = sym.st_name as usize;
        if let Some(strsz) = self.strsz {
            if offset >= strsz || strsz - offset <= name.len() {
                return false;
            }
        }
        let candidate = std::slice::from_raw_parts((self.strtab + offset) as *const u8, name.len() + 1);
        &candidate[..name.len()] == name && candidate[name.len()] == 0
    }

    /// Defined, visible, default-version export with this name
    unsafe fn is_export(&self, index: usize, sym: &Sym, name: &[u8]) -> bool {
        if u32::from(sym.st_shndx) == SHN_UNDEF || sym.st_value == 0 {
            return false;
        }
        if !matches!(st_bind(sym.st_info), STB_GLOBAL | STB_WEAK | STB_GNU_UNIQUE) {
            return false;
        }
        if st_type(sym.st_info) == STT_TLS {
            return false;
        }
        if let Some(versym) = self.versym {
            let version: u16 = read(versym + index * mem::size_of::<u16>());
            if version & VERSYM_HIDDEN != 0 {
                return false;
            }
        }
        self.name_matches(sym, name)
    }

    unsafe fn lookup_gnu(&self, table: usize, name: &[u8]) -> Option<Sym> {
        let nbuckets: u32 = read(table);
        let symoffset: u32 = read(table + 4);
        let bloom_size: u32 = read(table + 8);
        let bloom_shift: u32 = read(table + 12);
        if nbuckets == 0 || bloom_size == 0 {
            return None;
        }

        let bloom = table + 16;
        let buckets = bloom + bloom_size as usize * mem::size_of::<u64>();
        let chains = buckets + nbuckets as usize * mem::size_of::<u32>();

        let hash = gnu_hash(name);
        let word: u64 = read(bloom + ((hash / 64) % bloom_size) as usize * mem::size_of::<u64>());
        let mask = (1u64 << (hash % 64)) | (1u64 << ((hash >> bloom_shift) % 64));
        if word & mask != mask {
            return None;
        }

        let mut index: u32 = read(buckets + (hash % nbuckets) as usize * mem::size_of::<u32>());
        if index < symoffset {
            return None;
        }

        loop {
            let chain: u32 = read(chains + (index - symoffset) as usize * mem::size_of::<u32>());
            if (chain | 1) == (hash | 1) {
                let sym = self.symbol(index as usize);
                if self.is_export(index as usize, &sym, name) {
                    return Some(sym);
                }
            }
            if chain & 1 != 0 {
                return None;
            }
            index += 1;
        }
    }

    unsafe fn lookup_sysv(&self, table: usize, name: &[u8]) -> Option<Sym> {
        let nbucket: u32 = read(table);
        let nchain: u32 = read(table + 4);
        if nbucket == 0 {
            return None;
        }

        let buckets = table + 8;
        let chains = buckets + nbucket as usize * mem::size_of::<u32>();

        let mut index: u32 = read(buckets + (elf_hash(name) % nbucket) as usize * mem::size_of::<u32>());
        // Chains are bounded by nchain; a cycle would otherwise never end
        for _ in 0..nchain {
            if index == 0 || index >= nchain {
                return None;
            }
            let sym = self.symbol(index as usize);
            if self.is_export(index as usize, &sym, name) {
                return Some(sym);
            }
            index = read(chains + index as usize * mem::size_of::<u32>());
        }
        None
    }
}

fn gnu_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(5381u32, |h, &c| h.wrapping_mul(33).wrapping_add(c as u32))
}

fn elf_hash(name: &[u8]) -> u32 {
    name.iter().fold(0u32, |h, &c| {
        let h = (h << 4).wrapping_add(c as u32);
        let high = h & 0xf000_0000;
        (h ^ (high >> 24)) & !high
    })
}

/// Resolves `name` in the image mapped at `image_base`.
///
/// # Safety
/// `image_base` must be the base of an ELF image currently mapped by the loader.
pub unsafe fn find_export(image_base: usize, name: &[u8]) -> Option<usize> {
    let tables = DynamicTables::locate(image_base)?;

    let sym = match (tables.gnu_hash, tables.hash) {
        (Some(table), _) => tables.lookup_gnu(table, name),
        (None, Some(table)) => tables.lookup_sysv(table, name),
        (None, None) => None,
    }?;

    if st_type(sym.st_info) == STT_GNU_IFUNC {
        return resolve_indirect(image_base, name);
    }

    Some(tables.bias.wrapping_add(sym.st_value as usize))
}

/// IFUNC exports need their resolver run; the loader does that for us.
unsafe fn resolve_indirect(image_base: usize, name: &[u8]) -> Option<usize> {
    let mut info: libc::Dl_info = mem::zeroed();
    if libc::dladdr(image_base as *const c_void, &mut info) == 0 || info.dli_fname.is_null() {
        return None;
    }
    let path = OsStr::from_bytes(CStr::from_ptr(info.dli_fname).to_bytes());

    // NOLOAD: only pins a library that is already mapped, closed on drop
    let library = Library::open(Some(path), libc::RTLD_NOLOAD | libc::RTLD_LAZY).ok()?;
    let symbol = library.get::<*mut c_void>(name).ok()?;
    let address = *symbol;
    (!address.is_null()).then_some(address as usize)
}
