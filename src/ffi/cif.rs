//! Call interface for invoking an arbitrary function, backed by libffi
//!
//! Signature dibangun sekali per request dan immutable setelah itu.
//! Tidak ada signature setengah jadi yang bisa dipanggil: `prepare`
//! gagal atau menghasilkan signature yang valid.

use std::mem;
use std::os::raw::c_void;
use std::ptr;

use libffi::low::{self, ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, CodePtr};

use super::translate::AbiType;
use crate::error::{Error, Result, SignatureFault};

/// Smallest buffer libffi may write a return value into (register-sized, `ffi_arg`)
pub const MIN_RETURN_SIZE: usize = mem::size_of::<usize>();

/// Prepared, ABI-ready description of one call shape
pub struct CallSignature {
    cif: ffi_cif,
    return_type: AbiType,
    // Backing storage for `cif.arg_types`; must live as long as `cif`.
    argument_types: Vec<*mut ffi_type>,
}

impl CallSignature {
    /// Builds a signature for the default calling convention.
    ///
    /// Fails with `BadCallSignature` if libffi rejects the combination.
    pub fn prepare(return_type: AbiType, argument_types: &[AbiType]) -> Result<Self> {
        let mut raw_arguments = Vec::new();
        raw_arguments.try_reserve_exact(argument_types.len())?;
        raw_arguments.extend(argument_types.iter().map(AbiType::as_raw));

        let mut signature = Self {
            cif: Default::default(),
            return_type,
            argument_types: raw_arguments,
        };

        // SAFETY: the descriptors are libffi statics and `argument_types` outlives `cif`.
        let status = unsafe {
            low::prep_cif(
                &mut signature.cif,
                ffi_abi_FFI_DEFAULT_ABI,
                signature.argument_types.len(),
                return_type.as_raw(),
                signature.argument_types.as_mut_ptr(),
            )
        };

        status.map_err(|e| {
            Error::BadCallSignature(match e {
                low::Error::Abi => SignatureFault::BadAbi,
                _ => SignatureFault::BadTypedef,
            })
        })?;

        Ok(signature)
    }

    #[inline(always)]
    pub fn argument_count(&self) -> usize {
        self.argument_types.len()
    }

    #[inline(always)]
    pub fn return_type(&self) -> AbiType {
        self.return_type
    }

    /// Native footprint of the return value: the logical size, but never
    /// below `MIN_RETURN_SIZE` unless the function returns nothing.
    #[inline(always)]
    pub fn return_footprint(&self) -> usize {
        match self.return_type.size() {
            0 => 0,
            size => size.max(MIN_RETURN_SIZE),
        }
    }

    /// Calls `function` with one pointer per argument.
    ///
    /// Returns whatever the function returned, truncated to the logical
    /// return size (empty for void).
    ///
    /// # Safety
    /// `function` must be a function matching this signature and each entry of
    /// `argument_addresses` must point at a readable value of its argument type.
    /// A callee that faults or never returns is not recoverable.
    pub unsafe fn invoke(&self, function: usize, argument_addresses: &[usize]) -> Result<Vec<u8>> {
        if argument_addresses.len() != self.argument_count() {
            return Err(Error::ArgumentCountMismatch {
                types: self.argument_count(),
                addresses: argument_addresses.len(),
            });
        }

        let mut arguments: Vec<*mut c_void> = Vec::new();
        arguments.try_reserve_exact(argument_addresses.len())?;
        arguments.extend(argument_addresses.iter().map(|&a| a as *mut c_void));

        // u64 words keep the scratch buffer aligned for libffi's register stores
        let footprint = self.return_footprint();
        let word = mem::size_of::<u64>();
        let mut scratch: Vec<u64> = Vec::new();
        scratch.try_reserve_exact((footprint + word - 1) / word)?;
        scratch.resize((footprint + word - 1) / word, 0);

        let code = CodePtr::from_ptr(function as *const c_void);
        libffi::raw::ffi_call(
            ptr::addr_of!(self.cif).cast_mut(),
            Some(*code.as_fun()),
            scratch.as_mut_ptr().cast(),
            arguments.as_mut_ptr(),
        );

        let logical = self.return_type.size();
        // Big-endian hosts keep a widened result in the high-address bytes
        let offset = if cfg!(target_endian = "big") {
            footprint - logical
        } else {
            0
        };

        let mut result = Vec::new();
        result.try_reserve_exact(logical)?;
        result.extend_from_slice(std::slice::from_raw_parts(
            scratch.as_ptr().cast::<u8>().add(offset),
            logical,
        ));

        Ok(result)
    }
}
