//! Wire type tag -> libffi type descriptor
//!
//! Pure and stateless. Floating point is a deliberate capability limit.

use std::mem;
use std::os::raw::{c_int, c_long, c_uint, c_ulong};
use std::ptr;

use libffi::low::{ffi_type, types};

use crate::error::{Error, Result};
use crate::protocol::TypeTag;

/// Scalar types known on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Void = 0,
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Uint64,
    Sint64,
    Float,
    Double,
    Uchar,
    Schar,
    Ushort,
    Sshort,
    Uint,
    Sint,
    Ulong,
    Slong,
    Pointer,
}

impl ScalarType {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        use ScalarType::*;
        const TABLE: [ScalarType; 20] = [
            Void, Uint8, Sint8, Uint16, Sint16, Uint32, Sint32, Uint64, Sint64, Float, Double,
            Uchar, Schar, Ushort, Sshort, Uint, Sint, Ulong, Slong, Pointer,
        ];
        TABLE.get(v as usize).copied()
    }
}

impl From<ScalarType> for TypeTag {
    fn from(ty: ScalarType) -> Self {
        TypeTag(ty as u8)
    }
}

/// ABI descriptor handed to the call engine
///
/// Points at one of libffi's static type descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiType {
    raw: *mut ffi_type,
    scalar: ScalarType,
}

impl AbiType {
    #[inline(always)]
    pub fn as_raw(&self) -> *mut ffi_type {
        self.raw
    }

    #[inline(always)]
    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    /// Logical size in bytes (0 for void)
    ///
    /// libffi's void descriptor reports size 1, so void is decided by the wire type.
    #[inline(always)]
    pub fn size(&self) -> usize {
        if self.scalar == ScalarType::Void {
            return 0;
        }
        // SAFETY: `raw` always points at a libffi static descriptor.
        unsafe { (*self.raw).size }
    }
}

/// Maps a wire tag to its libffi descriptor.
///
/// `Float`/`Double` fail with `UnsupportedType`, unknown values with `UnknownType`.
pub fn translate(tag: TypeTag) -> Result<AbiType> {
    let Some(ty) = ScalarType::from_u8(tag.0) else {
        log::debug!("Unable to translate unknown FFI type {}", tag.0);
        return Err(Error::UnknownType(tag.0));
    };

    // SAFETY: only the address of libffi's descriptors is taken, they are never written here.
    let raw = unsafe {
        match ty {
            ScalarType::Void => ptr::addr_of_mut!(types::void),
            ScalarType::Uint8 | ScalarType::Uchar => ptr::addr_of_mut!(types::uint8),
            ScalarType::Sint8 | ScalarType::Schar => ptr::addr_of_mut!(types::sint8),
            ScalarType::Uint16 | ScalarType::Ushort => ptr::addr_of_mut!(types::uint16),
            ScalarType::Sint16 | ScalarType::Sshort => ptr::addr_of_mut!(types::sint16),
            ScalarType::Uint32 => ptr::addr_of_mut!(types::uint32),
            ScalarType::Sint32 => ptr::addr_of_mut!(types::sint32),
            ScalarType::Uint64 => ptr::addr_of_mut!(types::uint64),
            ScalarType::Sint64 => ptr::addr_of_mut!(types::sint64),
            ScalarType::Uint => unsigned_of_size(mem::size_of::<c_uint>()),
            ScalarType::Sint => signed_of_size(mem::size_of::<c_int>()),
            ScalarType::Ulong => unsigned_of_size(mem::size_of::<c_ulong>()),
            ScalarType::Slong => signed_of_size(mem::size_of::<c_long>()),
            ScalarType::Pointer => ptr::addr_of_mut!(types::pointer),
            ScalarType::Float | ScalarType::Double => {
                return Err(Error::UnsupportedType(ty));
            }
        }
    };

    Ok(AbiType { raw, scalar: ty })
}

/// Translates a return type and argument list, return type first
pub fn translate_signature(
    return_type: TypeTag,
    argument_types: &[TypeTag],
) -> Result<(AbiType, Vec<AbiType>)> {
    let return_type = translate(return_type)?;

    let mut arguments = Vec::new();
    arguments.try_reserve_exact(argument_types.len())?;
    for &tag in argument_types {
        arguments.push(translate(tag)?);
    }

    Ok((return_type, arguments))
}

// Platform C integer widths, the same aliasing libffi's headers do.
unsafe fn unsigned_of_size(size: usize) -> *mut ffi_type {
    match size {
        2 => ptr::addr_of_mut!(types::uint16),
        4 => ptr::addr_of_mut!(types::uint32),
        _ => ptr::addr_of_mut!(types::uint64),
    }
}

unsafe fn signed_of_size(size: usize) -> *mut ffi_type {
    match size {
        2 => ptr::addr_of_mut!(types::sint16),
        4 => ptr::addr_of_mut!(types::sint32),
        _ => ptr::addr_of_mut!(types::sint64),
    }
}
