//! Request variants and their wire decoding
//!
//! Layout (native-endian, pointer-width addresses):
//! ┌──────────┬─────────────────────────────────────────────────────┐
//! │ opcode u8│ variant fields                                      │
//! └──────────┴─────────────────────────────────────────────────────┘
//!
//! - text:        `len: u8` + `len` bytes, passed through as raw bytes
//! - array<T>:    `count: u8` + `count` elements of `T`
//! - buffer view: `address: usize` + `len: u32`
//!
//! Buffer view hanya referensi ke memori caller, bukan copy.

use std::mem;

use super::cursor::{BinaryCursor, Scalar};
use crate::error::{Error, Result};

/// Request discriminant (first byte of every request)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    CallFunction = 1,
    ReadBytes = 2,
    WriteBytes = 3,
    Allocate = 4,
    Free = 5,
}

impl Opcode {
    /// Every opcode with a handler, in wire order
    pub const ALL: [Opcode; 5] = [
        Opcode::CallFunction,
        Opcode::ReadBytes,
        Opcode::WriteBytes,
        Opcode::Allocate,
        Opcode::Free,
    ];

    /// 0 is reserved as invalid
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::CallFunction),
            2 => Some(Self::ReadBytes),
            3 => Some(Self::WriteBytes),
            4 => Some(Self::Allocate),
            5 => Some(Self::Free),
            _ => None,
        }
    }
}

/// Raw scalar type tag as it appears on the wire.
///
/// Not validated at decode time; translation rejects unknown values.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTag(pub u8);

/// Reference to caller memory: `address` and byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub address: usize,
    pub len: u32,
}

impl BufferView {
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.address as *mut u8
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Invoke `module_name!function_name` with the given signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFunction<'a> {
    pub module_name: &'a [u8],
    pub function_name: &'a [u8],
    pub return_type: TypeTag,
    pub argument_types: Vec<TypeTag>,
    pub return_value_address: usize,
    pub argument_addresses: Vec<usize>,
}

/// Copy `out.len` bytes from `address` into `out`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBytes {
    pub address: usize,
    pub out: BufferView,
}

/// Copy `data` to `address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBytes {
    pub address: usize,
    pub data: BufferView,
}

/// Allocate `size` zeroed bytes, store the address at `out_address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocate {
    pub size: u32,
    pub out_address: usize,
}

/// Release memory obtained through `Allocate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Free {
    pub address: usize,
}

/// One decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    CallFunction(CallFunction<'a>),
    ReadBytes(ReadBytes),
    WriteBytes(WriteBytes),
    Allocate(Allocate),
    Free(Free),
}

impl<'a> Request<'a> {
    /// Decodes the variant selected by `opcode` from the rest of the buffer.
    ///
    /// Any short field fails the whole decode with `DecodeOverrun`.
    pub fn decode(opcode: Opcode, data: &mut BinaryCursor<'a>) -> Result<Self> {
        Ok(match opcode {
            Opcode::CallFunction => Request::CallFunction(CallFunction::decode(data)?),
            Opcode::ReadBytes => Request::ReadBytes(ReadBytes {
                address: data.read()?,
                out: decode_buffer_view(data)?,
            }),
            Opcode::WriteBytes => Request::WriteBytes(WriteBytes {
                address: data.read()?,
                data: decode_buffer_view(data)?,
            }),
            Opcode::Allocate => Request::Allocate(Allocate {
                size: data.read()?,
                out_address: data.read()?,
            }),
            Opcode::Free => Request::Free(Free {
                address: data.read()?,
            }),
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::CallFunction(_) => Opcode::CallFunction,
            Request::ReadBytes(_) => Opcode::ReadBytes,
            Request::WriteBytes(_) => Opcode::WriteBytes,
            Request::Allocate(_) => Opcode::Allocate,
            Request::Free(_) => Opcode::Free,
        }
    }
}

impl<'a> CallFunction<'a> {
    fn decode(data: &mut BinaryCursor<'a>) -> Result<Self> {
        let module_name = decode_text(data)?;
        let function_name = decode_text(data)?;
        let return_type = TypeTag(data.read()?);
        let argument_types = decode_array::<u8>(data)?
            .into_iter()
            .map(TypeTag)
            .collect();
        let return_value_address = data.read()?;
        let argument_addresses = decode_array::<usize>(data)?;

        Ok(Self {
            module_name,
            function_name,
            return_type,
            argument_types,
            return_value_address,
            argument_addresses,
        })
    }
}

/// `len: u8` followed by `len` bytes, borrowed unchanged. Empty text is valid.
pub fn decode_text<'a>(data: &mut BinaryCursor<'a>) -> Result<&'a [u8]> {
    let size = data.read::<u8>()? as usize;
    if size > data.bytes_left() {
        return Err(Error::DecodeOverrun);
    }

    data.take(size)
}

/// `count: u8` followed by `count` elements; checked in units of elements
pub fn decode_array<T: Scalar>(data: &mut BinaryCursor<'_>) -> Result<Vec<T>> {
    let count = data.read::<u8>()? as usize;
    if count > data.bytes_left() / mem::size_of::<T>() {
        return Err(Error::DecodeOverrun);
    }

    let mut result = Vec::new();
    result.try_reserve_exact(count)?;
    for _ in 0..count {
        result.push(data.read::<T>()?);
    }

    Ok(result)
}

/// `address: usize` followed by `len: u32`
pub fn decode_buffer_view(data: &mut BinaryCursor<'_>) -> Result<BufferView> {
    Ok(BufferView {
        address: data.read()?,
        len: data.read()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestEncoder;
    use proptest::prelude::*;

    #[test]
    fn test_opcode_roundtrip() {
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::from_u8(opcode as u8), Some(opcode));
        }
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_decode_call_function() {
        let mut encoder = RequestEncoder::new(512);
        let bytes = encoder
            .encode_call("ntoskrnl", "KeBugCheck", 0, &[5, 19], 0x1000, &[0x2000, 0x3000])
            .unwrap()
            .to_vec();

        let mut cursor = BinaryCursor::new(&bytes[1..]);
        let request = Request::decode(Opcode::CallFunction, &mut cursor).unwrap();
        let Request::CallFunction(call) = request else {
            panic!("expected call request");
        };

        assert_eq!(call.module_name, b"ntoskrnl");
        assert_eq!(call.function_name, b"KeBugCheck");
        assert_eq!(call.return_type, TypeTag(0));
        assert_eq!(call.argument_types, vec![TypeTag(5), TypeTag(19)]);
        assert_eq!(call.return_value_address, 0x1000);
        assert_eq!(call.argument_addresses, vec![0x2000, 0x3000]);
        assert_eq!(cursor.bytes_left(), 0);
    }

    #[test]
    fn test_decode_read_write_views() {
        let mut encoder = RequestEncoder::new(64);
        let bytes = encoder.encode_read(0xdead_0000, 0xbeef_0000, 16).unwrap().to_vec();

        let mut cursor = BinaryCursor::new(&bytes[1..]);
        assert_eq!(
            Request::decode(Opcode::ReadBytes, &mut cursor).unwrap(),
            Request::ReadBytes(ReadBytes {
                address: 0xdead_0000,
                out: BufferView {
                    address: 0xbeef_0000,
                    len: 16
                },
            })
        );

        encoder.reset();
        let bytes = encoder.encode_write(0x10, 0x20, 3).unwrap().to_vec();
        let mut cursor = BinaryCursor::new(&bytes[1..]);
        let request = Request::decode(Opcode::WriteBytes, &mut cursor).unwrap();
        assert_eq!(request.opcode(), Opcode::WriteBytes);
    }

    #[test]
    fn test_decode_allocate_and_free() {
        let mut buf = 0x1000u32.to_ne_bytes().to_vec();
        buf.extend_from_slice(&0x4000usize.to_ne_bytes());
        let mut cursor = BinaryCursor::new(&buf);
        assert_eq!(
            Request::decode(Opcode::Allocate, &mut cursor).unwrap(),
            Request::Allocate(Allocate {
                size: 0x1000,
                out_address: 0x4000
            })
        );

        let buf = 0x4000usize.to_ne_bytes();
        let mut cursor = BinaryCursor::new(&buf);
        assert_eq!(
            Request::decode(Opcode::Free, &mut cursor).unwrap(),
            Request::Free(Free { address: 0x4000 })
        );
    }

    #[test]
    fn test_text_longer_than_buffer() {
        let buf = [5u8, b'a', b'b'];
        let mut cursor = BinaryCursor::new(&buf);
        assert!(matches!(decode_text(&mut cursor), Err(Error::DecodeOverrun)));
    }

    #[test]
    fn test_empty_text_is_valid() {
        let buf = [0u8];
        let mut cursor = BinaryCursor::new(&buf);
        assert_eq!(decode_text(&mut cursor).unwrap(), b"");
    }

    #[test]
    fn test_text_bytes_are_not_rewritten() {
        // Not valid UTF-8: must come back byte for byte
        let buf = [2u8, 0x61, 0xFF];
        let mut cursor = BinaryCursor::new(&buf);
        assert_eq!(decode_text(&mut cursor).unwrap(), b"a\xFF");
        assert_eq!(cursor.bytes_left(), 0);
    }

    #[test]
    fn test_array_checked_in_elements() {
        // 2 addresses claimed, only 1.5 present
        let mut buf = vec![2u8];
        buf.extend_from_slice(&[0u8; mem::size_of::<usize>() * 3 / 2]);
        let mut cursor = BinaryCursor::new(&buf);
        assert!(matches!(
            decode_array::<usize>(&mut cursor),
            Err(Error::DecodeOverrun)
        ));
    }

    #[test]
    fn test_truncated_call_fails_everywhere() {
        let mut encoder = RequestEncoder::new(512);
        let bytes = encoder
            .encode_call("hal", "HalReturnToFirmware", 19, &[5], 0x10, &[0x20])
            .unwrap()
            .to_vec();

        for cut in 1..bytes.len() {
            let mut cursor = BinaryCursor::new(&bytes[1..cut]);
            assert!(
                Request::decode(Opcode::CallFunction, &mut cursor).is_err(),
                "cut at {cut} decoded"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_text_roundtrip(text in "[ -~]{0,255}") {
            let mut buf = vec![text.len() as u8];
            buf.extend_from_slice(text.as_bytes());
            let mut cursor = BinaryCursor::new(&buf);
            prop_assert_eq!(decode_text(&mut cursor).unwrap(), text.as_bytes());
            prop_assert_eq!(cursor.bytes_left(), 0);
        }

        #[test]
        fn prop_garbage_never_overruns(
            opcode in 1u8..=5,
            body in proptest::collection::vec(any::<u8>(), 0..96),
        ) {
            let mut cursor = BinaryCursor::new(&body);
            let _ = Request::decode(Opcode::from_u8(opcode).unwrap(), &mut cursor);
            prop_assert!(cursor.position() <= body.len());
        }
    }
}
