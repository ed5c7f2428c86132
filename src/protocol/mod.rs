//! Protocol Layer: bounds-checked binary request decoding
//!
//! Prinsip desain:
//! - Flat Binary: fields dibaca langsung dari buffer caller
//! - Bounds-checked: tidak pernah membaca melewati akhir buffer
//! - Zero-copy: text dan buffer view hanya referensi

mod cursor;
mod encoder;
mod request;

pub use cursor::{BinaryCursor, Scalar};
pub use encoder::{call_request_len, RequestEncoder, MAX_FIELD_LEN};
pub use request::{
    decode_array, decode_buffer_view, decode_text, Allocate, BufferView, CallFunction, Free,
    Opcode, ReadBytes, Request, TypeTag, WriteBytes,
};
