//! Zero-Allocation Request Encoder
//!
//! Client-side mirror of the request decoder: encode langsung ke
//! pre-allocated buffer. Tidak ada alokasi setelah inisialisasi.

use std::mem;

use super::request::Opcode;

/// Longest text or array a single length byte can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Pre-allocated encoder buffer
///
/// Semua operasi encode dilakukan ke buffer internal,
/// tidak ada alokasi dinamis.
pub struct RequestEncoder {
    buffer: Box<[u8]>,
    write_pos: usize,
}

impl RequestEncoder {
    /// Membuat encoder dengan buffer size tertentu
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
        }
    }

    /// Reset encoder untuk reuse
    #[inline(always)]
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }

    /// CALL_FUNCTION: module, function, return tag, argument tags,
    /// return-value address, argument addresses.
    ///
    /// Returns slice ke encoded request, atau None jika buffer penuh
    /// atau ada field lebih dari 255 entries.
    pub fn encode_call(
        &mut self,
        module_name: &str,
        function_name: &str,
        return_type: u8,
        argument_types: &[u8],
        return_value_address: usize,
        argument_addresses: &[usize],
    ) -> Option<&[u8]> {
        let start = self.write_pos;
        let written = self.put_u8(Opcode::CallFunction as u8)
            && self.put_text(module_name)
            && self.put_text(function_name)
            && self.put_u8(return_type)
            && self.put_len(argument_types.len())
            && self.put_bytes(argument_types)
            && self.put_bytes(&return_value_address.to_ne_bytes())
            && self.put_len(argument_addresses.len())
            && argument_addresses
                .iter()
                .all(|address| self.put_bytes(&address.to_ne_bytes()));

        self.finish(start, written)
    }

    /// READ_BYTES: copy `len` bytes from `address` into the view at `out_address`
    pub fn encode_read(&mut self, address: usize, out_address: usize, len: u32) -> Option<&[u8]> {
        self.encode_view_request(Opcode::ReadBytes, address, out_address, len)
    }

    /// WRITE_BYTES: copy `len` bytes from the view at `data_address` to `address`
    pub fn encode_write(&mut self, address: usize, data_address: usize, len: u32) -> Option<&[u8]> {
        self.encode_view_request(Opcode::WriteBytes, address, data_address, len)
    }

    /// ALLOCATE: `size` bytes, resulting address stored at `out_address`
    pub fn encode_allocate(&mut self, size: u32, out_address: usize) -> Option<&[u8]> {
        let start = self.write_pos;
        let written = self.put_u8(Opcode::Allocate as u8)
            && self.put_bytes(&size.to_ne_bytes())
            && self.put_bytes(&out_address.to_ne_bytes());

        self.finish(start, written)
    }

    /// FREE
    pub fn encode_free(&mut self, address: usize) -> Option<&[u8]> {
        let start = self.write_pos;
        let written =
            self.put_u8(Opcode::Free as u8) && self.put_bytes(&address.to_ne_bytes());

        self.finish(start, written)
    }

    /// Get current buffer content
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.write_pos]
    }

    /// Available space in buffer
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.write_pos
    }

    fn encode_view_request(
        &mut self,
        opcode: Opcode,
        address: usize,
        view_address: usize,
        len: u32,
    ) -> Option<&[u8]> {
        let start = self.write_pos;
        let written = self.put_u8(opcode as u8)
            && self.put_bytes(&address.to_ne_bytes())
            && self.put_bytes(&view_address.to_ne_bytes())
            && self.put_bytes(&len.to_ne_bytes());

        self.finish(start, written)
    }

    /// Rolls back a partial request so the buffer only ever holds whole ones
    #[inline(always)]
    fn finish(&mut self, start: usize, written: bool) -> Option<&[u8]> {
        if !written {
            self.write_pos = start;
            return None;
        }
        Some(&self.buffer[start..self.write_pos])
    }

    #[inline(always)]
    fn put_text(&mut self, text: &str) -> bool {
        self.put_len(text.len()) && self.put_bytes(text.as_bytes())
    }

    #[inline(always)]
    fn put_len(&mut self, len: usize) -> bool {
        len <= MAX_FIELD_LEN && self.put_u8(len as u8)
    }

    #[inline(always)]
    fn put_u8(&mut self, value: u8) -> bool {
        self.put_bytes(&[value])
    }

    #[inline(always)]
    fn put_bytes(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available() {
            return false;
        }
        self.buffer[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        true
    }
}

/// Exact encoded size of a CALL_FUNCTION request
pub fn call_request_len(module_name: &str, function_name: &str, argument_count: usize) -> usize {
    1 + (1 + module_name.len())
        + (1 + function_name.len())
        + 1
        + (1 + argument_count)
        + mem::size_of::<usize>()
        + (1 + argument_count * mem::size_of::<usize>())
}
