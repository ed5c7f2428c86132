//! Request dispatcher
//!
//! Satu request, satu transisi:
//! decode opcode → decode variant → execute → respond.
//! Tidak ada state yang dibawa antar request.

use std::ptr;

use crate::config::USER_INITIATED_ALLOCATION_TAG;
use crate::error::{Error, Result};
use crate::ffi::{translate_signature, CallSignature};
use crate::kernel::{Kernel, ModuleResolver};
use crate::protocol::{
    Allocate, BinaryCursor, CallFunction, Free, Opcode, ReadBytes, Request, WriteBytes,
};

/// Decodes and executes request buffers against one kernel
pub struct RequestDispatcher<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
}

impl<'k, K: Kernel + ?Sized> RequestDispatcher<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        Self { kernel }
    }

    /// Decodes and executes one request buffer.
    ///
    /// # Safety
    /// Every address inside the request is trusted: the caller guarantees that
    /// target and output addresses are valid for the access the request
    /// implies, and that called routines match the declared signature.
    pub unsafe fn dispatch(&self, input: &[u8]) -> Result<()> {
        let mut data = BinaryCursor::new(input);

        let raw_opcode = data.read::<u8>()?;
        let Some(opcode) = Opcode::from_u8(raw_opcode) else {
            log::debug!("Unknown request type {:02X}", raw_opcode);
            return Err(Error::UnknownOperation(raw_opcode));
        };

        let request = Request::decode(opcode, &mut data)?;
        log::debug!("Received {:?} request", request.opcode());
        self.execute(request)
    }

    /// Runs an already-decoded request.
    ///
    /// # Safety
    /// Same contract as [`dispatch`](Self::dispatch).
    pub unsafe fn execute(&self, request: Request<'_>) -> Result<()> {
        match request {
            Request::CallFunction(call) => self.call_function(&call),
            Request::ReadBytes(read) => self.read_bytes(&read),
            Request::WriteBytes(write) => self.write_bytes(&write),
            Request::Allocate(allocate) => self.allocate(&allocate),
            Request::Free(free) => self.free(&free),
        }
    }

    unsafe fn call_function(&self, call: &CallFunction<'_>) -> Result<()> {
        if call.argument_types.len() != call.argument_addresses.len() {
            return Err(Error::ArgumentCountMismatch {
                types: call.argument_types.len(),
                addresses: call.argument_addresses.len(),
            });
        }

        let routine =
            ModuleResolver::new(self.kernel).find(call.module_name, call.function_name)?;

        let (return_type, argument_types) =
            translate_signature(call.return_type, &call.argument_types)?;
        let signature = CallSignature::prepare(return_type, &argument_types)?;

        log::debug!(
            "Calling {}!{} at {:#x} with {} arguments",
            call.module_name.escape_ascii(),
            call.function_name.escape_ascii(),
            routine,
            call.argument_addresses.len()
        );
        let result = signature.invoke(routine, &call.argument_addresses)?;

        if !result.is_empty() {
            ptr::copy_nonoverlapping(
                result.as_ptr(),
                call.return_value_address as *mut u8,
                result.len(),
            );
        }
        Ok(())
    }

    unsafe fn read_bytes(&self, read: &ReadBytes) -> Result<()> {
        if read.out.is_empty() {
            return Ok(());
        }
        ptr::copy(read.address as *const u8, read.out.as_ptr(), read.out.len());
        Ok(())
    }

    unsafe fn write_bytes(&self, write: &WriteBytes) -> Result<()> {
        if write.data.is_empty() {
            return Ok(());
        }
        ptr::copy(write.data.as_ptr(), write.address as *mut u8, write.data.len());
        Ok(())
    }

    unsafe fn allocate(&self, allocate: &Allocate) -> Result<()> {
        let block = self
            .kernel
            .allocate_pool(allocate.size as usize, USER_INITIATED_ALLOCATION_TAG)
            .ok_or(Error::AllocationFailure(allocate.size))?;

        ptr::write_unaligned(allocate.out_address as *mut usize, block.as_ptr() as usize);
        Ok(())
    }

    unsafe fn free(&self, free: &Free) -> Result<()> {
        self.kernel
            .free_pool(free.address as *mut u8, USER_INITIATED_ALLOCATION_TAG)
            .map_err(Error::Native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::ffi::ScalarType;
    use crate::kernel::{pool, write_module_directory, ModuleEntry};
    use crate::protocol::RequestEncoder;
    use std::ptr::NonNull;

    extern "C" fn triple(x: u32) -> u32 {
        x * 3
    }

    extern "C" fn do_nothing() {}

    /// One module "ntX" exporting `Triple` and `DoNothingElse`
    struct FakeKernel;

    const MODULE_BASE: usize = 0x7000_0000;

    impl Kernel for FakeKernel {
        fn query_module_information(&self, buffer: &mut [u8]) -> std::result::Result<usize, Status> {
            let entry = ModuleEntry {
                image_base: MODULE_BASE,
                image_size: 0x1000,
                load_order_index: 0,
                full_path: br"\SystemRoot\system32\ntX.exe",
            };
            write_module_directory(&[entry], buffer)
        }

        unsafe fn find_exported_routine(&self, module_base: usize, name: &[u8]) -> Option<usize> {
            assert_eq!(module_base, MODULE_BASE);
            match name {
                b"Triple" => Some(triple as *const () as usize),
                b"DoNothingElse" => Some(do_nothing as *const () as usize),
                _ => None,
            }
        }

        fn allocate_pool(&self, size: usize, tag: u32) -> Option<NonNull<u8>> {
            pool::allocate(size, tag)
        }

        unsafe fn free_pool(&self, address: *mut u8, tag: u32) -> std::result::Result<(), Status> {
            pool::free(address, tag)
        }
    }

    fn encoder() -> RequestEncoder {
        RequestEncoder::new(4096)
    }

    #[test]
    fn test_every_opcode_has_handler() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        for opcode in Opcode::ALL {
            // Only the opcode byte: decoding must fail on the variant, not the opcode
            let result = unsafe { dispatcher.dispatch(&[opcode as u8]) };
            assert!(
                matches!(result, Err(Error::DecodeOverrun)),
                "{:?} -> {:?}",
                opcode,
                result
            );
        }
    }

    #[test]
    fn test_unknown_opcode() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let result = unsafe { dispatcher.dispatch(&[0xFF, 1, 2, 3]) };
        let err = result.unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(0xFF)));
        assert!(err.to_string().contains("FF"));
    }

    #[test]
    fn test_empty_input() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        assert!(matches!(
            unsafe { dispatcher.dispatch(&[]) },
            Err(Error::DecodeOverrun)
        ));
    }

    #[test]
    fn test_call_writes_return_value() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let x = 14u32;
        let mut out = 0u32;

        let mut enc = encoder();
        let request = enc
            .encode_call(
                "ntx",
                "Triple",
                ScalarType::Uint32 as u8,
                &[ScalarType::Uint32 as u8],
                &mut out as *mut u32 as usize,
                &[&x as *const u32 as usize],
            )
            .unwrap();

        unsafe { dispatcher.dispatch(request) }.unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_call_missing_symbol() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();
        let request = enc
            .encode_call("ntX", "DoNothing", ScalarType::Void as u8, &[], 0, &[])
            .unwrap();

        let err = unsafe { dispatcher.dispatch(request) }.unwrap_err();
        assert!(matches!(&err, Error::SymbolNotFound(name) if name == "DoNothing"));
        assert!(err.to_string().contains("DoNothing"));
    }

    #[test]
    fn test_call_missing_module() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();
        let request = enc
            .encode_call("hal", "Triple", ScalarType::Void as u8, &[], 0, &[])
            .unwrap();

        assert!(matches!(
            unsafe { dispatcher.dispatch(request) },
            Err(Error::ModuleNotFound(name)) if name == "hal"
        ));
    }

    #[test]
    fn test_void_call_leaves_return_slot_alone() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut slot = 0xAAu8;
        let mut enc = encoder();
        let request = enc
            .encode_call(
                "ntX",
                "DoNothingElse",
                ScalarType::Void as u8,
                &[],
                &mut slot as *mut u8 as usize,
                &[],
            )
            .unwrap();

        unsafe { dispatcher.dispatch(request) }.unwrap();
        assert_eq!(slot, 0xAA);
    }

    #[test]
    fn test_void_call_with_null_return_address() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();
        let request = enc
            .encode_call("ntX", "DoNothingElse", ScalarType::Void as u8, &[], 0, &[])
            .unwrap();

        assert!(unsafe { dispatcher.dispatch(request) }.is_ok());
    }

    #[test]
    fn test_argument_count_mismatch_rejected_before_resolution() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();
        // Module does not exist: the count check must fire first
        let request = enc
            .encode_call(
                "missing",
                "Triple",
                ScalarType::Uint32 as u8,
                &[ScalarType::Uint32 as u8, ScalarType::Uint32 as u8],
                0,
                &[0x1000],
            )
            .unwrap();

        assert!(matches!(
            unsafe { dispatcher.dispatch(request) },
            Err(Error::ArgumentCountMismatch {
                types: 2,
                addresses: 1
            })
        ));
    }

    #[test]
    fn test_floating_point_rejected() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();
        let request = enc
            .encode_call("ntX", "Triple", ScalarType::Double as u8, &[], 0, &[])
            .unwrap();

        assert!(matches!(
            unsafe { dispatcher.dispatch(request) },
            Err(Error::UnsupportedType(ScalarType::Double))
        ));
    }

    #[test]
    fn test_read_and_write_bytes() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut target = [0u8; 8];
        let source = *b"kcall!!!";
        let mut readback = [0u8; 8];

        let mut enc = encoder();
        let request = enc
            .encode_write(target.as_mut_ptr() as usize, source.as_ptr() as usize, 8)
            .unwrap();
        unsafe { dispatcher.dispatch(request) }.unwrap();
        assert_eq!(&target, b"kcall!!!");

        let request = enc
            .encode_read(target.as_ptr() as usize, readback.as_mut_ptr() as usize, 8)
            .unwrap();
        unsafe { dispatcher.dispatch(request) }.unwrap();
        assert_eq!(readback, target);
    }

    #[test]
    fn test_zero_length_copies_accept_null_addresses() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut enc = encoder();

        let request = enc.encode_read(0, 0, 0).unwrap();
        assert!(unsafe { dispatcher.dispatch(request) }.is_ok());

        let request = enc.encode_write(0, 0, 0).unwrap();
        assert!(unsafe { dispatcher.dispatch(request) }.is_ok());
    }

    #[test]
    fn test_allocate_zeroed_then_free() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        let mut address = 0usize;

        let mut enc = encoder();
        let request = enc
            .encode_allocate(0x1000, &mut address as *mut usize as usize)
            .unwrap();
        unsafe { dispatcher.dispatch(request) }.unwrap();
        assert_ne!(address, 0);

        let block = unsafe { std::slice::from_raw_parts(address as *const u8, 0x1000) };
        assert!(block.iter().all(|&b| b == 0));

        let request = enc.encode_free(address).unwrap();
        unsafe { dispatcher.dispatch(request) }.unwrap();
    }

    #[test]
    fn test_free_foreign_allocation_fails() {
        let dispatcher = RequestDispatcher::new(&FakeKernel);
        // Allocated with the internal tag, not the user one
        let block = pool::allocate(16, crate::config::ALLOCATION_TAG).unwrap();

        let mut enc = encoder();
        let request = enc.encode_free(block.as_ptr() as usize).unwrap();
        let err = unsafe { dispatcher.dispatch(request) }.unwrap_err();
        assert!(matches!(err, Error::Native(Status::INVALID_PARAMETER)));
        assert_eq!(err.to_string(), "NT error C000000D");

        unsafe { pool::free(block.as_ptr(), crate::config::ALLOCATION_TAG) }.unwrap();
    }
}
