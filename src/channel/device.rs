//! Control device: the single catch point
//!
//! Request buffer masuk, status + diagnostic keluar. Error apa pun dari
//! decode atau execute berhenti di sini dan tidak pernah bocor ke transport.

use std::fmt::{self, Write};

use super::dispatcher::RequestDispatcher;
use crate::config::{DEVICE_NAME, DEVICE_SYMBOLIC_LINK, REQUEST_IOCTL_CODE};
use crate::error::{Error, Status};
use crate::kernel::Kernel;

const OUT_OF_MEMORY_MESSAGE: &str = "Not enough memory";

/// Outcome of one control request: status plus bytes written to the output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    pub information: usize,
}

impl Completion {
    #[inline(always)]
    pub fn success() -> Self {
        Self {
            status: Status::SUCCESS,
            information: 0,
        }
    }
}

/// The externally visible control channel in front of the dispatcher
pub struct ControlDevice<K: Kernel> {
    kernel: K,
}

impl<K: Kernel> ControlDevice<K> {
    pub fn new(kernel: K) -> Self {
        log::debug!("Control device {} ready at {}", DEVICE_NAME, DEVICE_SYMBOLIC_LINK);
        Self { kernel }
    }

    #[inline(always)]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    pub fn symbolic_link(&self) -> &'static str {
        DEVICE_SYMBOLIC_LINK
    }

    /// Opening or closing a handle always succeeds
    pub fn create_close(&self) -> Completion {
        Completion::success()
    }

    /// Handles one request buffer.
    ///
    /// On failure a NUL-terminated diagnostic is written into `output`,
    /// truncated to fit, and `information` is the byte count written.
    ///
    /// # Safety
    /// The request's embedded addresses are trusted, see
    /// [`RequestDispatcher::dispatch`].
    pub unsafe fn device_control(
        &self,
        ioctl_code: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Completion {
        if ioctl_code != REQUEST_IOCTL_CODE {
            log::debug!("Unknown IOCTL code {:08X}", ioctl_code);
            return Completion {
                status: Status::INVALID_DEVICE_REQUEST,
                information: 0,
            };
        }

        let err = match RequestDispatcher::new(&self.kernel).dispatch(input) {
            Ok(()) => return Completion::success(),
            Err(err) => err,
        };

        log::debug!("Request failed: {}", err);
        let information = match &err {
            Error::OutOfMemory => write_diagnostic(output, format_args!("{}", OUT_OF_MEMORY_MESSAGE)),
            other => write_diagnostic(output, format_args!("{}", other)),
        };

        Completion {
            status: err.status(),
            information,
        }
    }
}

/// Formats straight into the caller's buffer, dropping whatever does not fit
struct TruncatingWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl Write for TruncatingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = self.buffer.len() - self.position;
        let count = s.len().min(available);
        self.buffer[self.position..self.position + count].copy_from_slice(&s.as_bytes()[..count]);
        self.position += count;
        Ok(())
    }
}

/// Writes `message` plus NUL, at most `output.len()` bytes in total
fn write_diagnostic(output: &mut [u8], message: fmt::Arguments<'_>) -> usize {
    let Some(text_capacity) = output.len().checked_sub(1) else {
        return 0;
    };

    let mut writer = TruncatingWriter {
        buffer: &mut output[..text_capacity],
        position: 0,
    };
    // TruncatingWriter never fails
    let _ = writer.write_fmt(message);
    let end = writer.position;

    output[end] = 0;
    end + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ALLOCATION_TAG, USER_INITIATED_ALLOCATION_TAG};
    use crate::kernel::pool;
    use std::ptr::NonNull;

    /// Kernel with no modules; allocations with `exhausted_tag` always fail
    struct EmptyKernel {
        exhausted_tag: u32,
    }

    const EMPTY: EmptyKernel = EmptyKernel {
        exhausted_tag: USER_INITIATED_ALLOCATION_TAG,
    };

    impl Kernel for EmptyKernel {
        fn query_module_information(&self, buffer: &mut [u8]) -> Result<usize, Status> {
            crate::kernel::write_module_directory(&[], buffer)
        }

        unsafe fn find_exported_routine(&self, _: usize, _: &[u8]) -> Option<usize> {
            None
        }

        fn allocate_pool(&self, size: usize, tag: u32) -> Option<NonNull<u8>> {
            if tag == self.exhausted_tag {
                return None;
            }
            pool::allocate(size, tag)
        }

        unsafe fn free_pool(&self, address: *mut u8, tag: u32) -> Result<(), Status> {
            pool::free(address, tag)
        }
    }

    fn message(output: &[u8], completion: Completion) -> &str {
        let written = &output[..completion.information];
        assert_eq!(written.last(), Some(&0));
        std::str::from_utf8(&written[..written.len() - 1]).unwrap()
    }

    #[test]
    fn test_create_close() {
        let device = ControlDevice::new(EMPTY);
        assert_eq!(device.create_close(), Completion::success());
        assert_eq!(device.name(), r"\Device\kcall");
    }

    #[test]
    fn test_wrong_ioctl_code() {
        let device = ControlDevice::new(EMPTY);
        let mut output = [0xEEu8; 32];
        let completion = unsafe { device.device_control(0x1234, &[5], &mut output) };
        assert_eq!(completion.status, Status::INVALID_DEVICE_REQUEST);
        assert_eq!(completion.information, 0);
        assert!(output.iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_unknown_request_diagnostic() {
        let device = ControlDevice::new(EMPTY);
        let mut output = [0u8; 64];
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, &[0xFF], &mut output) };
        assert_eq!(completion.status, Status::INVALID_DEVICE_REQUEST);
        assert_eq!(message(&output, completion), "Unknown request type FF");
    }

    #[test]
    fn test_module_not_found_diagnostic() {
        let device = ControlDevice::new(EMPTY);
        let mut enc = crate::protocol::RequestEncoder::new(256);
        let request = enc.encode_call("ntX", "DoNothing", 0, &[], 0, &[]).unwrap();

        let mut output = [0u8; 64];
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, request, &mut output) };
        assert_eq!(completion.status, Status::UNSUCCESSFUL);
        assert_eq!(message(&output, completion), "Module ntX was not found");
    }

    #[test]
    fn test_allocation_failure() {
        let device = ControlDevice::new(EMPTY);
        let mut enc = crate::protocol::RequestEncoder::new(256);
        let mut slot = 0usize;
        let request = enc
            .encode_allocate(0x1000, &mut slot as *mut usize as usize)
            .unwrap();

        let mut output = [0u8; 64];
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, request, &mut output) };
        assert_eq!(completion.status, Status::UNSUCCESSFUL);
        assert_eq!(message(&output, completion), "Allocation of 4096 bytes failed");
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_diagnostic_truncated() {
        let device = ControlDevice::new(EMPTY);
        let mut output = [0xEEu8; 8];
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, &[0xAB], &mut output) };
        assert_eq!(completion.information, 8);
        assert_eq!(&output, b"Unknown\0");
    }

    #[test]
    fn test_no_output_buffer() {
        let device = ControlDevice::new(EMPTY);
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, &[0xAB], &mut []) };
        assert_eq!(completion.status, Status::INVALID_DEVICE_REQUEST);
        assert_eq!(completion.information, 0);
    }

    #[test]
    fn test_out_of_memory_during_resolution() {
        let device = ControlDevice::new(EmptyKernel {
            exhausted_tag: ALLOCATION_TAG,
        });
        let mut enc = crate::protocol::RequestEncoder::new(256);
        let request = enc.encode_call("ntX", "DoNothing", 0, &[], 0, &[]).unwrap();

        let mut output = [0u8; 64];
        let completion = unsafe { device.device_control(REQUEST_IOCTL_CODE, request, &mut output) };
        assert_eq!(completion.status, Status::NO_MEMORY);
        assert_eq!(message(&output, completion), "Not enough memory");
    }

    #[test]
    fn test_exact_fit() {
        let mut output = [0xEEu8; 4];
        assert_eq!(write_diagnostic(&mut output, format_args!("abc")), 4);
        assert_eq!(&output, b"abc\0");
    }
}
