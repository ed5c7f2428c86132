//! Compile-time identification constants.
//!
//! There is no runtime configuration: every value here is fixed at build time.

/// Packs a 4-character pool tag the way the pool allocator stores it.
const fn pool_tag(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Tag for allocations the bridge makes for itself
pub const ALLOCATION_TAG: u32 = pool_tag(b"Kcal");

/// Tag for allocations made on behalf of ALLOCATE requests
pub const USER_INITIATED_ALLOCATION_TAG: u32 = pool_tag(b"KclU");

/// Externally visible name of the control device
pub const DEVICE_NAME: &str = r"\Device\kcall";

/// Symbolic link callers open to reach the control device
pub const DEVICE_SYMBOLIC_LINK: &str = r"\??\kcall";

const DEVICE_TYPE: u32 = 0x8000;
const METHOD_NEITHER: u32 = 3;
const FILE_ANY_ACCESS: u32 = 0;

const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// The single IOCTL code carrying a request buffer
pub const REQUEST_IOCTL_CODE: u32 = ctl_code(DEVICE_TYPE, 0x800, METHOD_NEITHER, FILE_ANY_ACCESS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ioctl_code() {
        assert_eq!(REQUEST_IOCTL_CODE, 0x8000_2003);
    }

    #[test]
    fn test_pool_tags_are_distinct() {
        assert_ne!(ALLOCATION_TAG, USER_INITIATED_ALLOCATION_TAG);
        assert_eq!(&USER_INITIATED_ALLOCATION_TAG.to_le_bytes(), b"KclU");
    }
}
