//! kcall: privileged call bridge
//!
//! Menerima request biner dari caller, lalu memanggil routine yang di-export
//! module yang sedang di-load, membaca/menulis memori, atau alokasi pool.
//!
//! Layers:
//! - `protocol`: cursor, request decoding, request encoding
//! - `ffi`: type translation dan call engine (libffi)
//! - `kernel`: privileged services, module directory, export lookup
//! - `channel`: dispatcher dan control device

pub mod channel;
pub mod config;
pub mod error;
pub mod ffi;
pub mod kernel;
pub mod protocol;

pub use channel::{Completion, ControlDevice, RequestDispatcher};
pub use error::{Error, Result, SignatureFault, Status};
