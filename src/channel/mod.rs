//! Channel Layer: control device and request dispatch
//!
//! Prinsip desain:
//! - Satu request ditangani sinkron di thread pemanggil
//! - Tidak ada state bersama antar request
//! - Semua error ditangkap sekali, di `ControlDevice`

mod device;
mod dispatcher;

pub use device::{Completion, ControlDevice};
pub use dispatcher::RequestDispatcher;
