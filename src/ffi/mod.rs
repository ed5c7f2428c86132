//! Dynamic call engine
//!
//! Signature (jumlah argumen, tipe argumen, tipe return) baru diketahui saat
//! request datang, bukan saat build. libffi yang menangani calling convention.

mod cif;
mod translate;

pub use cif::{CallSignature, MIN_RETURN_SIZE};
pub use translate::{translate, translate_signature, AbiType, ScalarType};
