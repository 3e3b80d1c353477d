//! Bit-stable wire formats of the artifact store.
//!
//! Everything in this crate is defined byte-for-byte: two conforming
//! implementations serializing the same input must produce identical
//! output. Nothing here depends on an async runtime, a database or the
//! network; the engine crate layers those on top.

pub mod base32;
pub mod ca;
pub mod expr;
pub mod hash;
pub mod nar;
pub mod narinfo;
pub mod path_info;
pub mod store_path;

pub use store_path::{StoreDir, StorePath};
