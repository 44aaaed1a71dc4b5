#![forbid(unsafe_code)]
//! PicoFS public API facade.
//!
//! Re-exports the volume interface from `pfs-core` through a stable
//! external surface. Downstream consumers depend on this crate rather
//! than the internal layer crates.

pub use pfs_core::*;
