// Thin re-export module: the ledger lives in `blockchain/core.rs`.

pub mod core;
pub use self::core::*;
