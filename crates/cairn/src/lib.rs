#![forbid(unsafe_code)]
//! Cairn public API facade.
//!
//! Re-exports the buffer cache, the device backends, and the shared
//! identifier and error types through one stable interface. This is the
//! crate downstream consumers depend on.

pub use cairn_block::*;
pub use cairn_error::*;
pub use cairn_types::*;
