//! Policy modules
//!
//! Call whitelisting for sandboxed code.

pub mod whitelist;

// Re-export commonly used items
pub use whitelist::*;
