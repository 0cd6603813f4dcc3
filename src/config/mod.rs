//! Configuration and policy
//!
//! Sandbox and harness settings, the call whitelist, config file loading
//! and validation.

pub mod config;
pub mod policy;
pub mod types;
pub mod validator;
