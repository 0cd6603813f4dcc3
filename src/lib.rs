//! gradebox: sandboxed execution and repetition harness for grading
//! untrusted program units
//!
//! # Architecture
//!
//! Leaf-first:
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::policy`]: Call whitelist (pure set membership)
//! - [`config::types`]: Sandbox/harness configuration and the error taxonomy
//! - [`config::config`]: JSON configuration file loading
//! - [`config::validator`]: Startup validation
//!
//! ## Program Units ([`unit`])
//! - [`unit::instr`]: Instruction set and call sites
//! - [`unit::value`]: Runtime and wire values
//! - [`unit::compiler`]: Compiler front-end interface
//!
//! ## Isolated Loader ([`loader`])
//! - [`loader::gating`]: Call-site gating against the whitelist
//! - [`loader::cancellation`]: Cancellation checks at loop back edges
//! - [`loader::cfg`]: Control-flow graph and back-edge analysis
//! - [`loader::verify`]: Structural checks of instruction streams
//!
//! ## Managed Runtime ([`runtime`])
//! - [`runtime::interp`]: Interpreter over an isolation context
//! - [`runtime::natives`]: Native library reachable from units
//! - [`runtime::cancel`]: Cooperative cancellation
//! - [`runtime::stdio`]: Stream policy
//!
//! ## Execution Sandbox ([`sandbox`])
//! - [`sandbox::thread`]: In-process worker thread
//! - [`sandbox::process`]: Out-of-process worker with hard kill
//! - [`sandbox::worker`]: The worker role of the gradebox binary
//!
//! ## Repetition Harness ([`harness`]) and Reports ([`report`])
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured security events
//! - [`observability::metrics`]: Prometheus metrics export

// Configuration & Policy
pub mod config;

// Compiled units
pub mod unit;

// Isolated loader
pub mod loader;

// Managed runtime
pub mod runtime;

// Execution sandbox
pub mod sandbox;

// Repetition harness
pub mod harness;

// Result aggregation
pub mod report;

// Observability
pub mod observability;

// CLI entrypoint wiring for the gradebox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
