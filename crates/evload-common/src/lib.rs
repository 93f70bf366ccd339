//! evload Common Library
//!
//! Shared functionality used across all evload workspace members:
//!
//! - **Error Handling**: the [`EtlError`] type and result alias
//! - **Checksums**: streaming SHA-256 for file-level delta detection
//! - **Logging**: centralized `tracing` subscriber initialization

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
