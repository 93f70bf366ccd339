//! evload Core Library
//!
//! The streaming ETL engine for ICH E2B(R3) Individual Case Safety Reports:
//!
//! - [`source`]: URI-addressable byte sources (local paths, globs, S3/GCS/Azure)
//! - [`extract`]: namespace-aware streaming XML extraction of ICSR records
//! - [`transform`]: fan-out into per-table CSV buffers (normalized) or a
//!   single deduplicated audit buffer
//! - [`loader`]: database capability interface, backend registry, and the
//!   PostgreSQL bulk-load backend
//! - [`orchestrator`]: file discovery, delta filtering, the worker pool,
//!   and quarantine handling
//!
//! Data flow per file: source → extract → transform → loader
//! (staging → merge → history), one transaction per file.

pub mod config;
pub mod extract;
pub mod loader;
pub mod orchestrator;
pub mod schema;
pub mod source;
pub mod transform;
