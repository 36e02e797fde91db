//! Core utilities for normql.
//!
//! This crate provides foundational types used throughout normql:
//! - `span`: Source location tracking
//! - `diagnostics`: Parse-time error reporting
//! - `canonical`: Order-stable JSON serialization
//! - `error`: The cache error taxonomy

pub mod canonical;
pub mod diagnostics;
pub mod error;
pub mod span;

pub use canonical::canonical_json;
pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticSeverity};
pub use error::{CacheError, CacheResult};
pub use span::Span;
