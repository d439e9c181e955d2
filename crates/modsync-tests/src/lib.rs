//! modsync Testing Suite
//!
//! This crate holds the cross-crate integration tests and benchmarks for modsync,
//! together with the fixtures they share:
//!
//! - **Mock repository**: An in-memory repository tree with scripted faults
//! - **Test utilities**: Data generators, local fixture trees and fast engine settings

#![warn(missing_docs)]
#![warn(clippy::all)]

/// In-memory repository with scripted faults
pub mod mock_repository;

/// Unified test utilities
///
/// Common helpers used across the integration tests and benchmarks.
pub mod test_utils;

pub use mock_repository::{MockClient, MockFactory, MockRepository};
