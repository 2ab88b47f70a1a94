//! Test utilities for the record queue crates.
//!
//! See the modules for all available utilities.

pub mod tracing;
