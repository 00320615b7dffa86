//! Shared services for the Vesper crates.

pub mod collections;
pub mod log;
