//! Utilities

pub mod hash;
pub mod memory;
