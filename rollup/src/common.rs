//! Common utilities shared by all of the modules

pub mod profiler;
pub mod types;
pub mod utils;
pub mod uuid;
