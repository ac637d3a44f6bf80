//! Common type alias

/// Milliseconds since the unix epoch
pub type Timestamp = i64;

/// Result type of the hash function
pub type HashValue = u64;
