//! Mergeable approximate sketches
//!
//! Each sketch has an owned representation used by the object mode aggregators and a
//! dense fixed size byte layout used by the buffer mode aggregators. Both layouts
//! describe the same state, converting between them is lossless

pub mod count_min;
pub mod histogram;
pub mod hll;

use snafu::Snafu;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum SketchError {
    #[snafu(display(
        "Can not merge the `{sketch}` sketches with different parameters: `{left}` vs `{right}`"
    ))]
    ParameterMismatch {
        sketch: &'static str,
        left: String,
        right: String,
    },
}

/// Hash the bytes with the stable hash function shared by all of the sketches
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}
