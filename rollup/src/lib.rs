#![warn(clippy::todo)]
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::private_intra_doc_links,
    rust_2018_idioms,
    missing_docs,
    clippy::needless_borrow,
    clippy::redundant_clone,
    missing_debug_implementations
)]

//! # Rollup
//!
//! `Rollup` is the aggregation and in-memory rollup engine of an analytical store.
//! It computes per-group summary statistics over row streams in two modes:
//!
//! - object mode: each group owns boxed [`Aggregator`]s, flexible and used when merging
//! partial results
//!
//! - buffer mode: each group owns a span of bytes in an arena and stateless
//! [`BufferAggregator`]s update it in place, dense and used during ingestion
//!
//! Partial states can be combined across nodes, serialized into a versioned wire format
//! and identified by deterministic cache keys.
//!
//! [`Aggregator`]: crate::aggregate::Aggregator
//! [`BufferAggregator`]: crate::aggregate::BufferAggregator

pub mod aggregate;
pub mod cache_key;
pub mod common;
pub mod error;
pub mod expr;
pub mod filter;
pub mod granularity;
pub mod index;
pub mod merge;
pub mod metric;
pub mod persist;
pub mod row;
pub mod selector;
pub mod sketch;
pub mod value;
pub mod wire;

/// Name of the column that holds the timestamp of the row
pub const TIME_COLUMN: &str = "__time";

mod private {
    /// Sealed trait protect against downstream implementations
    pub trait Sealed {}
}
