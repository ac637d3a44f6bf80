//! Count-min frequency sketch
//!
//! `depth` rows of `width` counters. Row `d` hashes the item with seed `d`, the estimate
//! of an item is the minimal counter among its rows, it never under-estimates.
//!
//! Dense layout: `| total: u64 | depth * width counters: u64 |`

use snafu::ensure;

use super::{ParameterMismatchSnafu, SketchError};
use crate::wire::{ByteReader, ByteWriter, WireError};

/// Default number of the counters per row
pub const DEFAULT_WIDTH: u32 = 2048;
/// Default number of the rows
pub const DEFAULT_DEPTH: u32 = 5;
/// Maximal number of the counters, `width * depth`
pub const MAX_COUNTERS: u64 = 1 << 22;

/// Count-min sketch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMinSketch {
    width: u32,
    depth: u32,
    total: u64,
    counters: Vec<u64>,
}

#[inline]
fn bucket(item: &[u8], row: u32, width: u32) -> usize {
    (xxhash_rust::xxh3::xxh3_64_with_seed(item, row as u64) % width as u64) as usize
}

#[inline]
fn read_u64(span: &[u8], offset: usize) -> u64 {
    let mut array = [0; 8];
    array.copy_from_slice(&span[offset..offset + 8]);
    u64::from_be_bytes(array)
}

#[inline]
fn write_u64(span: &mut [u8], offset: usize, v: u64) {
    span[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
}

impl CountMinSketch {
    /// Create an empty sketch. Caller should guarantee the width and depth are positive
    pub fn new(width: u32, depth: u32) -> Self {
        Self {
            width,
            depth,
            total: 0,
            counters: vec![0; width as usize * depth as usize],
        }
    }

    /// Number of the counters per row
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of the rows
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Sum of the weights added to the sketch
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Size of the dense layout
    #[inline]
    pub const fn dense_size(width: u32, depth: u32) -> usize {
        8 + 8 * width as usize * depth as usize
    }

    /// Add the item with weight
    pub fn add(&mut self, item: &[u8], weight: u64) {
        self.total = self.total.wrapping_add(weight);
        for row in 0..self.depth {
            let index = row as usize * self.width as usize + bucket(item, row, self.width);
            self.counters[index] = self.counters[index].wrapping_add(weight);
        }
    }

    /// Estimated frequency of the item
    pub fn estimate(&self, item: &[u8]) -> u64 {
        (0..self.depth)
            .map(|row| {
                self.counters[row as usize * self.width as usize + bucket(item, row, self.width)]
            })
            .min()
            .unwrap_or(0)
    }

    /// Merge other into self
    pub fn merge(&mut self, other: &Self) -> Result<(), SketchError> {
        ensure!(
            self.width == other.width && self.depth == other.depth,
            ParameterMismatchSnafu {
                sketch: "countMin",
                left: format!("{}x{}", self.depth, self.width),
                right: format!("{}x{}", other.depth, other.width),
            }
        );
        self.total = self.total.wrapping_add(other.total);
        self.counters
            .iter_mut()
            .zip(&other.counters)
            .for_each(|(lhs, rhs)| *lhs = lhs.wrapping_add(*rhs));
        Ok(())
    }

    /// Add the item into the dense span
    pub fn add_dense(span: &mut [u8], width: u32, depth: u32, item: &[u8], weight: u64) {
        write_u64(span, 0, read_u64(span, 0).wrapping_add(weight));
        for row in 0..depth {
            let offset = 8 + 8 * (row as usize * width as usize + bucket(item, row, width));
            write_u64(span, offset, read_u64(span, offset).wrapping_add(weight));
        }
    }

    /// Merge the sketch into the dense span. Caller should guarantee the span is sized for
    /// the parameters of the sketch
    pub fn merge_into_dense(&self, span: &mut [u8]) {
        write_u64(span, 0, read_u64(span, 0).wrapping_add(self.total));
        self.counters.iter().enumerate().for_each(|(i, &counter)| {
            let offset = 8 + 8 * i;
            write_u64(span, offset, read_u64(span, offset).wrapping_add(counter));
        });
    }

    /// Read the sketch from the dense span
    pub fn from_dense(span: &[u8], width: u32, depth: u32) -> Self {
        let len = width as usize * depth as usize;
        Self {
            width,
            depth,
            total: read_u64(span, 0),
            counters: (0..len).map(|i| read_u64(span, 8 + 8 * i)).collect(),
        }
    }

    /// Write the wire payload
    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u8(crate::wire::WIRE_VERSION);
        writer.put_u32(self.width);
        writer.put_u32(self.depth);
        writer.put_u64(self.total);
        self.counters.iter().for_each(|&c| writer.put_u64(c));
    }

    /// Read the wire payload
    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        reader.expect_version()?;
        let width = reader.get_u32()?;
        let depth = reader.get_u32()?;
        if width == 0 || depth == 0 || width as u64 * depth as u64 > MAX_COUNTERS {
            return Err(WireError::Corrupted {
                reason: format!("countMin sketch with shape {depth}x{width}"),
            });
        }
        let total = reader.get_u64()?;
        let counters = (0..width as usize * depth as usize)
            .map(|_| reader.get_u64())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            width,
            depth,
            total,
            counters,
        })
    }
}
