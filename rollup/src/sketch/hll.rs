//! HyperLogLog cardinality sketch
//!
//! Registers are stored one per byte, the dense layout is exactly the register array.
//! Hashes are the 64 bits xxh3 hash, the first `log2m` bits select the register

use snafu::ensure;

use super::{ParameterMismatchSnafu, SketchError};
use crate::wire::{ByteReader, ByteWriter, WireError};

/// Minimal supported `log2m`
pub const MIN_LOG2M: u8 = 4;
/// Maximal supported `log2m`
pub const MAX_LOG2M: u8 = 16;
/// Default `log2m`, 2048 registers
pub const DEFAULT_LOG2M: u8 = 11;

/// HyperLogLog sketch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    log2m: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Create an empty sketch. Caller should guarantee `log2m` is in
    /// [`MIN_LOG2M`]..=[`MAX_LOG2M`]
    pub fn new(log2m: u8) -> Self {
        debug_assert!((MIN_LOG2M..=MAX_LOG2M).contains(&log2m));
        Self {
            log2m,
            registers: vec![0; 1 << log2m],
        }
    }

    /// Number of the registers
    #[inline]
    pub fn log2m(&self) -> u8 {
        self.log2m
    }

    /// Size of the dense layout
    #[inline]
    pub const fn dense_size(log2m: u8) -> usize {
        1 << log2m
    }

    /// Add the hash of an item
    #[inline]
    pub fn add_hash(&mut self, hash: u64) {
        add_hash_to_registers(&mut self.registers, self.log2m, hash)
    }

    /// Merge other into self
    pub fn merge(&mut self, other: &Self) -> Result<(), SketchError> {
        ensure!(
            self.log2m == other.log2m,
            ParameterMismatchSnafu {
                sketch: "hyperUnique",
                left: format!("log2m={}", self.log2m),
                right: format!("log2m={}", other.log2m),
            }
        );
        merge_registers(&mut self.registers, &other.registers);
        Ok(())
    }

    /// Estimated cardinality
    #[inline]
    pub fn estimate(&self) -> f64 {
        estimate_registers(&self.registers)
    }

    /// Returns true if no item is added
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// View the dense span as sketch
    pub fn from_dense(span: &[u8], log2m: u8) -> Self {
        Self {
            log2m,
            registers: span[..Self::dense_size(log2m)].to_vec(),
        }
    }

    /// Registers in the dense layout
    #[inline]
    pub fn as_dense(&self) -> &[u8] {
        &self.registers
    }

    /// Write the wire payload
    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u8(crate::wire::WIRE_VERSION);
        writer.put_u8(self.log2m);
        writer.put_slice(&self.registers);
    }

    /// Read the wire payload
    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        reader.expect_version()?;
        let log2m = reader.get_u8()?;
        if !(MIN_LOG2M..=MAX_LOG2M).contains(&log2m) {
            return Err(WireError::Corrupted {
                reason: format!("hyperUnique log2m `{log2m}` out of range"),
            });
        }
        let registers = reader.take(Self::dense_size(log2m))?.to_vec();
        Ok(Self { log2m, registers })
    }
}

/// Add the hash to the dense registers
#[inline]
pub fn add_hash_to_registers(registers: &mut [u8], log2m: u8, hash: u64) {
    let index = (hash >> (64 - log2m as u32)) as usize;
    // Sentinel bit guarantees the rank is at most `64 - log2m + 1`
    let w = (hash << log2m) | (1 << (log2m - 1));
    let rank = w.leading_zeros() as u8 + 1;
    if registers[index] < rank {
        registers[index] = rank;
    }
}

/// Merge the dense registers of `src` into `dst`
#[inline]
pub fn merge_registers(dst: &mut [u8], src: &[u8]) {
    dst.iter_mut()
        .zip(src)
        .for_each(|(d, &s)| *d = std::cmp::max(*d, s));
}

/// Estimate the cardinality of the dense registers
pub fn estimate_registers(registers: &[u8]) -> f64 {
    let m = registers.len() as f64;
    let (sum, zeros) = registers.iter().fold((0.0_f64, 0_usize), |(sum, zeros), &r| {
        (sum + 1.0 / (1_u64 << r) as f64, zeros + (r == 0) as usize)
    });
    let alpha = match registers.len() {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m),
    };
    let raw = alpha * m * m / sum;
    if raw <= 2.5 * m && zeros > 0 {
        // Linear counting for the small cardinalities
        m * (m / zeros as f64).ln()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::hash_bytes;

    #[test]
    fn test_estimate_error() {
        let mut hll = HyperLogLog::new(DEFAULT_LOG2M);
        assert_eq!(hll.estimate(), 0.0);
        (0..10000_u32).for_each(|i| hll.add_hash(hash_bytes(&i.to_be_bytes())));
        let estimate = hll.estimate();
        assert!((estimate - 10000.0).abs() / 10000.0 < 0.05, "{estimate}");
    }

    #[test]
    fn test_merge_is_union() {
        let mut lhs = HyperLogLog::new(8);
        let mut rhs = HyperLogLog::new(8);
        let mut all = HyperLogLog::new(8);
        (0..300_u32).for_each(|i| {
            let hash = hash_bytes(&i.to_be_bytes());
            if i % 2 == 0 {
                lhs.add_hash(hash);
            } else {
                rhs.add_hash(hash);
            }
            all.add_hash(hash);
        });
        lhs.merge(&rhs).unwrap();
        assert_eq!(lhs, all);

        let err = lhs.merge(&HyperLogLog::new(9)).unwrap_err();
        expect_test::expect!["Can not merge the `hyperUnique` sketches with different parameters: `log2m=8` vs `log2m=9`"]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let mut hll = HyperLogLog::new(DEFAULT_LOG2M);
        (0..100).for_each(|_| hll.add_hash(hash_bytes(b"a")));
        (0..100).for_each(|_| hll.add_hash(hash_bytes(b"b")));
        assert_eq!(hll.estimate().round(), 2.0);
    }
}
