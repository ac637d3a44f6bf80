//! Streaming approximate histogram with a bounded number of bins
//!
//! Each bin is a `(centroid, count)` pair. When a new value would exceed the resolution,
//! the two closest adjacent bins are merged into their weighted centroid. Quantiles are
//! interpolated over the cumulative counts of the bins, clamped by the exact minimum and
//! maximum.
//!
//! Dense layout:
//!
//! ```text
//! | count: u64 | min: f64 | max: f64 | num_bins: u32 | padding: u32 | resolution * (centroid: f64, count: u64) |
//! ```

use crate::wire::{ByteReader, ByteWriter, WireError};

/// Default number of the bins
pub const DEFAULT_RESOLUTION: usize = 50;
/// Maximal number of the bins
pub const MAX_RESOLUTION: usize = 1 << 16;

const HEADER_SIZE: usize = 32;
const BIN_SIZE: usize = 16;

/// Approximate histogram
#[derive(Debug, Clone, PartialEq)]
pub struct ApproximateHistogram {
    resolution: usize,
    centroids: Vec<f64>,
    counts: Vec<u64>,
    count: u64,
    min: f64,
    max: f64,
}

impl ApproximateHistogram {
    /// Create an empty histogram
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution,
            centroids: Vec::new(),
            counts: Vec::new(),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Size of the dense layout
    #[inline]
    pub const fn dense_size(resolution: usize) -> usize {
        HEADER_SIZE + resolution * BIN_SIZE
    }

    /// Number of the values offered to the histogram
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of the bins in use
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.centroids.len()
    }

    /// Maximal number of the bins
    #[inline]
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// Exact minimum, `None` if empty
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Exact maximum, `None` if empty
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Heap size of the histogram
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.centroids.capacity() * BIN_SIZE
    }

    /// Offer a value. NaN is ignored
    pub fn offer(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.insert_bin(value, 1);
        self.compress();
    }

    /// Merge other into self. The resolution of self is kept
    pub fn merge(&mut self, other: &Self) {
        other
            .centroids
            .iter()
            .zip(&other.counts)
            .for_each(|(&centroid, &count)| {
                self.insert_bin(centroid, count);
                self.count -= count;
            });
        self.count += other.count;
        if other.count > 0 {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.compress();
    }

    fn insert_bin(&mut self, centroid: f64, count: u64) {
        self.count += count;
        self.min = self.min.min(centroid);
        self.max = self.max.max(centroid);
        match self
            .centroids
            .binary_search_by(|probe| probe.total_cmp(&centroid))
        {
            Ok(index) => self.counts[index] += count,
            Err(index) => {
                self.centroids.insert(index, centroid);
                self.counts.insert(index, count);
            }
        }
    }

    fn compress(&mut self) {
        while self.centroids.len() > self.resolution {
            // Find the closest adjacent pair, ties resolved to the left
            let index = self
                .centroids
                .windows(2)
                .enumerate()
                .fold((0, f64::INFINITY), |(best, gap), (i, pair)| {
                    let delta = pair[1] - pair[0];
                    if delta < gap { (i, delta) } else { (best, gap) }
                })
                .0;
            let (lc, rc) = (self.counts[index], self.counts[index + 1]);
            let total = lc + rc;
            self.centroids[index] = (self.centroids[index] * lc as f64
                + self.centroids[index + 1] * rc as f64)
                / total as f64;
            self.counts[index] = total;
            self.centroids.remove(index + 1);
            self.counts.remove(index + 1);
        }
    }

    /// Approximate quantile, `q` is clamped to `[0, 1]`. Returns NaN if empty
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let q = q.clamp(0.0, 1.0);
        let target = q * self.count as f64;

        // Piecewise linear function through (min, 0), (centroid_i, cumulative_i) and
        // (max, count). The cumulative count of a bin is taken at its center
        let mut prev = (self.min, 0.0);
        let mut cumulative = 0.0;
        for (&centroid, &count) in self.centroids.iter().zip(&self.counts) {
            let point = (centroid, cumulative + count as f64 / 2.0);
            if target <= point.1 {
                return interpolate(prev, point, target);
            }
            cumulative += count as f64;
            prev = point;
        }
        interpolate(prev, (self.max, self.count as f64), target)
    }

    /// Approximate quantiles
    pub fn quantiles(&self, qs: &[f64]) -> Vec<f64> {
        qs.iter().map(|&q| self.quantile(q)).collect()
    }

    /// Read the histogram from the dense span
    pub fn from_dense(span: &[u8], resolution: usize) -> Self {
        let read_u64 = |offset: usize| {
            let mut array = [0; 8];
            array.copy_from_slice(&span[offset..offset + 8]);
            u64::from_be_bytes(array)
        };
        let count = read_u64(0);
        let min = f64::from_bits(read_u64(8));
        let max = f64::from_bits(read_u64(16));
        let num_bins = (read_u64(24) >> 32) as usize;
        let (centroids, counts) = (0..num_bins)
            .map(|i| {
                let offset = HEADER_SIZE + i * BIN_SIZE;
                (f64::from_bits(read_u64(offset)), read_u64(offset + 8))
            })
            .unzip();
        Self {
            resolution,
            centroids,
            counts,
            count,
            min,
            max,
        }
    }

    /// Write the histogram into the dense span. Caller should guarantee the resolution of
    /// self is not larger than the resolution the span is sized for
    pub fn write_dense(&self, span: &mut [u8]) {
        let mut write_u64 = |offset: usize, v: u64| {
            span[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
        };
        write_u64(0, self.count);
        write_u64(8, self.min.to_bits());
        write_u64(16, self.max.to_bits());
        write_u64(24, (self.centroids.len() as u64) << 32);
        self.centroids
            .iter()
            .zip(&self.counts)
            .enumerate()
            .for_each(|(i, (&centroid, &count))| {
                let offset = HEADER_SIZE + i * BIN_SIZE;
                write_u64(offset, centroid.to_bits());
                write_u64(offset + 8, count);
            });
    }

    /// Write the wire payload
    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u8(crate::wire::WIRE_VERSION);
        writer.put_u32(self.resolution as u32);
        writer.put_u64(self.count);
        writer.put_f64(self.min);
        writer.put_f64(self.max);
        writer.put_u32(self.centroids.len() as u32);
        self.centroids
            .iter()
            .zip(&self.counts)
            .for_each(|(&centroid, &count)| {
                writer.put_f64(centroid);
                writer.put_u64(count);
            });
    }

    /// Read the wire payload
    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        reader.expect_version()?;
        let resolution = reader.get_u32()? as usize;
        let count = reader.get_u64()?;
        let min = reader.get_f64()?;
        let max = reader.get_f64()?;
        let num_bins = reader.get_u32()? as usize;
        if resolution == 0 || resolution > MAX_RESOLUTION || num_bins > resolution {
            return Err(WireError::Corrupted {
                reason: format!(
                    "histogram with `{num_bins}` bins and resolution `{resolution}`"
                ),
            });
        }
        let mut centroids = Vec::with_capacity(num_bins);
        let mut counts = Vec::with_capacity(num_bins);
        for _ in 0..num_bins {
            centroids.push(reader.get_f64()?);
            counts.push(reader.get_u64()?);
        }
        Ok(Self {
            resolution,
            centroids,
            counts,
            count,
            min,
            max,
        })
    }
}

#[inline]
fn interpolate((x0, y0): (f64, f64), (x1, y1): (f64, f64), y: f64) -> f64 {
    if y1 <= y0 {
        return x1;
    }
    x0 + (x1 - x0) * (y - y0) / (y1 - y0)
}
