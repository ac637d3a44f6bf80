//! Merge the persisted chunks into the final rows
//!
//! Rows of different chunks with the same bucket timestamp and dimension values are
//! combined with the combining factories of the metrics. Chunks are folded in parallel
//! and the partial results are reduced pairwise, [`AggregatorFactory::combine`] is
//! associative and commutative so the result does not depend on the split

use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use snafu::{ResultExt, Snafu};

use crate::aggregate::{
    AggregationError, AggregatorFactory, ConfigurationError, merge_aggregator_factories,
};
use crate::common::types::Timestamp;
use crate::common::utils::hash::{HashMap, new_hash_map};
use crate::persist::PersistedChunk;
use crate::row::Row;
use crate::value::Value;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum MergeError {
    #[snafu(display("Invalid metrics of the chunk `{chunk}`"))]
    InvalidMetrics {
        chunk: String,
        source: ConfigurationError,
    },
    #[snafu(display("Failed to combine the metric `{metric}`"))]
    Combine {
        metric: String,
        source: AggregationError,
    },
}

type Result<T> = std::result::Result<T, MergeError>;

/// Hashable form of the dimension values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DimKey {
    Null,
    Long(i64),
    /// Bits of the double, floats are widened
    Double(u64),
    String(String),
    Array(Vec<DimKey>),
}

impl DimKey {
    fn new(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Long(v) => Self::Long(*v),
            Value::Float(v) => Self::Double(f64::from(*v).to_bits()),
            Value::Double(v) => Self::Double(v.to_bits()),
            Value::String(v) => Self::String(v.clone()),
            Value::Array(values) => Self::Array(values.iter().map(Self::new).collect()),
            other => Self::String(other.to_string()),
        }
    }
}

type RowKey = (Timestamp, Vec<DimKey>);

#[derive(Debug)]
struct MergedRow {
    /// Chunk and row of the first appearance, keeps the output stable
    origin: (usize, usize),
    timestamp: Timestamp,
    dimensions: Vec<Value>,
    metrics: Vec<Value>,
}

#[derive(Debug)]
struct Partial {
    rows: HashMap<RowKey, MergedRow>,
}

/// Merges the rows of the persisted chunks
#[derive(Debug)]
pub struct RowMerger {
    dimensions: Vec<String>,
    /// Metrics of all of the chunks, the factory is unknown if the metric can not be
    /// merged
    metrics: Vec<(String, Option<Arc<dyn AggregatorFactory>>)>,
}

impl RowMerger {
    /// Create the merger of the chunks. Dimensions are the union of the dimensions of
    /// the chunks. Metrics that can not be merged are kept as null columns
    pub fn try_new(chunks: &[PersistedChunk]) -> Result<Self> {
        let mut dimensions = Vec::<String>::new();
        chunks
            .iter()
            .flat_map(|chunk| &chunk.dimensions)
            .for_each(|dimension| {
                if !dimensions.contains(dimension) {
                    dimensions.push(dimension.clone());
                }
            });

        let lists = chunks
            .iter()
            .map(|chunk| {
                chunk
                    .metrics
                    .iter()
                    .map(|spec| spec.build())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context(InvalidMetricsSnafu {
                        chunk: chunk.id.to_string(),
                    })
                    .map(Some)
            })
            .collect::<Result<Vec<_>>>()?;
        let metrics = merge_aggregator_factories(&lists)
            .unwrap_or_default()
            .into_iter()
            .map(|merged| {
                if merged.factory.is_none() {
                    tracing::warn!("Metric `{}` can not be merged, it is null", merged.name);
                }
                (merged.name, merged.factory)
            })
            .collect();
        Ok(Self {
            dimensions,
            metrics,
        })
    }

    /// Dimensions of the merged rows
    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    /// Names of the merged metrics
    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Merge the rows of the chunks, ordered by the bucket timestamp then the first
    /// appearance. If `finalize` is true, the metrics are finalized
    #[tracing::instrument(skip_all, fields(chunks = chunks.len()))]
    pub fn merge(&self, chunks: &[PersistedChunk], finalize: bool) -> Result<Vec<Row>> {
        let current_span = tracing::Span::current();
        let indexed = chunks.iter().enumerate().collect::<Vec<_>>();
        let merged = indexed
            .par_iter()
            .try_fold(Partial::default, |partial, &(i, chunk)| {
                let span =
                    tracing::debug_span!(parent: &current_span, "fold_chunk", chunk = %chunk.id);
                let _guard = span.enter();
                self.fold(partial, i, chunk)
            })
            .try_reduce(Partial::default, |lhs, rhs| self.reduce(lhs, rhs))?;

        let mut rows = merged.rows.into_values().collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.timestamp, row.origin));
        tracing::debug!("Merged `{}` rows", rows.len());
        Ok(rows
            .into_iter()
            .map(|row| Row {
                timestamp: row.timestamp,
                dimensions: self.dimensions.iter().cloned().zip(row.dimensions).collect(),
                metrics: self
                    .metrics
                    .iter()
                    .zip(row.metrics)
                    .map(|((name, factory), value)| {
                        let value = match factory {
                            Some(factory) if finalize => factory.finalize_computation(value),
                            _ => value,
                        };
                        (name.clone(), value)
                    })
                    .collect(),
            })
            .collect())
    }

    fn fold(
        &self,
        mut partial: Partial,
        chunk_index: usize,
        chunk: &PersistedChunk,
    ) -> Result<Partial> {
        for (row_index, row) in chunk.rows.iter().enumerate() {
            let dimensions = self
                .dimensions
                .iter()
                .map(|name| row.dimension(name).cloned().unwrap_or_default())
                .collect::<Vec<_>>();
            let metrics = self
                .metrics
                .iter()
                .map(|(name, factory)| {
                    let Some(factory) = factory else {
                        return Ok(Value::Null);
                    };
                    let value = row.metric(name).cloned().unwrap_or_default();
                    factory
                        .deserialize(value)
                        .context(CombineSnafu { metric: name })
                })
                .collect::<Result<Vec<_>>>()?;
            let key = (row.timestamp, dimensions.iter().map(DimKey::new).collect());
            let merged = MergedRow {
                origin: (chunk_index, row_index),
                timestamp: row.timestamp,
                dimensions,
                metrics,
            };
            self.insert(&mut partial, key, merged)?;
        }
        Ok(partial)
    }

    fn reduce(&self, mut lhs: Partial, rhs: Partial) -> Result<Partial> {
        for (key, row) in rhs.rows {
            self.insert(&mut lhs, key, row)?;
        }
        Ok(lhs)
    }

    fn insert(&self, partial: &mut Partial, key: RowKey, row: MergedRow) -> Result<()> {
        match partial.rows.get_mut(&key) {
            Some(existing) => {
                existing.origin = existing.origin.min(row.origin);
                for (((name, factory), lhs), rhs) in
                    self.metrics.iter().zip(&mut existing.metrics).zip(row.metrics)
                {
                    let Some(factory) = factory else {
                        continue;
                    };
                    let value = std::mem::take(lhs);
                    *lhs = factory
                        .combine(value, rhs)
                        .context(CombineSnafu { metric: name })?;
                }
            }
            None => {
                partial.rows.insert(key, row);
            }
        }
        Ok(())
    }
}

impl Default for Partial {
    fn default() -> Self {
        Self {
            rows: new_hash_map(),
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregatorSpec;
    use crate::aggregate::spec::InputSpec;
    use crate::common::uuid::ChunkId;
    use crate::index::IncrementalIndex;
    use crate::index::schema::{IncrementalIndexSchema, IndexConfig};
    use crate::index::tests::{row, sum_schema};
    use crate::row::RowsTable;

    fn chunk(schema: IncrementalIndexSchema, rows: &[(i64, &str, i64)]) -> PersistedChunk {
        let mut index = IncrementalIndex::try_new(schema, IndexConfig::default()).unwrap();
        for &(timestamp, dim, v) in rows {
            index.add(row(timestamp, dim, v)).unwrap();
        }
        PersistedChunk::from_index(ChunkId::random(), &index)
    }

    #[test]
    fn test_merge_chunks() -> Report<MergeError> {
        Report::capture(|| {
            let chunks = vec![
                chunk(sum_schema(), &[(60_000, "b", 4), (0, "a", 1)]),
                chunk(sum_schema(), &[(0, "a", 2), (0, "c", 3)]),
                chunk(sum_schema(), &[(60_000, "b", 5)]),
            ];
            let merger = RowMerger::try_new(&chunks)?;
            let rows = merger.merge(&chunks, true)?;
            expect_test::expect![[r#"
                ┌──────────────────────┬─────┬───────┬─────┐
                │ __time               │ dim │ count │ sum │
                ├──────────────────────┼─────┼───────┼─────┤
                │ 1970-01-01T00:00:00Z │ a   │ 2     │ 3   │
                ├──────────────────────┼─────┼───────┼─────┤
                │ 1970-01-01T00:00:00Z │ c   │ 1     │ 3   │
                ├──────────────────────┼─────┼───────┼─────┤
                │ 1970-01-01T00:01:00Z │ b   │ 2     │ 9   │
                └──────────────────────┴─────┴───────┴─────┘"#]]
            .assert_eq(&RowsTable(&rows).to_string());
            Ok(())
        })
    }

    #[test]
    fn test_unmergeable_metric_is_null() -> Report<MergeError> {
        Report::capture(|| {
            let max_schema = IncrementalIndexSchema::new(vec![
                AggregatorSpec::Count {
                    name: "count".to_string(),
                    filter: None,
                },
                AggregatorSpec::LongMax(InputSpec::field("sum", "v")),
            ]);
            let chunks = vec![
                chunk(sum_schema(), &[(0, "a", 1)]),
                chunk(max_schema, &[(0, "a", 2)]),
            ];
            let merger = RowMerger::try_new(&chunks)?;
            assert_eq!(merger.metric_names(), vec!["count", "sum"]);
            for finalize in [true, false] {
                let rows = merger.merge(&chunks, finalize)?;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].metric("count"), Some(&Value::Long(2)));
                assert_eq!(rows[0].metric("sum"), Some(&Value::Null));
            }
            Ok(())
        })
    }
}
