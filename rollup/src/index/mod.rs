//! Incremental index, the mutable rollup table of the ingestion
//!
//! Rows are keyed by the bucket of their timestamp and their dimension values. In the
//! rollup mode, rows with the same key are aggregated into the same group. Otherwise,
//! every row is a group.
//!
//! # States
//!
//! - `Open`: accepts rows
//!
//! - `Full`: the row ceiling is reached, or the sampled estimated bytes exceed the byte
//! ceiling. Rows of the existing groups are still aggregated, rows of the new groups
//! are rejected with [`IndexError::IndexSizeExceeded`]. The caller should persist the
//! index and retry the row with a fresh index
//!
//! - `Closed`: the aggregators are closed, `add` is rejected
//!
//! The index is single writer, `add` takes `&mut self`. It is `Send`, the ownership of a
//! full index can be transferred to the persister

mod arena;
mod dimension;
pub mod schema;

use std::sync::Arc;

use hashbrown::HashTable;
use rollup_procedural_macro::MetricsSetBuilder;
use snafu::{ResultExt, Snafu, ensure};

use self::arena::{SlotId, SlotLayout, SpanArena};
use self::dimension::{Dimensions, GroupKey};
use self::schema::{AggregationMode, IncrementalIndexSchema, IndexConfig};
use crate::aggregate::{
    AggregationError, Aggregator, AggregatorFactory, BufferAggregator, ConfigurationError,
};
use crate::common::profiler::ScopedTimerGuard;
use crate::common::types::{HashValue, Timestamp};
use crate::common::uuid::IndexId;
use crate::granularity::{Bucketer, GranularityError};
use crate::metric::{Count, Time};
use crate::row::{InputRow, Row};
use crate::selector::{ParsePolicy, RowPointer, RowSelectorFactory};
use crate::value::{Value, ValueError};

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    #[snafu(display("Index is full with `{rows}` rows and `{bytes}` estimated bytes"))]
    IndexSizeExceeded { rows: usize, bytes: usize },
    #[snafu(display(
        "Timestamp `{timestamp}` of the row is smaller than the min timestamp `{min_timestamp}`"
    ))]
    TimestampTooEarly {
        timestamp: Timestamp,
        min_timestamp: Timestamp,
    },
    #[snafu(display("Malformed value of the dimension `{dimension}`"))]
    MalformedDimension { dimension: String, source: ValueError },
    #[snafu(display("Failed to aggregate the row"))]
    Aggregate { source: AggregationError },
    #[snafu(display("Index `{id}` is closed"))]
    Closed { id: IndexId },
    #[snafu(display("Invalid metrics of the index"))]
    InvalidMetrics { source: ConfigurationError },
    #[snafu(display("Invalid granularity of the index"))]
    InvalidGranularity { source: GranularityError },
}

/// Result of the index
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Returns true if the caller should persist the index and retry the row
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, Self::IndexSizeExceeded { .. })
    }

    /// Returns true if the row is rejected because of its malformed values
    pub fn is_parse_error(&self) -> bool {
        match self {
            Self::MalformedDimension { .. } => true,
            Self::Aggregate { source } => source.is_malformed(),
            _ => false,
        }
    }
}

/// State of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Accepts rows
    Open,
    /// Only accepts the rows of the existing groups
    Full,
    /// Accepts nothing
    Closed,
}

/// Metrics of the index
#[derive(Debug, Default, MetricsSetBuilder)]
pub struct IndexMetrics {
    /// Number of the rows aggregated into the index
    pub rows_ingested: Count,
    /// Number of the rows aggregated into an existing group
    pub rows_rolled_up: Count,
    /// Number of the rows rejected because of the malformed values
    pub invalid_rows: Count,
    /// Number of the groups created
    pub new_groups: Count,
    /// Time spent in `add`
    pub add_time: Time,
}

#[derive(Debug)]
struct Group {
    key: GroupKey,
    hash: HashValue,
}

/// States of the groups, indexed by the position of the group
#[derive(Debug)]
enum States {
    Object {
        aggregators: Vec<Vec<Box<dyn Aggregator>>>,
    },
    Buffer {
        arena: SpanArena,
        aggregators: Vec<Box<dyn BufferAggregator>>,
        slots: Vec<SlotId>,
    },
}

/// Mutable rollup table
#[derive(Debug)]
pub struct IncrementalIndex {
    id: IndexId,
    schema: IncrementalIndexSchema,
    config: IndexConfig,
    factories: Arc<[Arc<dyn AggregatorFactory>]>,
    bucketer: Bucketer,
    dimensions: Dimensions,
    selectors: RowSelectorFactory,
    groups: Vec<Group>,
    /// Positions of the groups, only used in the rollup mode
    table: HashTable<usize>,
    states: States,
    state: IndexState,
    /// Bytes of the group keys and the object mode states with fixed size
    fixed_bytes: usize,
    rows_since_check: usize,
    min_time: Option<Timestamp>,
    max_time: Option<Timestamp>,
    metrics: Arc<IndexMetrics>,
}

impl IncrementalIndex {
    /// Create an empty index
    pub fn try_new(schema: IncrementalIndexSchema, config: IndexConfig) -> Result<Self> {
        let factories = schema.build_metrics().context(InvalidMetricsSnafu)?;
        Self::from_parts(schema, config, factories.into(), &[])
    }

    /// Create an empty index, the discovered dimensions start with `dimension_order`
    pub fn try_new_with_dimension_order(
        schema: IncrementalIndexSchema,
        config: IndexConfig,
        dimension_order: &[String],
    ) -> Result<Self> {
        let factories = schema.build_metrics().context(InvalidMetricsSnafu)?;
        Self::from_parts(schema, config, factories.into(), dimension_order)
    }

    /// Create an empty index with the same schema and configuration, its dimensions
    /// start with the dimensions discovered by self
    pub fn try_successor(&self) -> Result<Self> {
        Self::from_parts(
            self.schema.clone(),
            self.config,
            Arc::clone(&self.factories),
            &self.dimensions.names(),
        )
    }

    fn from_parts(
        schema: IncrementalIndexSchema,
        config: IndexConfig,
        factories: Arc<[Arc<dyn AggregatorFactory>]>,
        dimension_order: &[String],
    ) -> Result<Self> {
        let bucketer = schema.granularity.bucketer().context(InvalidGranularitySnafu)?;
        let selectors =
            RowSelectorFactory::new(Arc::new(RowPointer::default()), config.parse_policy);
        let states = match config.mode {
            AggregationMode::Object => States::Object {
                aggregators: Vec::new(),
            },
            AggregationMode::Buffer => States::Buffer {
                arena: SpanArena::new(SlotLayout::new(&factories)),
                aggregators: factories
                    .iter()
                    .map(|factory| factory.factorize_buffered(&selectors))
                    .collect::<std::result::Result<_, _>>()
                    .context(AggregateSnafu)?,
                slots: Vec::new(),
            },
        };

        Ok(Self {
            id: IndexId::random(),
            dimensions: Dimensions::new(schema.dimensions_spec.clone(), dimension_order),
            schema,
            config,
            factories,
            bucketer,
            selectors,
            groups: Vec::new(),
            table: HashTable::new(),
            states,
            state: IndexState::Open,
            fixed_bytes: 0,
            rows_since_check: 0,
            min_time: None,
            max_time: None,
            metrics: Arc::new(IndexMetrics::default()),
        })
    }

    /// Aggregate the row. Returns the number of the groups after adding the row
    ///
    /// # Errors
    ///
    /// - [`IndexError::IndexSizeExceeded`]: the row needs a new group but the index is
    ///   full. The row is not aggregated
    ///
    /// - parse errors in the strict mode, see [`IndexError::is_parse_error`]. The row is
    ///   not aggregated and counted as invalid
    pub fn add(&mut self, row: InputRow) -> Result<usize> {
        ensure!(self.state != IndexState::Closed, ClosedSnafu { id: self.id });

        let metrics = Arc::clone(&self.metrics);
        let _guard = ScopedTimerGuard::new(&metrics.add_time);
        let row = Arc::new(row);
        self.selectors.pointer().set(Arc::clone(&row));
        let result = self.add_row(&row);
        self.selectors.pointer().clear();

        match &result {
            Ok(_) => metrics.rows_ingested.add(1),
            Err(e) if e.is_parse_error() => metrics.invalid_rows.add(1),
            Err(_) => (),
        }
        result
    }

    fn add_row(&mut self, row: &InputRow) -> Result<usize> {
        if let Some(min_timestamp) = self.schema.min_timestamp {
            ensure!(
                row.timestamp >= min_timestamp,
                TimestampTooEarlySnafu {
                    timestamp: row.timestamp,
                    min_timestamp
                }
            );
        }

        let known = self.dimensions.len();
        let discovered = self.dimensions.discover(row);
        let result = self.add_discovered(row);
        if result.is_err() {
            // Rejected rows do not extend the dimensions
            self.dimensions.truncate(known);
        } else if discovered > 0 {
            tracing::debug!(
                "Index `{}` discovered {} new dimensions, dimensions: {:?}",
                self.id,
                discovered,
                self.dimensions.names()
            );
        }
        result
    }

    fn add_discovered(&mut self, row: &InputRow) -> Result<usize> {
        let key = GroupKey {
            timestamp: self.bucketer.truncate(row.timestamp),
            dims: self.dimensions.encode(row, self.config.parse_policy)?,
        };
        let hash = key.hash_value();

        let existing = if self.schema.rollup {
            self.table
                .find(hash, |&position| self.groups[position].key == key)
                .copied()
        } else {
            None
        };

        match existing {
            Some(position) => {
                self.aggregate_group(position)?;
                self.metrics.rows_rolled_up.add(1);
            }
            None => self.allocate_group(key, hash)?,
        }

        self.rows_since_check += 1;
        if self.rows_since_check >= self.config.byte_check_interval {
            self.rows_since_check = 0;
            self.check_bytes();
        }
        Ok(self.groups.len())
    }

    #[inline]
    fn is_strict(&self) -> bool {
        self.config.parse_policy == ParsePolicy::Strict
    }

    /// Aggregate the current row into the existing group
    fn aggregate_group(&mut self, position: usize) -> Result<()> {
        let strict = self.is_strict();
        match &mut self.states {
            States::Object { aggregators } => aggregate_objects(&mut aggregators[position], strict),
            States::Buffer {
                arena,
                aggregators,
                slots,
            } => aggregate_spans(arena, slots[position], aggregators, strict),
        }
    }

    /// Create a new group for the current row
    fn allocate_group(&mut self, key: GroupKey, hash: HashValue) -> Result<()> {
        ensure!(
            self.state == IndexState::Open && self.groups.len() < self.config.max_rows,
            IndexSizeExceededSnafu {
                rows: self.groups.len(),
                bytes: self.estimated_bytes(),
            }
        );

        let strict = self.is_strict();
        let mut bytes = key.estimated_size();
        match &mut self.states {
            States::Object { aggregators } => {
                let mut group = self
                    .factories
                    .iter()
                    .map(|factory| factory.factorize(&self.selectors))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context(AggregateSnafu)?;
                aggregate_objects(&mut group, strict)?;
                bytes += self
                    .factories
                    .iter()
                    .filter(|factory| !factory.requires_size_estimation())
                    .map(|factory| factory.max_intermediate_size())
                    .sum::<usize>()
                    + group.len() * std::mem::size_of::<Box<dyn Aggregator>>();
                aggregators.push(group);
            }
            States::Buffer {
                arena,
                aggregators,
                slots,
            } => {
                let slot = arena.alloc();
                init_spans(arena, slot, aggregators);
                if let Err(e) = aggregate_spans(arena, slot, aggregators, strict) {
                    arena.release_last(slot);
                    return Err(e);
                }
                slots.push(slot);
            }
        }

        self.fixed_bytes += bytes;
        self.min_time = Some(self.min_time.map_or(key.timestamp, |t| t.min(key.timestamp)));
        self.max_time = Some(self.max_time.map_or(key.timestamp, |t| t.max(key.timestamp)));
        let position = self.groups.len();
        if self.schema.rollup {
            let groups = &self.groups;
            self.table.insert_unique(hash, position, |&p| groups[p].hash);
        }
        self.groups.push(Group { key, hash });
        self.metrics.new_groups.add(1);

        if self.groups.len() >= self.config.max_rows {
            self.become_full();
        }
        Ok(())
    }

    fn check_bytes(&mut self) {
        if let Some(max_bytes) = self.config.max_bytes {
            let bytes = self.estimated_bytes();
            if bytes >= max_bytes {
                tracing::debug!(
                    "Index `{}` estimated bytes `{}` reach the ceiling `{}`",
                    self.id,
                    bytes,
                    max_bytes
                );
                self.become_full();
            }
        }
    }

    fn become_full(&mut self) {
        if self.state == IndexState::Open {
            tracing::info!(
                "Index `{}` is full with `{}` rows and `{}` estimated bytes",
                self.id,
                self.groups.len(),
                self.estimated_bytes()
            );
            self.state = IndexState::Full;
        }
    }

    /// Close the aggregators, the failures are logged
    pub fn close(&mut self) {
        if self.state == IndexState::Closed {
            return;
        }
        let results: Vec<std::result::Result<(), AggregationError>> = match &mut self.states {
            States::Object { aggregators } => aggregators
                .iter_mut()
                .flat_map(|group| group.iter_mut().map(|aggregator| aggregator.close()))
                .collect(),
            States::Buffer { aggregators, .. } => aggregators
                .iter_mut()
                .map(|aggregator| aggregator.close())
                .collect(),
        };
        results
            .into_iter()
            .filter_map(std::result::Result::err)
            .for_each(|e| {
                tracing::warn!("Failed to close the aggregator of index `{}`: {e}", self.id)
            });
        self.state = IndexState::Closed;
    }

    /// Id of the index
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Schema of the index
    pub fn schema(&self) -> &IncrementalIndexSchema {
        &self.schema
    }

    /// Configuration of the index
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Factories of the metrics, in the output order
    pub fn factories(&self) -> &[Arc<dyn AggregatorFactory>] {
        &self.factories
    }

    /// Metrics, shared with the readers in other threads
    pub fn metrics(&self) -> &Arc<IndexMetrics> {
        &self.metrics
    }

    /// Number of the groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if the index has no group
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns true if a row of a new group can be added
    pub fn can_append_row(&self) -> bool {
        self.state == IndexState::Open && self.groups.len() < self.config.max_rows
    }

    /// Names of the dimensions in order
    pub fn dimension_order(&self) -> Vec<String> {
        self.dimensions.names()
    }

    /// Names of the metrics in order
    pub fn metric_names(&self) -> Vec<&str> {
        self.factories.iter().map(|factory| factory.name()).collect()
    }

    /// Smallest bucket timestamp of the groups
    pub fn min_time(&self) -> Option<Timestamp> {
        self.min_time
    }

    /// Largest bucket timestamp of the groups
    pub fn max_time(&self) -> Option<Timestamp> {
        self.max_time
    }

    /// Estimated bytes used by the groups and the dictionaries
    pub fn estimated_bytes(&self) -> usize {
        let states = match &self.states {
            States::Object { aggregators } => self
                    .factories
                    .iter()
                    .enumerate()
                    .filter(|(_, factory)| factory.requires_size_estimation())
                    .map(|(metric, _)| {
                        aggregators
                            .iter()
                            .map(|group| group[metric].estimated_size())
                            .sum::<usize>()
                    })
                    .sum::<usize>(),
            States::Buffer { arena, .. } => arena.reserved_bytes(),
        };
        self.fixed_bytes + states + self.dimensions.estimated_size()
    }

    /// Intermediate value of the metric in the group at `position`
    pub fn metric_value(&self, position: usize, metric: usize) -> Option<Value> {
        if position >= self.groups.len() || metric >= self.factories.len() {
            return None;
        }
        Some(match &self.states {
            States::Object { aggregators } => aggregators[position][metric].get(),
            States::Buffer {
                arena,
                aggregators,
                slots,
            } => aggregators[metric].get(arena.span(slots[position], metric)),
        })
    }

    /// Rows of the groups, ordered by the bucket timestamp then the insertion. If
    /// `finalize` is true, the metrics are finalized. Otherwise, they are the
    /// intermediate values
    pub fn iter_rows(&self, finalize: bool) -> impl Iterator<Item = Row> + '_ {
        let mut order = (0..self.groups.len()).collect::<Vec<_>>();
        order.sort_by_key(|&position| self.groups[position].key.timestamp);
        order.into_iter().map(move |position| {
            let key = &self.groups[position].key;
            let metrics = self
                .factories
                .iter()
                .enumerate()
                .map(|(metric, factory)| {
                    let value = self.metric_value(position, metric).unwrap_or_default();
                    let value = if finalize {
                        factory.finalize_computation(value)
                    } else {
                        value
                    };
                    (factory.name().to_string(), value)
                })
                .collect();
            Row {
                timestamp: key.timestamp,
                dimensions: self.dimensions.decode(&key.dims),
                metrics,
            }
        })
    }
}

fn aggregate_objects(aggregators: &mut [Box<dyn Aggregator>], strict: bool) -> Result<()> {
    if strict {
        aggregators
            .iter()
            .try_for_each(|aggregator| aggregator.validate())
            .context(AggregateSnafu)?;
    }
    aggregators
        .iter_mut()
        .try_for_each(|aggregator| aggregator.aggregate())
        .context(AggregateSnafu)
}

fn init_spans(arena: &mut SpanArena, slot: SlotId, aggregators: &[Box<dyn BufferAggregator>]) {
    let mut spans = arena.spans_mut(slot);
    aggregators
        .iter()
        .enumerate()
        .for_each(|(metric, aggregator)| aggregator.init(spans.get_mut(metric)));
}

/// Aggregate the current row into the slot. In the strict mode all of the spans are
/// validated first, a rejected row leaves the slot untouched
fn aggregate_spans(
    arena: &mut SpanArena,
    slot: SlotId,
    aggregators: &mut [Box<dyn BufferAggregator>],
    strict: bool,
) -> Result<()> {
    if strict {
        aggregators
            .iter()
            .enumerate()
            .try_for_each(|(metric, aggregator)| aggregator.validate(arena.span(slot, metric)))
            .context(AggregateSnafu)?;
    }
    let mut spans = arena.spans_mut(slot);
    aggregators
        .iter_mut()
        .enumerate()
        .try_for_each(|(metric, aggregator)| aggregator.aggregate(spans.get_mut(metric)))
        .context(AggregateSnafu)
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal::Decimal;
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregatorSpec;
    use crate::aggregate::spec::InputSpec;
    use crate::granularity::Granularity;
    use crate::row::RowsTable;
    use crate::sketch::hll::{self, HyperLogLog};
    use crate::value::ComplexValue;

    pub(crate) fn sum_schema() -> IncrementalIndexSchema {
        IncrementalIndexSchema::new(vec![
            AggregatorSpec::Count {
                name: "count".to_string(),
                filter: None,
            },
            AggregatorSpec::LongSum(InputSpec::field("sum", "v")),
        ])
    }

    pub(crate) fn row(timestamp: Timestamp, dim: &str, v: i64) -> InputRow {
        InputRow::new(timestamp)
            .with_dimension("dim", dim)
            .with_column("v", v)
    }

    const MODES: [AggregationMode; 2] = [AggregationMode::Object, AggregationMode::Buffer];

    #[test]
    fn test_rollup() -> Report<IndexError> {
        Report::capture(|| {
            for mode in MODES {
                let config = IndexConfig::default().with_mode(mode);
                let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
                index.add(row(0, "a", 1))?;
                index.add(row(0, "a", 2))?;
                assert_eq!(index.add(row(0, "b", 5))?, 2);

                let rows = index.iter_rows(true).collect::<Vec<_>>();
                let expect = expect_test::expect![[r#"
                    ┌──────────────────────┬─────┬───────┬─────┐
                    │ __time               │ dim │ count │ sum │
                    ├──────────────────────┼─────┼───────┼─────┤
                    │ 1970-01-01T00:00:00Z │ a   │ 2     │ 3   │
                    ├──────────────────────┼─────┼───────┼─────┤
                    │ 1970-01-01T00:00:00Z │ b   │ 1     │ 5   │
                    └──────────────────────┴─────┴───────┴─────┘"#]];
                expect.assert_eq(&RowsTable(&rows).to_string());

                let metrics = index.metrics().metrics_set();
                assert_eq!(metrics.count("rows_ingested"), Some(3));
                assert_eq!(metrics.count("rows_rolled_up"), Some(1));
                assert_eq!(metrics.count("new_groups"), Some(2));
                index.close();
                assert_eq!(index.state(), IndexState::Closed);
                assert!(matches!(index.add(row(0, "a", 1)), Err(IndexError::Closed { .. })));
            }
            Ok(())
        })
    }

    #[test]
    fn test_no_rollup() -> Report<IndexError> {
        Report::capture(|| {
            let mut index = IncrementalIndex::try_new(
                sum_schema().with_rollup(false),
                IndexConfig::default(),
            )?;
            index.add(row(0, "a", 1))?;
            index.add(row(0, "a", 2))?;
            assert_eq!(index.len(), 2);
            let sums = index
                .iter_rows(true)
                .map(|row| row.metric("sum").cloned())
                .collect::<Vec<_>>();
            assert_eq!(sums, vec![Some(Value::Long(1)), Some(Value::Long(2))]);
            Ok(())
        })
    }

    #[test]
    fn test_capacity() -> Report<IndexError> {
        Report::capture(|| {
            for mode in MODES {
                let config = IndexConfig::default().with_max_rows(3).with_mode(mode);
                let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
                for (i, dim) in ["a", "b", "c"].into_iter().enumerate() {
                    assert!(index.can_append_row());
                    assert_eq!(index.add(row(0, dim, 1))?, i + 1);
                }
                assert_eq!(index.state(), IndexState::Full);
                assert!(!index.can_append_row());

                let err = index.add(row(0, "d", 1)).unwrap_err();
                assert!(err.is_size_exceeded());
                assert_eq!(index.len(), 3);
                // Existing groups still accept rows
                index.add(row(0, "a", 1))?;
                assert_eq!(index.metric_value(0, 1), Some(Value::Long(2)));
            }
            Ok(())
        })
    }

    #[test]
    fn test_byte_ceiling() -> Report<IndexError> {
        Report::capture(|| {
            let mut config = IndexConfig::default()
                .with_max_bytes(1)
                .with_mode(AggregationMode::Object);
            config.byte_check_interval = 2;
            let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
            index.add(row(0, "a", 1))?;
            assert_eq!(index.state(), IndexState::Open);
            index.add(row(0, "b", 1))?;
            assert_eq!(index.state(), IndexState::Full);
            assert!(index.add(row(0, "c", 1)).unwrap_err().is_size_exceeded());
            Ok(())
        })
    }

    #[test]
    fn test_granularity_and_order() -> Report<IndexError> {
        Report::capture(|| {
            let schema = sum_schema()
                .with_granularity(Granularity::Minute)
                .with_min_timestamp(0);
            let mut index = IncrementalIndex::try_new(schema, IndexConfig::default())?;
            index.add(row(61_000, "b", 1))?;
            index.add(row(5_000, "b", 2))?;
            index.add(row(119_999, "b", 3))?;
            index.add(row(30_000, "a", 4))?;
            assert!(matches!(
                index.add(row(-1, "a", 1)),
                Err(IndexError::TimestampTooEarly { .. })
            ));

            let rows = index
                .iter_rows(true)
                .map(|row| {
                    (
                        row.timestamp,
                        row.dimension("dim").map(ToString::to_string),
                        row.metric("sum").cloned(),
                    )
                })
                .collect::<Vec<_>>();
            assert_eq!(
                rows,
                vec![
                    (0, Some("b".to_string()), Some(Value::Long(2))),
                    (0, Some("a".to_string()), Some(Value::Long(4))),
                    (60_000, Some("b".to_string()), Some(Value::Long(4))),
                ]
            );
            assert_eq!(index.min_time(), Some(0));
            assert_eq!(index.max_time(), Some(60_000));
            Ok(())
        })
    }

    #[test]
    fn test_parse_policy() -> Report<IndexError> {
        Report::capture(|| {
            for mode in MODES {
                let config = IndexConfig::default()
                    .with_parse_policy(ParsePolicy::Strict)
                    .with_mode(mode);
                let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
                index.add(row(0, "a", 1))?;
                let malformed = InputRow::new(0)
                    .with_dimension("dim", "a")
                    .with_column("v", "many");
                let err = index.add(malformed.clone()).unwrap_err();
                assert!(err.is_parse_error());
                // The count of the rejected row is not aggregated
                assert_eq!(index.metric_value(0, 0), Some(Value::Long(1)));
                let err = index
                    .add(malformed.clone().with_dimension("dim", "new"))
                    .unwrap_err();
                assert!(err.is_parse_error());
                assert_eq!(index.len(), 1);
                assert_eq!(index.metrics().invalid_rows.value(), 2);

                let config = IndexConfig::default().with_mode(mode);
                let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
                index.add(row(0, "a", 1))?;
                index.add(malformed)?;
                assert_eq!(index.metric_value(0, 0), Some(Value::Long(2)));
                assert_eq!(index.metric_value(0, 1), Some(Value::Long(1)));
            }
            Ok(())
        })
    }

    #[test]
    fn test_discovered_dimensions() -> Report<IndexError> {
        Report::capture(|| {
            let mut index = IncrementalIndex::try_new(sum_schema(), IndexConfig::default())?;
            index.add(row(0, "a", 1))?;
            index.add(row(0, "a", 2).with_dimension("country", "nz"))?;
            // Same key with the first row, the new dimension is null
            index.add(row(0, "a", 3).with_dimension("country", Value::Null))?;
            assert_eq!(index.dimension_order(), vec!["dim", "country"]);
            assert_eq!(index.len(), 2);

            let successor = index.try_successor()?;
            assert_eq!(successor.dimension_order(), vec!["dim", "country"]);
            assert!(successor.is_empty());
            assert_ne!(successor.id(), index.id());

            let rows = index.iter_rows(true).collect::<Vec<_>>();
            assert_eq!(rows[0].dimension("country"), Some(&Value::Null));
            assert_eq!(rows[0].metric("sum"), Some(&Value::Long(4)));
            Ok(())
        })
    }

    #[test]
    fn test_rejected_rows_are_atomic() -> Report<IndexError> {
        Report::capture(|| {
            let schema: IncrementalIndexSchema = serde_json::from_str(
                r#"{
                    "metrics": [
                        {"type": "count", "name": "count"},
                        {"type": "decimalSum", "name": "amount", "fieldName": "n", "precision": 3},
                        {"type": "hyperUnique", "name": "users", "fieldName": "user"}
                    ]
                }"#,
            )
            .unwrap();
            let amount = |n: i64| {
                InputRow::new(0)
                    .with_dimension("page", "a")
                    .with_column("n", n)
            };
            let decimal = |v: i64| Some(Value::Decimal(Decimal::from(v)));
            for mode in MODES {
                let config = IndexConfig::default()
                    .with_parse_policy(ParsePolicy::Strict)
                    .with_mode(mode);
                let mut index = IncrementalIndex::try_new(schema.clone(), config)?;
                index.add(amount(600))?;
                // The sum overflows the precision, none of the metrics see the row
                let err = index.add(amount(600)).unwrap_err();
                assert!(err.is_parse_error(), "{mode:?}");
                assert_eq!(index.metric_value(0, 0), Some(Value::Long(1)), "{mode:?}");
                assert_eq!(index.metric_value(0, 1), decimal(600), "{mode:?}");
                assert_eq!(index.metrics().invalid_rows.value(), 1);

                let sketch = HyperLogLog::new(hll::MIN_LOG2M);
                let mismatched = amount(1).with_column(
                    "user",
                    Value::Complex(ComplexValue::HyperUnique(Box::new(sketch))),
                );
                assert!(index.add(mismatched).is_err());
                assert_eq!(index.metric_value(0, 0), Some(Value::Long(1)), "{mode:?}");
                assert_eq!(index.metric_value(0, 1), decimal(600), "{mode:?}");

                // Rejected new groups do not leak their slots
                let err = index.add(amount(1000).with_dimension("page", "b")).unwrap_err();
                assert!(err.is_parse_error());
                index.add(amount(7).with_dimension("page", "b"))?;
                assert_eq!(index.len(), 2);
                assert_eq!(index.metric_value(1, 0), Some(Value::Long(1)), "{mode:?}");
                assert_eq!(index.metric_value(1, 1), decimal(7), "{mode:?}");
            }
            Ok(())
        })
    }

    #[test]
    fn test_rejected_rows_do_not_discover() -> Report<IndexError> {
        Report::capture(|| {
            for mode in MODES {
                let config = IndexConfig::default()
                    .with_parse_policy(ParsePolicy::Strict)
                    .with_mode(mode);
                let mut index = IncrementalIndex::try_new(sum_schema(), config)?;
                index.add(row(0, "a", 1))?;
                let malformed = InputRow::new(0)
                    .with_dimension("dim", "a")
                    .with_dimension("country", "nz")
                    .with_column("v", "many");
                assert!(index.add(malformed).unwrap_err().is_parse_error());
                assert_eq!(index.dimension_order(), vec!["dim"]);

                index.add(row(0, "a", 2).with_dimension("country", "nz"))?;
                assert_eq!(index.dimension_order(), vec!["dim", "country"]);
                assert_eq!(index.len(), 2);
            }
            Ok(())
        })
    }

    #[test]
    fn test_modes_are_equivalent() -> Report<IndexError> {
        Report::capture(|| {
            let schema: IncrementalIndexSchema = serde_json::from_str(
                r#"{
                    "granularity": "minute",
                    "metrics": [
                        {"type": "count", "name": "count"},
                        {"type": "doubleSum", "name": "sum", "fieldName": "v"},
                        {"type": "doubleMax", "name": "max", "fieldName": "v"},
                        {"type": "longFirst", "name": "first", "fieldName": "n"},
                        {"type": "timeMax", "name": "latest", "fieldName": "__time"},
                        {"type": "decimalSum", "name": "amount", "fieldName": "n", "scale": 2},
                        {"type": "filtered", "aggregator": {"type": "longSum", "name": "big", "fieldName": "n"},
                         "filter": {"type": "expression", "expression": "n > 50"}}
                    ]
                }"#,
            )
            .unwrap();
            let mut rng = StdRng::seed_from_u64(42);
            let rows = (0..500)
                .map(|_| {
                    InputRow::new(rng.gen_range(0..600_000))
                        .with_dimension("page", ["a", "b", "c", "d"][rng.gen_range(0..4)])
                        .with_column("v", rng.gen_range(-100.0..100.0_f64))
                        .with_column("n", rng.gen_range(0..100_i64))
                })
                .collect::<Vec<_>>();

            let mut outputs = Vec::new();
            for mode in MODES {
                let config = IndexConfig::default().with_mode(mode);
                let mut index = IncrementalIndex::try_new(schema.clone(), config)?;
                rows.iter().try_for_each(|row| index.add(row.clone()).map(|_| ()))?;
                outputs.push(index.iter_rows(true).collect::<Vec<_>>());
            }
            assert_eq!(outputs[0], outputs[1]);
            Ok(())
        })
    }
}
