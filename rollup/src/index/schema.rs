//! Schema and configuration of the incremental index

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::TIME_COLUMN;
use crate::aggregate::{AggregatorFactory, AggregatorSpec, ConfigurationError};
use crate::common::types::Timestamp;
use crate::granularity::Granularity;
use crate::selector::ParsePolicy;

/// Default row ceiling of the index
pub const DEFAULT_MAX_ROWS: usize = 150_000;
/// Default estimated byte ceiling, `None` means unbounded
pub const DEFAULT_MAX_BYTES: Option<usize> = None;
/// Default cadence of sampling the estimated bytes, in rows
pub const DEFAULT_BYTE_CHECK_INTERVAL: usize = 1024;

/// Type of the dimension values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DimensionType {
    /// Strings, arrays are multi-value dimensions
    #[default]
    String,
    /// 64-bit integers
    Long,
    /// 32-bit floating numbers
    Float,
    /// 64-bit floating numbers
    Double,
}

/// Declared dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSchema {
    /// Name of the column
    pub name: String,
    /// Type of the values
    #[serde(default, rename = "type")]
    pub value_type: DimensionType,
}

impl DimensionSchema {
    /// String dimension
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: DimensionType::String,
        }
    }
}

/// Dimensions of the index. If `dimensions` is empty, the dimensions are discovered
/// from the rows in the order they first appear
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionsSpec {
    /// Declared dimensions, the other columns are not dimensions
    #[serde(default)]
    pub dimensions: Vec<DimensionSchema>,
    /// Columns that are never discovered as dimensions
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl DimensionsSpec {
    /// Returns true if the dimensions are discovered from the rows
    pub fn is_discovery(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Returns true if the column may be a discovered dimension
    pub(crate) fn is_discoverable(&self, column: &str) -> bool {
        column != TIME_COLUMN && !self.exclusions.iter().any(|excluded| excluded == column)
    }
}

/// Schema of the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalIndexSchema {
    /// Rows with smaller timestamp are rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<Timestamp>,
    /// Granularity of the row timestamps
    #[serde(default)]
    pub granularity: Granularity,
    /// Dimensions
    #[serde(default)]
    pub dimensions_spec: DimensionsSpec,
    /// Metrics, in the output order
    pub metrics: Vec<AggregatorSpec>,
    /// Merge the rows with the same bucket and dimensions
    #[serde(default = "default_rollup")]
    pub rollup: bool,
}

fn default_rollup() -> bool {
    true
}

impl IncrementalIndexSchema {
    /// Schema discovers the dimensions, rolls up the rows with granularity `None`
    pub fn new(metrics: Vec<AggregatorSpec>) -> Self {
        Self {
            min_timestamp: None,
            granularity: Granularity::None,
            dimensions_spec: DimensionsSpec::default(),
            metrics,
            rollup: true,
        }
    }

    /// Set the granularity
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set the dimensions spec
    pub fn with_dimensions(mut self, dimensions_spec: DimensionsSpec) -> Self {
        self.dimensions_spec = dimensions_spec;
        self
    }

    /// Set the rollup flag
    pub fn with_rollup(mut self, rollup: bool) -> Self {
        self.rollup = rollup;
        self
    }

    /// Set the min timestamp
    pub fn with_min_timestamp(mut self, min_timestamp: Timestamp) -> Self {
        self.min_timestamp = Some(min_timestamp);
        self
    }

    /// Build the factories of the metrics, the names should be unique
    pub fn build_metrics(&self) -> Result<Vec<Arc<dyn AggregatorFactory>>, ConfigurationError> {
        let mut factories: Vec<Arc<dyn AggregatorFactory>> = Vec::with_capacity(self.metrics.len());
        for spec in &self.metrics {
            let factory = spec.build()?;
            if factories.iter().any(|f| f.name() == factory.name()) {
                return Err(ConfigurationError::DuplicateName {
                    name: factory.name().to_string(),
                });
            }
            factories.push(factory);
        }
        Ok(factories)
    }
}

/// How the index keeps the states of the groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationMode {
    /// Each group owns boxed [`Aggregator`]s
    ///
    /// [`Aggregator`]: crate::aggregate::Aggregator
    Object,
    /// Each group owns a span in the arena, updated by shared [`BufferAggregator`]s
    ///
    /// [`BufferAggregator`]: crate::aggregate::BufferAggregator
    #[default]
    Buffer,
}

/// Limits and policies of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexConfig {
    /// Maximal number of the groups
    pub max_rows: usize,
    /// Maximal number of the estimated bytes
    pub max_bytes: Option<usize>,
    /// Number of the rows between two samplings of the estimated bytes
    pub byte_check_interval: usize,
    /// Handling of the malformed values
    pub parse_policy: ParsePolicy,
    /// Where the states are kept
    pub mode: AggregationMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            max_bytes: DEFAULT_MAX_BYTES,
            byte_check_interval: DEFAULT_BYTE_CHECK_INTERVAL,
            parse_policy: ParsePolicy::default(),
            mode: AggregationMode::default(),
        }
    }
}

impl IndexConfig {
    /// Set the row ceiling
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Set the byte ceiling
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Set the parse policy
    pub fn with_parse_policy(mut self, parse_policy: ParsePolicy) -> Self {
        self.parse_policy = parse_policy;
        self
    }

    /// Set the aggregation mode
    pub fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema() {
        let schema: IncrementalIndexSchema = serde_json::from_str(
            r#"{
                "granularity": "minute",
                "dimensionsSpec": {
                    "dimensions": [{"name": "page"}, {"name": "bytes", "type": "long"}]
                },
                "metrics": [{"type": "count", "name": "rows"}]
            }"#,
        )
        .unwrap();
        assert_eq!(schema.granularity, Granularity::Minute);
        assert!(schema.rollup);
        assert!(!schema.dimensions_spec.is_discovery());
        assert_eq!(schema.dimensions_spec.dimensions[1].value_type, DimensionType::Long);
        assert_eq!(schema.build_metrics().unwrap().len(), 1);

        let config: IndexConfig =
            serde_json::from_str(r#"{"maxRows": 10, "mode": "object"}"#).unwrap();
        assert_eq!(config.max_rows, 10);
        assert_eq!(config.mode, AggregationMode::Object);
        assert_eq!(config.byte_check_interval, DEFAULT_BYTE_CHECK_INTERVAL);
    }

    #[test]
    fn test_duplicate_metrics() {
        let schema = IncrementalIndexSchema::new(vec![
            AggregatorSpec::Count {
                name: "rows".to_string(),
                filter: None,
            },
            AggregatorSpec::Count {
                name: "rows".to_string(),
                filter: None,
            },
        ]);
        expect_test::expect!["Duplicate metric name `rows`"]
            .assert_eq(&schema.build_metrics().unwrap_err().to_string());
    }
}
