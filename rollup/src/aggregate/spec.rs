//! Declarative form of the aggregations
//!
//! [`AggregatorSpec`] is the JSON representation of a factory, tagged by the `type`
//! field. Every factory reports its spec and [`AggregatorSpec::build`] creates the
//! factory back:
//!
//! ```json
//! {"type": "doubleSum", "name": "revenue", "fieldName": "price"}
//! {"type": "filtered", "aggregator": {"type": "count", "name": "errors"},
//!  "filter": {"type": "selector", "dimension": "status", "value": "500"}}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::array::ArrayFanOutAggregatorFactory;
use super::count::CountAggregatorFactory;
use super::decimal::{
    DEFAULT_PRECISION, DecimalAggregatorFactory, DecimalMaxOp, DecimalMinOp, DecimalRounding,
    DecimalSumOp,
};
use super::filtered::FilteredAggregatorFactory;
use super::first_last::FirstLastAggregatorFactory;
use super::numeric::{
    Max, Min, NumericAggregatorFactory, NumericKernel, RangeKernel, Sum, TimeExtremum,
};
use super::sketch::{
    CountMinKernel, CountMinParams, HistogramKernel, HistogramParams, HyperUniqueKernel,
    HyperUniqueParams, SketchAggregatorFactory,
};
use super::{AggregatorFactory, ConfigurationError};
use crate::filter::DimFilter;
use crate::sketch::{count_min, histogram, hll};

/// Input of the aggregation: exactly one of the field and the expression, gated by an
/// optional filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    /// Name of the output metric
    pub name: String,
    /// Input column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    /// Input expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Only the matched rows are aggregated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
}

impl InputSpec {
    /// Input reads the field
    pub fn field(name: impl Into<String>, field_name: &str) -> Self {
        Self {
            name: name.into(),
            field_name: Some(field_name.to_string()),
            expression: None,
            filter: None,
        }
    }
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

/// Spec of the decimal aggregations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecimalSpec {
    /// Name of the output metric
    pub name: String,
    /// Input column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    /// Input expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Only the matched rows are aggregated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
    /// Number of the significant digits
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Number of the fractional digits
    #[serde(default)]
    pub scale: u32,
    /// Rounding of the inputs with more fractional digits than the scale
    #[serde(default)]
    pub rounding: DecimalRounding,
}

/// Spec of the first/last aggregations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstLastSpec {
    /// Name of the output metric
    pub name: String,
    /// Input column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    /// Input expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Column of the timestamps, the row timestamp if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    /// Only the matched rows are aggregated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<DimFilter>,
}

fn default_log2m() -> u8 {
    hll::DEFAULT_LOG2M
}

/// Spec of the `hyperUnique` aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperUniqueSpec {
    /// Input
    #[serde(flatten)]
    pub input: InputSpec,
    /// Logarithm of the number of registers
    #[serde(default = "default_log2m")]
    pub log2m: u8,
    /// Round the estimate when finalized
    #[serde(default)]
    pub round: bool,
}

fn default_resolution() -> usize {
    histogram::DEFAULT_RESOLUTION
}

fn default_quantiles() -> Vec<f64> {
    vec![0.5]
}

/// Spec of the `approxHistogram` aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproxHistogramSpec {
    /// Input
    #[serde(flatten)]
    pub input: InputSpec,
    /// Maximal number of the bins
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    /// Quantiles of the finalized value
    #[serde(default = "default_quantiles")]
    pub quantiles: Vec<f64>,
}

fn default_width() -> u32 {
    count_min::DEFAULT_WIDTH
}

fn default_depth() -> u32 {
    count_min::DEFAULT_DEPTH
}

/// Spec of the `countMin` aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountMinSpec {
    /// Input
    #[serde(flatten)]
    pub input: InputSpec,
    /// Number of the counters per row
    #[serde(default = "default_width")]
    pub width: u32,
    /// Number of the rows
    #[serde(default = "default_depth")]
    pub depth: u32,
}

/// Declarative form of an aggregation, the `type` field selects the variant
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorSpec {
    Count {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<DimFilter>,
    },
    LongSum(InputSpec),
    LongMin(InputSpec),
    LongMax(InputSpec),
    FloatSum(InputSpec),
    FloatMin(InputSpec),
    FloatMax(InputSpec),
    DoubleSum(InputSpec),
    DoubleMin(InputSpec),
    DoubleMax(InputSpec),
    TimeMin(InputSpec),
    TimeMax(InputSpec),
    Range(InputSpec),
    DecimalSum(DecimalSpec),
    DecimalMin(DecimalSpec),
    DecimalMax(DecimalSpec),
    LongFirst(FirstLastSpec),
    LongLast(FirstLastSpec),
    DoubleFirst(FirstLastSpec),
    DoubleLast(FirstLastSpec),
    HyperUnique(HyperUniqueSpec),
    ApproxHistogram(ApproxHistogramSpec),
    CountMin(CountMinSpec),
    Filtered {
        aggregator: Box<AggregatorSpec>,
        filter: DimFilter,
    },
    ArrayFanOut {
        aggregator: Box<AggregatorSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<DimFilter>,
    },
}

type FactoryResult = Result<Arc<dyn AggregatorFactory>, ConfigurationError>;

fn numeric<K: NumericKernel>(spec: &InputSpec) -> FactoryResult {
    Ok(Arc::new(NumericAggregatorFactory::<K>::try_new(
        spec.name.clone(),
        spec.field_name.as_deref(),
        spec.expression.as_deref(),
        spec.filter.as_ref(),
    )?))
}

impl AggregatorSpec {
    /// Name of the output metric
    pub fn name(&self) -> &str {
        match self {
            Self::Count { name, .. } => name,
            Self::LongSum(spec)
            | Self::LongMin(spec)
            | Self::LongMax(spec)
            | Self::FloatSum(spec)
            | Self::FloatMin(spec)
            | Self::FloatMax(spec)
            | Self::DoubleSum(spec)
            | Self::DoubleMin(spec)
            | Self::DoubleMax(spec)
            | Self::TimeMin(spec)
            | Self::TimeMax(spec)
            | Self::Range(spec) => &spec.name,
            Self::DecimalSum(spec) | Self::DecimalMin(spec) | Self::DecimalMax(spec) => &spec.name,
            Self::LongFirst(spec)
            | Self::LongLast(spec)
            | Self::DoubleFirst(spec)
            | Self::DoubleLast(spec) => &spec.name,
            Self::HyperUnique(spec) => &spec.input.name,
            Self::ApproxHistogram(spec) => &spec.input.name,
            Self::CountMin(spec) => &spec.input.name,
            Self::Filtered { aggregator, .. } | Self::ArrayFanOut { aggregator, .. } => {
                aggregator.name()
            }
        }
    }

    /// Create the factory described by self
    pub fn build(&self) -> FactoryResult {
        Ok(match self {
            Self::Count { name, filter } => {
                Arc::new(CountAggregatorFactory::try_new(name.clone(), filter.as_ref())?)
            }
            Self::LongSum(spec) => numeric::<Sum<i64>>(spec)?,
            Self::LongMin(spec) => numeric::<Min<i64>>(spec)?,
            Self::LongMax(spec) => numeric::<Max<i64>>(spec)?,
            Self::FloatSum(spec) => numeric::<Sum<f32>>(spec)?,
            Self::FloatMin(spec) => numeric::<Min<f32>>(spec)?,
            Self::FloatMax(spec) => numeric::<Max<f32>>(spec)?,
            Self::DoubleSum(spec) => numeric::<Sum<f64>>(spec)?,
            Self::DoubleMin(spec) => numeric::<Min<f64>>(spec)?,
            Self::DoubleMax(spec) => numeric::<Max<f64>>(spec)?,
            Self::TimeMin(spec) => numeric::<TimeExtremum<true>>(spec)?,
            Self::TimeMax(spec) => numeric::<TimeExtremum<false>>(spec)?,
            Self::Range(spec) => numeric::<RangeKernel>(spec)?,
            Self::DecimalSum(spec) => {
                Arc::new(DecimalAggregatorFactory::<DecimalSumOp>::try_from_spec(spec)?)
            }
            Self::DecimalMin(spec) => {
                Arc::new(DecimalAggregatorFactory::<DecimalMinOp>::try_from_spec(spec)?)
            }
            Self::DecimalMax(spec) => {
                Arc::new(DecimalAggregatorFactory::<DecimalMaxOp>::try_from_spec(spec)?)
            }
            Self::LongFirst(spec) => {
                Arc::new(FirstLastAggregatorFactory::<true, i64>::try_from_spec(spec)?)
            }
            Self::LongLast(spec) => {
                Arc::new(FirstLastAggregatorFactory::<false, i64>::try_from_spec(spec)?)
            }
            Self::DoubleFirst(spec) => {
                Arc::new(FirstLastAggregatorFactory::<true, f64>::try_from_spec(spec)?)
            }
            Self::DoubleLast(spec) => {
                Arc::new(FirstLastAggregatorFactory::<false, f64>::try_from_spec(spec)?)
            }
            Self::HyperUnique(spec) => {
                Arc::new(SketchAggregatorFactory::<HyperUniqueKernel>::try_new(
                    &spec.input,
                    HyperUniqueParams {
                        log2m: spec.log2m,
                        round: spec.round,
                    },
                )?)
            }
            Self::ApproxHistogram(spec) => {
                Arc::new(SketchAggregatorFactory::<HistogramKernel>::try_new(
                    &spec.input,
                    HistogramParams {
                        resolution: spec.resolution,
                        quantiles: Arc::from(spec.quantiles.as_slice()),
                    },
                )?)
            }
            Self::CountMin(spec) => Arc::new(SketchAggregatorFactory::<CountMinKernel>::try_new(
                &spec.input,
                CountMinParams {
                    width: spec.width,
                    depth: spec.depth,
                },
            )?),
            Self::Filtered { aggregator, filter } => {
                Arc::new(FilteredAggregatorFactory::try_new(aggregator.build()?, filter)?)
            }
            Self::ArrayFanOut { aggregator, filter } => Arc::new(
                ArrayFanOutAggregatorFactory::try_new(aggregator.build()?, filter.as_ref())?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;
    use crate::aggregate::AggregatorKind;

    const SPECS: &str = r#"[
        {"type": "count", "name": "rows"},
        {"type": "longSum", "name": "clicks", "fieldName": "clicks"},
        {"type": "doubleMax", "name": "max_price", "expression": "price * 2"},
        {"type": "floatMin", "name": "min_temp", "fieldName": "temp"},
        {"type": "timeMin", "name": "first_seen"},
        {"type": "range", "name": "spread", "fieldName": "price"},
        {"type": "decimalSum", "name": "amount", "fieldName": "amount", "precision": 10, "scale": 2},
        {"type": "longLast", "name": "last_clicks", "fieldName": "clicks"},
        {"type": "hyperUnique", "name": "users", "fieldName": "user", "log2m": 12},
        {"type": "approxHistogram", "name": "latency", "fieldName": "latency", "quantiles": [0.5, 0.99]},
        {"type": "countMin", "name": "pages", "fieldName": "page", "width": 64, "depth": 3},
        {"type": "filtered", "aggregator": {"type": "count", "name": "errors"},
         "filter": {"type": "selector", "dimension": "status", "value": "500"}},
        {"type": "arrayFanOut", "aggregator": {"type": "longSum", "name": "tags", "fieldName": "tags"}}
    ]"#;

    #[test]
    fn test_build_specs() {
        let specs: Vec<AggregatorSpec> = serde_json::from_str(SPECS).unwrap();
        let kinds = specs
            .iter()
            .map(|spec| {
                let factory = spec.build().unwrap();
                assert_eq!(factory.name(), spec.name());
                // The factory reports its spec back
                assert_eq!(&factory.spec().build().unwrap().spec(), &factory.spec());
                factory.kind()
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                AggregatorKind::Count,
                AggregatorKind::LongSum,
                AggregatorKind::DoubleMax,
                AggregatorKind::FloatMin,
                AggregatorKind::TimeMin,
                AggregatorKind::Range,
                AggregatorKind::DecimalSum,
                AggregatorKind::LongLast,
                AggregatorKind::HyperUnique,
                AggregatorKind::ApproximateHistogram,
                AggregatorKind::CountMin,
                AggregatorKind::Filtered,
                AggregatorKind::ArrayFanOut,
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let spec: AggregatorSpec =
            serde_json::from_str(r#"{"type": "hyperUnique", "name": "users", "fieldName": "user"}"#)
                .unwrap();
        let AggregatorSpec::HyperUnique(spec) = &spec else {
            panic!("unexpected spec: {spec:?}");
        };
        assert_eq!(spec.log2m, hll::DEFAULT_LOG2M);
        assert!(!spec.round);

        let spec: AggregatorSpec =
            serde_json::from_str(r#"{"type": "decimalMax", "name": "amount", "fieldName": "amount"}"#)
                .unwrap();
        let expect = expect![[r#"
            {
              "type": "decimalMax",
              "name": "amount",
              "fieldName": "amount",
              "precision": 18,
              "scale": 0,
              "rounding": "halfUp"
            }"#]];
        expect.assert_eq(&serde_json::to_string_pretty(&spec).unwrap());
    }

    #[test]
    fn test_invalid_specs() {
        let spec: AggregatorSpec =
            serde_json::from_str(r#"{"type": "longSum", "name": "clicks"}"#).unwrap();
        let expect =
            expect!["Aggregator `clicks` requires exactly one of the `fieldName` and `expression`"];
        expect.assert_eq(&spec.build().unwrap_err().to_string());

        let spec: AggregatorSpec = serde_json::from_str(
            r#"{"type": "countMin", "name": "pages", "fieldName": "page", "width": 0}"#,
        )
        .unwrap();
        assert!(matches!(
            spec.build(),
            Err(ConfigurationError::InvalidParameter { .. })
        ));

        let unknown = r#"{"type": "median", "name": "m"}"#;
        assert!(serde_json::from_str::<AggregatorSpec>(unknown).is_err());
    }
}
