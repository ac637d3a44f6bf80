//! Aggregations
//!
//! An [`AggregatorFactory`] is an immutable, named descriptor of an aggregation. It is
//! shared by all of the groups of the index and instantiates one accumulator per group:
//!
//! - [`Aggregator`]: object mode, the accumulator owns its state
//!
//! - [`BufferAggregator`]: buffer mode, the accumulator is stateless and updates the
//! span of bytes owned by the group. The span has exactly
//! [`AggregatorFactory::max_intermediate_size`] bytes
//!
//! Both modes read the current row through the selectors captured at creation, and
//! both modes produce identical results for the same input.
//!
//! Partial states are reconciled with [`AggregatorFactory::combine`], which is
//! associative and commutative for every aggregation in this crate. Factories of the
//! same kind and name are mergeable, see [`merge_aggregator_factories`]

pub mod array;
pub mod count;
pub mod decimal;
pub mod filtered;
pub mod first_last;
pub mod merge;
pub mod numeric;
pub mod sketch;
pub mod spec;

use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use snafu::{ResultExt, Snafu, ensure};

use crate::cache_key::CacheKeyBuilder;
use crate::expr::{Expr, ExprError};
use crate::filter::{CompiledFilter, DimFilter, FilterError};
use crate::selector::{ColumnSelectorFactory, SelectorError, ValueSelector};
use crate::sketch::SketchError;
use crate::value::{Value, ValueType};
use crate::wire::{self, WireError};

pub use merge::{MergedMetric, merge_aggregator_factories};
pub use spec::AggregatorSpec;

/// Errors of the invalid configurations, reported when the factory is created
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum ConfigurationError {
    #[snafu(display("Name of the aggregator can not be empty"))]
    EmptyName,
    #[snafu(display(
        "Aggregator `{name}` requires exactly one of the `fieldName` and `expression`"
    ))]
    InvalidInput { name: String },
    #[snafu(display("Invalid expression of the aggregator `{name}`"))]
    InvalidExpression { name: String, source: ExprError },
    #[snafu(display("Invalid filter of the aggregator `{name}`"))]
    InvalidFilter { name: String, source: FilterError },
    #[snafu(display("Aggregator `{name}` has invalid parameter: {reason}"))]
    InvalidParameter { name: String, reason: String },
    #[snafu(display("Duplicate metric name `{name}`"))]
    DuplicateName { name: String },
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum AggregationError {
    #[snafu(display("Malformed input of the aggregator `{name}`"))]
    Malformed { name: String, source: SelectorError },
    #[snafu(display(
        "Value `{value}` of the aggregator `{name}` exceeds the decimal precision `{precision}`"
    ))]
    DecimalOverflow {
        name: String,
        precision: u32,
        value: String,
    },
    #[snafu(display(
        "Aggregator `{name}`({kind}) is not mergeable with the aggregator `{other_name}`({other_kind})"
    ))]
    NotMergeable {
        name: String,
        kind: AggregatorKind,
        other_name: String,
        other_kind: AggregatorKind,
    },
    #[snafu(display("Aggregator `{name}` expects intermediate `{expect}`, found `{found}`"))]
    TypeMismatch {
        name: String,
        expect: ValueType,
        found: String,
    },
    #[snafu(display("Aggregator `{name}` failed to handle the wire bytes"))]
    Wire { name: String, source: WireError },
    #[snafu(display("Aggregator `{name}` failed to merge the sketches"))]
    Sketch { name: String, source: SketchError },
}

/// Aggregation result
pub type Result<T> = std::result::Result<T, AggregationError>;

impl AggregationError {
    /// Returns true if the error is caused by the malformed input value
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::DecimalOverflow { .. })
    }
}

macro_rules! for_all_kinds {
    ($macro:ident) => {
        $macro! {
            Count => ("count", 0x00),
            LongSum => ("longSum", 0x01),
            DoubleSum => ("doubleSum", 0x02),
            DoubleMax => ("doubleMax", 0x03),
            DoubleMin => ("doubleMin", 0x04),
            HyperUnique => ("hyperUnique", 0x05),
            ApproximateHistogram => ("approxHistogram", 0x07),
            Filtered => ("filtered", 0x09),
            LongMax => ("longMax", 0x0A),
            LongMin => ("longMin", 0x0B),
            FloatSum => ("floatSum", 0x0C),
            FloatMax => ("floatMax", 0x0D),
            FloatMin => ("floatMin", 0x0E),
            DoubleFirst => ("doubleFirst", 0x10),
            DoubleLast => ("doubleLast", 0x11),
            LongFirst => ("longFirst", 0x12),
            LongLast => ("longLast", 0x13),
            TimeMin => ("timeMin", 0x14),
            TimeMax => ("timeMax", 0x15),
            Range => ("range", 0x16),
            DecimalSum => ("decimalSum", 0x17),
            DecimalMin => ("decimalMin", 0x18),
            DecimalMax => ("decimalMax", 0x19),
            CountMin => ("countMin", 0x1A),
            ArrayFanOut => ("arrayFanOut", 0x1B)
        }
    };
}

macro_rules! define_kinds {
    ($($kind:ident => ($name:literal, $id:literal)),+) => {
        /// Closed enumeration of the aggregations
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AggregatorKind {
            $($kind,)+
        }

        impl AggregatorKind {
            /// All of the kinds
            pub const ALL: &'static [AggregatorKind] = &[$(Self::$kind,)+];

            /// Type id that leads the cache key
            pub const fn cache_type_id(self) -> u8 {
                match self {
                    $(Self::$kind => $id,)+
                }
            }

            /// Name used by the declarative specs
            pub const fn type_name(self) -> &'static str {
                match self {
                    $(Self::$kind => $name,)+
                }
            }
        }
    };
}

for_all_kinds!(define_kinds);

impl AggregatorKind {
    /// Compatibility table of the merging. Only the same kinds are mergeable, wrappers
    /// check their delegates separately
    pub const fn is_mergeable_with(self, other: Self) -> bool {
        use AggregatorKind::*;
        matches!(
            (self, other),
            (Count, Count)
                | (LongSum, LongSum)
                | (DoubleSum, DoubleSum)
                | (FloatSum, FloatSum)
                | (LongMin, LongMin)
                | (LongMax, LongMax)
                | (DoubleMin, DoubleMin)
                | (DoubleMax, DoubleMax)
                | (FloatMin, FloatMin)
                | (FloatMax, FloatMax)
                | (DecimalSum, DecimalSum)
                | (DecimalMin, DecimalMin)
                | (DecimalMax, DecimalMax)
                | (TimeMin, TimeMin)
                | (TimeMax, TimeMax)
                | (LongFirst, LongFirst)
                | (LongLast, LongLast)
                | (DoubleFirst, DoubleFirst)
                | (DoubleLast, DoubleLast)
                | (Range, Range)
                | (HyperUnique, HyperUnique)
                | (ApproximateHistogram, ApproximateHistogram)
                | (CountMin, CountMin)
                | (Filtered, Filtered)
                | (ArrayFanOut, ArrayFanOut)
        )
    }
}

impl Display for AggregatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Immutable, named descriptor of an aggregation
pub trait AggregatorFactory: Debug + Send + Sync + 'static {
    /// Name of the output column
    fn name(&self) -> &str;

    /// Kind of the aggregation
    fn kind(&self) -> AggregatorKind;

    /// Create the object mode accumulator reading the selectors
    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>>;

    /// Create the buffer mode accumulator reading the selectors
    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>>;

    /// Null-first total order of the intermediate values
    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering;

    /// Combine two intermediate values. Null is the identity
    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value>;

    /// Factory that combines the intermediate values stored in the column `name`
    fn combining_factory(&self) -> Arc<dyn AggregatorFactory>;

    /// Factory that combines the outputs of self and other
    ///
    /// # Errors
    ///
    /// [`AggregationError::NotMergeable`] if the kinds are not compatible or the names
    /// are different
    fn merging_factory(
        &self,
        other: &dyn AggregatorFactory,
    ) -> Result<Arc<dyn AggregatorFactory>> {
        ensure!(
            self.name() == other.name() && self.kind().is_mergeable_with(other.kind()),
            NotMergeableSnafu {
                name: self.name(),
                kind: self.kind(),
                other_name: other.name(),
                other_kind: other.kind(),
            }
        );
        Ok(self.combining_factory())
    }

    /// Normalize the intermediate value from its transport forms: wire bytes, base64
    /// strings of the wire bytes, numeric strings and in-memory values
    fn deserialize(&self, value: Value) -> Result<Value>;

    /// Serialize the intermediate value into wire bytes
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        let value = self.deserialize(value.clone())?;
        wire::encode(&value).context(WireSnafu { name: self.name() })
    }

    /// Convert the intermediate value into the user visible value
    fn finalize_computation(&self, value: Value) -> Value;

    /// Columns read by the aggregation
    fn required_fields(&self) -> Vec<String>;

    /// Deterministic key of the configuration
    fn cache_key(&self) -> Vec<u8>;

    /// Type of the intermediate value
    fn intermediate_type(&self) -> ValueType;

    /// Type of the finalized value
    fn output_type(&self) -> ValueType;

    /// Size of the span used by the buffer mode
    fn max_intermediate_size(&self) -> usize;

    /// Whether the object mode accumulator grows, the index should account for its
    /// [`Aggregator::estimated_size`] instead of the [`Self::max_intermediate_size`]
    fn requires_size_estimation(&self) -> bool {
        false
    }

    /// Intermediate value of an empty group
    fn identity(&self) -> Value;

    /// Declarative form of the factory
    fn spec(&self) -> AggregatorSpec;
}

/// Object mode accumulator, exclusively owned by one group
pub trait Aggregator: Debug + Send {
    /// Aggregate the current row
    fn aggregate(&mut self) -> Result<()>;

    /// Check the current row can be aggregated, without mutating the state
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Intermediate value
    fn get(&self) -> Value;

    /// Intermediate value as long
    fn get_long(&self) -> i64 {
        self.get().lossy_long()
    }

    /// Intermediate value as float
    fn get_float(&self) -> f32 {
        self.get_double() as f32
    }

    /// Intermediate value as double
    fn get_double(&self) -> f64 {
        self.get().lossy_double()
    }

    /// Reset to the identity
    fn reset(&mut self);

    /// Heap size of the state, only meaningful if the factory requires size estimation
    fn estimated_size(&self) -> usize {
        0
    }

    /// Release the resources
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Buffer mode accumulator, the state lives in the span owned by the group
pub trait BufferAggregator: Debug + Send {
    /// Write the identity into the span
    fn init(&self, span: &mut [u8]);

    /// Aggregate the current row into the span
    fn aggregate(&mut self, span: &mut [u8]) -> Result<()>;

    /// Check the current row can be aggregated into the span, without mutating it
    fn validate(&self, _span: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Intermediate value stored in the span
    fn get(&self, span: &[u8]) -> Value;

    /// Intermediate value as long
    fn get_long(&self, span: &[u8]) -> i64 {
        self.get(span).lossy_long()
    }

    /// Intermediate value as float
    fn get_float(&self, span: &[u8]) -> f32 {
        self.get_double(span) as f32
    }

    /// Intermediate value as double
    fn get_double(&self, span: &[u8]) -> f64 {
        self.get(span).lossy_double()
    }

    /// Release the resources
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Input column of the aggregators
#[derive(Debug, Clone)]
pub enum Input {
    /// Read the field of the row
    Field(String),
    /// Evaluate the expression over the row
    Expression(Arc<Expr>),
}

impl Input {
    /// Create the input from the configuration, exactly one of them should be present
    pub fn try_new(
        name: &str,
        field_name: Option<&str>,
        expression: Option<&str>,
    ) -> std::result::Result<Self, ConfigurationError> {
        match (field_name, expression) {
            (Some(field), None) if !field.is_empty() => Ok(Self::Field(field.to_string())),
            (None, Some(expression)) => Ok(Self::Expression(Arc::new(
                Expr::parse(expression).context(InvalidExpressionSnafu { name })?,
            ))),
            _ => InvalidInputSnafu { name }.fail(),
        }
    }

    /// Create the selector
    pub fn make_selector(&self, selectors: &dyn ColumnSelectorFactory) -> Arc<dyn ValueSelector> {
        match self {
            Self::Field(field) => selectors.make_selector(field),
            Self::Expression(expr) => selectors.make_expression_selector(expr),
        }
    }

    /// Columns read by the input
    pub fn required_fields(&self) -> Vec<String> {
        match self {
            Self::Field(field) => vec![field.clone()],
            Self::Expression(expr) => expr.required_columns(),
        }
    }

    /// Field name, `None` for the expression
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Field(field) => Some(field),
            Self::Expression(_) => None,
        }
    }

    /// Canonical expression, `None` for the field
    pub fn expression(&self) -> Option<String> {
        match self {
            Self::Field(_) => None,
            Self::Expression(expr) => Some(expr.to_string()),
        }
    }

    /// Append the input to the cache key
    pub fn append_cache_key(&self, builder: CacheKeyBuilder) -> CacheKeyBuilder {
        builder
            .append_optional_string(self.field_name())
            .append_optional_string(self.expression().as_deref())
    }
}

/// Check the name of the aggregator
pub(crate) fn check_name(name: &str) -> std::result::Result<(), ConfigurationError> {
    ensure!(!name.is_empty(), EmptyNameSnafu);
    Ok(())
}

/// Compile the optional filter of the aggregator
pub(crate) fn compile_filter(
    name: &str,
    filter: Option<&DimFilter>,
) -> std::result::Result<Option<CompiledFilter>, ConfigurationError> {
    filter
        .map(|filter| filter.compile().context(InvalidFilterSnafu { name }))
        .transpose()
}

/// Required fields of the input and the optional filter, sorted and deduplicated
pub(crate) fn required_fields_with_filter(
    mut fields: Vec<String>,
    filter: Option<&CompiledFilter>,
) -> Vec<String> {
    if let Some(filter) = filter {
        fields.extend(filter.spec().required_columns());
    }
    fields.sort_unstable();
    fields.dedup();
    fields
}

/// Decode the transport forms of the intermediate value: wire bytes and base64 strings
/// of the wire bytes. Numeric strings and strings that are not valid wire payloads are
/// returned as they are, the caller coerces them
pub(crate) fn decode_transport(name: &str, value: Value) -> Result<Value> {
    match value {
        Value::Bytes(bytes) => wire::decode(&bytes).context(WireSnafu { name }),
        Value::String(s) if s.trim().parse::<f64>().is_err() => {
            Ok(wire::decode_base64(&s).unwrap_or(Value::String(s)))
        }
        value => Ok(value),
    }
}

/// Create the aggregator generic over the row predicate: the unfiltered one is
/// monomorphized with [`AlwaysTrue`](crate::filter::AlwaysTrue)
macro_rules! with_predicate {
    ($filter:expr, $selectors:expr, |$predicate:ident| $body:expr) => {
        match $filter {
            None => {
                let $predicate = $crate::filter::AlwaysTrue;
                $body
            }
            Some(filter) => {
                let $predicate = $crate::filter::MatcherPredicate(filter.make_matcher($selectors));
                $body
            }
        }
    };
}

pub(crate) use with_predicate;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::row::InputRow;
    use crate::selector::{ParsePolicy, RowPointer, RowSelectorFactory};

    /// Run the factory over the rows in both modes, check they agree and return the
    /// intermediate value
    pub(crate) fn aggregate_rows(
        factory: &dyn AggregatorFactory,
        rows: &[InputRow],
        policy: ParsePolicy,
    ) -> Result<Value> {
        let selectors = RowSelectorFactory::new(Arc::new(RowPointer::default()), policy);
        let mut aggregator = factory.factorize(&selectors)?;
        let mut buffer_aggregator = factory.factorize_buffered(&selectors)?;
        let mut span = vec![0; factory.max_intermediate_size()];
        buffer_aggregator.init(&mut span);

        for row in rows {
            selectors.pointer().set(Arc::new(row.clone()));
            aggregator.aggregate()?;
            buffer_aggregator.aggregate(&mut span)?;
        }

        let object = aggregator.get();
        let buffer = buffer_aggregator.get(&span);
        assert_eq!(
            factory.compare(&object, &buffer),
            Ordering::Equal,
            "object mode `{}` and buffer mode `{}` disagree",
            object,
            buffer
        );
        Ok(object)
    }

    /// Rows with a single column `value`
    pub(crate) fn value_rows<T: Into<Value> + Clone>(values: &[T]) -> Vec<InputRow> {
        values
            .iter()
            .map(|value| InputRow::new(0).with_column("value", value.clone()))
            .collect()
    }

    #[test]
    fn test_cache_type_ids_are_unique() {
        let mut ids: Vec<u8> = AggregatorKind::ALL
            .iter()
            .map(|kind| kind.cache_type_id())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), AggregatorKind::ALL.len());
    }

    #[test]
    fn test_mergeable_table_is_reflexive_and_strict() {
        for &lhs in AggregatorKind::ALL {
            for &rhs in AggregatorKind::ALL {
                assert_eq!(lhs.is_mergeable_with(rhs), lhs == rhs, "{lhs} vs {rhs}");
            }
        }
    }

    #[test]
    fn test_input_configuration() {
        assert!(matches!(
            Input::try_new("a", Some("x"), None),
            Ok(Input::Field(_))
        ));
        expect_test::expect!["Aggregator `a` requires exactly one of the `fieldName` and `expression`"]
            .assert_eq(&Input::try_new("a", Some("x"), Some("y")).unwrap_err().to_string());
        assert!(Input::try_new("a", None, None).is_err());
        assert!(Input::try_new("a", None, Some("1 +")).is_err());
    }
}
