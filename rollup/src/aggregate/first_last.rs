//! `first`/`last` aggregations, keep the value of the row with the earliest/latest
//! timestamp

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use snafu::ResultExt;

use super::numeric::NumericPrimitive;
use super::spec::{AggregatorSpec, FirstLastSpec};
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError, Input,
    MalformedSnafu, Result, TypeMismatchSnafu, check_name, compile_filter, decode_transport,
    required_fields_with_filter, with_predicate,
};
use crate::TIME_COLUMN;
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::common::types::Timestamp;
use crate::filter::{CompiledFilter, RowPredicate};
use crate::selector::{ColumnSelectorFactory, ValueSelector};
use crate::value::{ComplexType, ComplexValue, TimestampedValue, Value, ValueType};

/// Timestamp, presence byte and the value
const SPAN_SIZE: usize = 17;

/// Primitives that have a pair representation
pub trait PairPrimitive: NumericPrimitive {
    /// Complex type of the pair
    const PAIR_TYPE: ComplexType;
    /// Kind of the first aggregation
    const FIRST_KIND: AggregatorKind;
    /// Kind of the last aggregation
    const LAST_KIND: AggregatorKind;
    /// Spec of the first aggregation
    const FIRST_SPEC: fn(FirstLastSpec) -> AggregatorSpec;
    /// Spec of the last aggregation
    const LAST_SPEC: fn(FirstLastSpec) -> AggregatorSpec;

    /// Wrap the pair
    fn into_pair(pair: TimestampedValue<Self>) -> ComplexValue;

    /// Unwrap the pair
    fn from_pair(value: &ComplexValue) -> Option<TimestampedValue<Self>>;
}

macro_rules! impl_pair_primitive {
    ($ty:ty, $pair:ident, $prefix:ident) => {
        paste::paste! {
            impl PairPrimitive for $ty {
                const PAIR_TYPE: ComplexType = ComplexType::$pair;
                const FIRST_KIND: AggregatorKind = AggregatorKind::[<$prefix First>];
                const LAST_KIND: AggregatorKind = AggregatorKind::[<$prefix Last>];
                const FIRST_SPEC: fn(FirstLastSpec) -> AggregatorSpec = AggregatorSpec::[<$prefix First>];
                const LAST_SPEC: fn(FirstLastSpec) -> AggregatorSpec = AggregatorSpec::[<$prefix Last>];

                #[inline]
                fn into_pair(pair: TimestampedValue<Self>) -> ComplexValue {
                    ComplexValue::$pair(pair)
                }

                #[inline]
                fn from_pair(value: &ComplexValue) -> Option<TimestampedValue<Self>> {
                    match value {
                        ComplexValue::$pair(pair) => Some(*pair),
                        _ => None,
                    }
                }
            }
        }
    };
}

impl_pair_primitive!(i64, LongPair, Long);
impl_pair_primitive!(f64, DoublePair, Double);

#[inline]
fn identity<const IS_FIRST: bool, T>() -> TimestampedValue<T> {
    TimestampedValue {
        timestamp: if IS_FIRST { Timestamp::MAX } else { Timestamp::MIN },
        value: None,
    }
}

/// Returns true if the candidate replaces the current pair. Ties keep the current one
#[inline]
fn replaces<const IS_FIRST: bool>(current: Timestamp, candidate: Timestamp) -> bool {
    if IS_FIRST {
        candidate < current
    } else {
        candidate > current
    }
}

#[derive(Debug)]
struct PairReader {
    name: Arc<str>,
    time: Arc<dyn ValueSelector>,
    value: Arc<dyn ValueSelector>,
}

impl PairReader {
    /// Read the pair of the current row, `None` if the row has no timestamp
    fn read<T: PairPrimitive>(&self) -> Result<Option<TimestampedValue<T>>> {
        let context = || MalformedSnafu { name: &*self.name };
        let Some(timestamp) = self.time.get_timestamp().with_context(|_| context())? else {
            return Ok(None);
        };
        let value = T::read(&*self.value).with_context(|_| context())?;
        Ok(Some(TimestampedValue { timestamp, value }))
    }
}

#[derive(Debug)]
struct FirstLastAggregator<const IS_FIRST: bool, T, P> {
    reader: PairReader,
    predicate: P,
    state: TimestampedValue<T>,
}

impl<const IS_FIRST: bool, T: PairPrimitive, P: RowPredicate> Aggregator
    for FirstLastAggregator<IS_FIRST, T, P>
{
    fn aggregate(&mut self) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        if let Some(pair) = self.reader.read::<T>()? {
            if replaces::<IS_FIRST>(self.state.timestamp, pair.timestamp) {
                self.state = pair;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            self.reader.read::<T>()?;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        Value::Complex(T::into_pair(self.state))
    }

    fn get_long(&self) -> i64 {
        self.state.value.map_or(0, T::as_i64)
    }

    fn get_double(&self) -> f64 {
        self.state.value.map_or(0.0, T::as_f64)
    }

    fn reset(&mut self) {
        self.state = identity::<IS_FIRST, T>();
    }
}

#[inline]
fn load<T: PairPrimitive>(span: &[u8]) -> TimestampedValue<T> {
    TimestampedValue {
        timestamp: i64::load(span),
        value: (span[8] != 0).then(|| T::load(&span[9..])),
    }
}

#[inline]
fn store<T: PairPrimitive>(span: &mut [u8], pair: TimestampedValue<T>) {
    pair.timestamp.store(span);
    match pair.value {
        Some(value) => {
            span[8] = 1;
            value.store(&mut span[9..]);
        }
        None => {
            span[8] = 0;
            T::ZERO.store(&mut span[9..]);
        }
    }
}

#[derive(Debug)]
struct FirstLastBufferAggregator<const IS_FIRST: bool, T, P> {
    reader: PairReader,
    predicate: P,
    _primitive: PhantomData<T>,
}

impl<const IS_FIRST: bool, T: PairPrimitive, P: RowPredicate> BufferAggregator
    for FirstLastBufferAggregator<IS_FIRST, T, P>
{
    fn init(&self, span: &mut [u8]) {
        store(span, identity::<IS_FIRST, T>());
    }

    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        if let Some(pair) = self.reader.read::<T>()? {
            if replaces::<IS_FIRST>(i64::load(span), pair.timestamp) {
                store(span, pair);
            }
        }
        Ok(())
    }

    fn validate(&self, _span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            self.reader.read::<T>()?;
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        Value::Complex(T::into_pair(load(span)))
    }
}

/// Factory of the `first`/`last` aggregations
///
/// # Generic
///
/// - `IS_FIRST`: keep the earliest pair if true, the latest otherwise
///
/// - `T`: type of the value
#[derive(Debug)]
pub struct FirstLastAggregatorFactory<const IS_FIRST: bool, T> {
    name: String,
    input: Input,
    time_column: String,
    filter: Option<CompiledFilter>,
    _primitive: PhantomData<T>,
}

/// `longFirst` aggregation
pub type LongFirstAggregatorFactory = FirstLastAggregatorFactory<true, i64>;
/// `longLast` aggregation
pub type LongLastAggregatorFactory = FirstLastAggregatorFactory<false, i64>;
/// `doubleFirst` aggregation
pub type DoubleFirstAggregatorFactory = FirstLastAggregatorFactory<true, f64>;
/// `doubleLast` aggregation
pub type DoubleLastAggregatorFactory = FirstLastAggregatorFactory<false, f64>;

impl<const IS_FIRST: bool, T: PairPrimitive> FirstLastAggregatorFactory<IS_FIRST, T> {
    /// Create the factory from its declarative form
    pub fn try_from_spec(spec: &FirstLastSpec) -> std::result::Result<Self, ConfigurationError> {
        check_name(&spec.name)?;
        Ok(Self {
            input: Input::try_new(
                &spec.name,
                spec.field_name.as_deref(),
                spec.expression.as_deref(),
            )?,
            time_column: spec
                .time_column
                .clone()
                .unwrap_or_else(|| TIME_COLUMN.to_string()),
            filter: compile_filter(&spec.name, spec.filter.as_ref())?,
            name: spec.name.clone(),
            _primitive: PhantomData,
        })
    }

    /// Create the factory reads the field and the row timestamp
    pub fn with_field(
        name: impl Into<String>,
        field_name: &str,
    ) -> std::result::Result<Self, ConfigurationError> {
        Self::try_from_spec(&FirstLastSpec {
            name: name.into(),
            field_name: Some(field_name.to_string()),
            expression: None,
            time_column: None,
            filter: None,
        })
    }

    fn reader(&self, selectors: &dyn ColumnSelectorFactory) -> PairReader {
        PairReader {
            name: Arc::from(self.name.as_str()),
            time: selectors.make_selector(&self.time_column),
            value: self.input.make_selector(selectors),
        }
    }

    fn pair(&self, value: &Value) -> Result<Option<TimestampedValue<T>>> {
        match value {
            Value::Null => Ok(None),
            Value::Complex(complex) => match T::from_pair(complex) {
                Some(pair) => Ok(Some(pair)),
                None => self.mismatch(value),
            },
            value => self.mismatch(value),
        }
    }

    fn mismatch(&self, value: &Value) -> Result<Option<TimestampedValue<T>>> {
        TypeMismatchSnafu {
            name: &self.name,
            expect: ValueType::Complex(T::PAIR_TYPE),
            found: value.to_string(),
        }
        .fail()
    }
}

impl<const IS_FIRST: bool, T: PairPrimitive> AggregatorFactory
    for FirstLastAggregatorFactory<IS_FIRST, T>
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AggregatorKind {
        if IS_FIRST { T::FIRST_KIND } else { T::LAST_KIND }
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        let reader = self.reader(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(FirstLastAggregator::<IS_FIRST, T, _> {
                reader,
                predicate,
                state: identity::<IS_FIRST, T>(),
            }) as Box<dyn Aggregator>
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        let reader = self.reader(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(FirstLastBufferAggregator::<IS_FIRST, T, _> {
                reader,
                predicate,
                _primitive: PhantomData,
            }) as Box<dyn BufferAggregator>
        }))
    }

    /// Pairs are ordered by their values
    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let value = |value: &Value| self.pair(value).ok().flatten().and_then(|pair| pair.value);
        match (value(lhs), value(rhs)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(lhs), Some(rhs)) => lhs.total_cmp(&rhs),
        }
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        Ok(match (self.pair(&lhs)?, self.pair(&rhs)?) {
            (None, None) => Value::Null,
            (Some(pair), None) | (None, Some(pair)) => Value::Complex(T::into_pair(pair)),
            (Some(lhs), Some(rhs)) => {
                let pair = if replaces::<IS_FIRST>(lhs.timestamp, rhs.timestamp) {
                    rhs
                } else {
                    lhs
                };
                Value::Complex(T::into_pair(pair))
            }
        })
    }

    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        Arc::new(Self {
            name: self.name.clone(),
            input: Input::Field(self.name.clone()),
            time_column: self.time_column.clone(),
            filter: None,
            _primitive: PhantomData,
        })
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        let value = decode_transport(&self.name, value)?;
        Ok(self
            .pair(&value)?
            .map_or(Value::Null, |pair| Value::Complex(T::into_pair(pair))))
    }

    fn finalize_computation(&self, value: Value) -> Value {
        match self.pair(&value) {
            Ok(Some(TimestampedValue {
                value: Some(value), ..
            })) => value.into_value(),
            _ => Value::Null,
        }
    }

    fn required_fields(&self) -> Vec<String> {
        let mut fields = self.input.required_fields();
        fields.push(self.time_column.clone());
        required_fields_with_filter(fields, self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        self.input
            .append_cache_key(CacheKeyBuilder::new(self.kind().cache_type_id()))
            .append_string(&self.time_column)
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        ValueType::Complex(T::PAIR_TYPE)
    }

    fn output_type(&self) -> ValueType {
        T::VALUE_TYPE
    }

    fn max_intermediate_size(&self) -> usize {
        SPAN_SIZE
    }

    fn identity(&self) -> Value {
        Value::Complex(T::into_pair(identity::<IS_FIRST, T>()))
    }

    fn spec(&self) -> AggregatorSpec {
        let spec = if IS_FIRST { T::FIRST_SPEC } else { T::LAST_SPEC };
        spec(FirstLastSpec {
            name: self.name.clone(),
            field_name: self.input.field_name().map(ToString::to_string),
            expression: self.input.expression(),
            time_column: (self.time_column != TIME_COLUMN).then(|| self.time_column.clone()),
            filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::tests::aggregate_rows;
    use crate::row::InputRow;
    use crate::selector::ParsePolicy;

    fn rows() -> Vec<InputRow> {
        vec![
            InputRow::new(2_000).with_column("value", 20_i64),
            InputRow::new(1_000).with_column("value", 10_i64),
            InputRow::new(3_000).with_column("value", 30_i64),
            InputRow::new(1_000).with_column("value", 11_i64),
        ]
    }

    #[test]
    fn test_first_last() -> Report<AggregationError> {
        Report::capture(|| {
            let first = LongFirstAggregatorFactory::with_field("first", "value").unwrap();
            let last = DoubleLastAggregatorFactory::with_field("last", "value").unwrap();
            let state = aggregate_rows(&first, &rows(), ParsePolicy::Strict)?;
            // Ties keep the pair seen first
            assert_eq!(first.finalize_computation(state), Value::Long(10));
            let state = aggregate_rows(&last, &rows(), ParsePolicy::Strict)?;
            assert_eq!(last.finalize_computation(state), Value::Double(30.0));
            assert_eq!(first.required_fields(), vec![TIME_COLUMN, "value"]);
            Ok(())
        })
    }

    #[test]
    fn test_combine_keeps_earliest() -> Report<AggregationError> {
        Report::capture(|| {
            let first = LongFirstAggregatorFactory::with_field("first", "value").unwrap();
            let rows = rows();
            let (lhs, rhs) = rows.split_at(2);
            let lhs = aggregate_rows(&first, lhs, ParsePolicy::Strict)?;
            let rhs = aggregate_rows(&first, rhs, ParsePolicy::Strict)?;
            let combined = first.combine(rhs, lhs)?;
            assert_eq!(
                combined,
                Value::Complex(ComplexValue::LongPair(TimestampedValue {
                    timestamp: 1_000,
                    value: Some(11),
                }))
            );
            assert_eq!(first.combine(first.identity(), combined.clone())?, combined);
            Ok(())
        })
    }

    #[test]
    fn test_round_trip() -> Report<AggregationError> {
        Report::capture(|| {
            let last = DoubleLastAggregatorFactory::with_field("last", "value").unwrap();
            let value = Value::Complex(ComplexValue::DoublePair(TimestampedValue {
                timestamp: 42,
                value: None,
            }));
            let bytes = last.serialize(&value)?;
            assert_eq!(last.deserialize(Value::Bytes(bytes))?, value);
            assert_eq!(last.finalize_computation(value), Value::Null);
            assert!(last.deserialize(Value::Long(3)).is_err());
            Ok(())
        })
    }
}
