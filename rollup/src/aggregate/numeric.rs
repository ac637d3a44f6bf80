//! Numeric aggregations, one generic implementation parameterised by the kernel
//!
//! A [`NumericKernel`] describes a fixed width state: how to read the input, fold it,
//! and how the state is stored in the span. [`NumericAggregatorFactory`] turns any
//! kernel into a complete aggregation with both the object mode and the buffer mode
//! accumulators

use std::cmp::Ordering;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use snafu::ResultExt;

use super::spec::{AggregatorSpec, InputSpec};
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError, Input,
    MalformedSnafu, Result, TypeMismatchSnafu, check_name, compile_filter, decode_transport,
    required_fields_with_filter, with_predicate,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::common::types::Timestamp;
use crate::filter::{CompiledFilter, DimFilter, RowPredicate};
use crate::private::Sealed;
use crate::row::parse_timestamp;
use crate::selector::{ColumnSelectorFactory, SelectorResult, ValueSelector};
use crate::value::{ComplexType, ComplexValue, RangeState, Value, ValueError, ValueType};

/// Primitive types the numeric aggregations work on
pub trait NumericPrimitive: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// Value type of the primitive
    const VALUE_TYPE: ValueType;
    /// Number of bytes in the span
    const WIDTH: usize;
    /// Zero
    const ZERO: Self;
    /// Lowest value, identity of the max
    const LOWEST: Self;
    /// Highest value, identity of the min
    const HIGHEST: Self;
    /// Kind of the sum over this primitive
    const SUM_KIND: AggregatorKind;
    /// Kind of the min over this primitive
    const MIN_KIND: AggregatorKind;
    /// Kind of the max over this primitive
    const MAX_KIND: AggregatorKind;
    /// Spec of the sum aggregation
    const SUM_SPEC: fn(InputSpec) -> AggregatorSpec;
    /// Spec of the min aggregation
    const MIN_SPEC: fn(InputSpec) -> AggregatorSpec;
    /// Spec of the max aggregation
    const MAX_SPEC: fn(InputSpec) -> AggregatorSpec;

    /// Add, integers wrap (or saturate with the `saturating` feature)
    fn add(self, other: Self) -> Self;

    /// Read the primitive from the selector
    fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<Self>>;

    /// Coerce the value to the primitive
    fn from_value(value: &Value) -> std::result::Result<Option<Self>, ValueError>;

    /// Wrap the primitive into value
    fn into_value(self) -> Value;

    /// Load the primitive from the span
    fn load(span: &[u8]) -> Self;

    /// Store the primitive into the span
    fn store(self, span: &mut [u8]);

    /// Total order
    fn total_cmp(&self, other: &Self) -> Ordering;

    /// Lossy conversion to double
    fn as_f64(self) -> f64;

    /// Lossy conversion to long
    fn as_i64(self) -> i64;
}

macro_rules! impl_numeric_primitive {
    ($ty:ty, $variant:ident, $read:ident, $coerce:ident, $lowest:expr, $highest:expr, |$a:ident, $b:ident| $add:expr, |$l:ident, $r:ident| $cmp:expr) => {
        paste::paste! {
            impl NumericPrimitive for $ty {
                const VALUE_TYPE: ValueType = ValueType::$variant;
                const WIDTH: usize = std::mem::size_of::<$ty>();
                const ZERO: Self = 0 as $ty;
                const LOWEST: Self = $lowest;
                const HIGHEST: Self = $highest;
                const SUM_KIND: AggregatorKind = AggregatorKind::[<$variant Sum>];
                const MIN_KIND: AggregatorKind = AggregatorKind::[<$variant Min>];
                const MAX_KIND: AggregatorKind = AggregatorKind::[<$variant Max>];
                const SUM_SPEC: fn(InputSpec) -> AggregatorSpec = AggregatorSpec::[<$variant Sum>];
                const MIN_SPEC: fn(InputSpec) -> AggregatorSpec = AggregatorSpec::[<$variant Min>];
                const MAX_SPEC: fn(InputSpec) -> AggregatorSpec = AggregatorSpec::[<$variant Max>];

                #[inline]
                fn add(self, other: Self) -> Self {
                    let ($a, $b) = (self, other);
                    $add
                }

                #[inline]
                fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<Self>> {
                    selector.$read()
                }

                #[inline]
                fn from_value(value: &Value) -> std::result::Result<Option<Self>, ValueError> {
                    value.$coerce()
                }

                #[inline]
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                #[inline]
                fn load(span: &[u8]) -> Self {
                    let mut array = [0; std::mem::size_of::<$ty>()];
                    array.copy_from_slice(&span[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_be_bytes(array)
                }

                #[inline]
                fn store(self, span: &mut [u8]) {
                    span[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_be_bytes());
                }

                #[inline]
                fn total_cmp(&self, other: &Self) -> Ordering {
                    let ($l, $r) = (self, other);
                    $cmp
                }

                #[inline]
                fn as_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn as_i64(self) -> i64 {
                    self as i64
                }
            }
        }
    };
}

#[cfg(not(feature = "saturating"))]
impl_numeric_primitive!(
    i64,
    Long,
    get_long,
    to_long,
    i64::MIN,
    i64::MAX,
    |a, b| a.wrapping_add(b),
    |l, r| l.cmp(r)
);
#[cfg(feature = "saturating")]
impl_numeric_primitive!(
    i64,
    Long,
    get_long,
    to_long,
    i64::MIN,
    i64::MAX,
    |a, b| a.saturating_add(b),
    |l, r| l.cmp(r)
);
impl_numeric_primitive!(
    f32,
    Float,
    get_float,
    to_float,
    f32::NEG_INFINITY,
    f32::INFINITY,
    |a, b| a + b,
    |l, r| l.total_cmp(r)
);
impl_numeric_primitive!(
    f64,
    Double,
    get_double,
    to_double,
    f64::NEG_INFINITY,
    f64::INFINITY,
    |a, b| a + b,
    |l, r| l.total_cmp(r)
);

/// Kernel of the numeric aggregation: a fixed width state folded from the input
pub trait NumericKernel: Sealed + Debug + Send + Sync + 'static {
    /// State of the aggregation
    type Native: Copy + Debug + Send + Sync + 'static;

    /// Kind of the aggregation
    const KIND: AggregatorKind;
    /// Number of bytes in the span
    const WIDTH: usize;
    /// Type of the intermediate value
    const INTERMEDIATE_TYPE: ValueType;
    /// Type of the finalized value
    const OUTPUT_TYPE: ValueType;
    /// Input column used when neither field nor expression is configured
    const DEFAULT_FIELD: Option<&'static str> = None;
    /// Declarative form of the aggregation
    const SPEC: fn(InputSpec) -> AggregatorSpec;

    /// State of the empty group
    fn identity() -> Self::Native;

    /// Fold the input into the state. It is associative and commutative
    fn fold(acc: Self::Native, value: Self::Native) -> Self::Native;

    /// Read the input of the current row
    fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<Self::Native>>;

    /// Wrap the state into the intermediate value
    fn to_value(state: Self::Native) -> Value;

    /// Unwrap the intermediate value into state
    fn from_value(value: &Value) -> std::result::Result<Option<Self::Native>, ValueError>;

    /// Finalize the state
    fn finalize(state: Self::Native) -> Value {
        Self::to_value(state)
    }

    /// Load the state from the span
    fn load(span: &[u8]) -> Self::Native;

    /// Store the state into the span
    fn store(span: &mut [u8], state: Self::Native);

    /// Total order of the states
    fn compare(lhs: &Self::Native, rhs: &Self::Native) -> Ordering;

    /// Lossy double view of the state
    fn as_f64(state: Self::Native) -> f64;

    /// Lossy long view of the state
    fn as_i64(state: Self::Native) -> i64;
}

macro_rules! primitive_kernel {
    ($kernel:ident, $doc:literal, $kind:ident, $spec:ident, $identity:ident, |$acc:ident, $value:ident| $fold:expr) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $kernel<T>(PhantomData<T>);

        impl<T> Sealed for $kernel<T> {}

        impl<T: NumericPrimitive> NumericKernel for $kernel<T> {
            type Native = T;

            const KIND: AggregatorKind = T::$kind;
            const SPEC: fn(InputSpec) -> AggregatorSpec = T::$spec;
            const WIDTH: usize = T::WIDTH;
            const INTERMEDIATE_TYPE: ValueType = T::VALUE_TYPE;
            const OUTPUT_TYPE: ValueType = T::VALUE_TYPE;

            #[inline]
            fn identity() -> T {
                T::$identity
            }

            #[inline]
            fn fold($acc: T, $value: T) -> T {
                $fold
            }

            #[inline]
            fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<T>> {
                T::read(selector)
            }

            #[inline]
            fn to_value(state: T) -> Value {
                state.into_value()
            }

            #[inline]
            fn from_value(value: &Value) -> std::result::Result<Option<T>, ValueError> {
                T::from_value(value)
            }

            #[inline]
            fn load(span: &[u8]) -> T {
                T::load(span)
            }

            #[inline]
            fn store(span: &mut [u8], state: T) {
                state.store(span)
            }

            #[inline]
            fn compare(lhs: &T, rhs: &T) -> Ordering {
                lhs.total_cmp(rhs)
            }

            #[inline]
            fn as_f64(state: T) -> f64 {
                state.as_f64()
            }

            #[inline]
            fn as_i64(state: T) -> i64 {
                state.as_i64()
            }
        }
    };
}

primitive_kernel!(
    Sum,
    "Sum, starts at zero",
    SUM_KIND,
    SUM_SPEC,
    ZERO,
    |acc, value| acc.add(value)
);
// NaN never wins the comparison, therefore it is ignored by min/max
primitive_kernel!(
    Min,
    "Minimum, starts at the highest value",
    MIN_KIND,
    MIN_SPEC,
    HIGHEST,
    |acc, value| if value < acc { value } else { acc }
);
primitive_kernel!(
    Max,
    "Maximum, starts at the lowest value",
    MAX_KIND,
    MAX_SPEC,
    LOWEST,
    |acc, value| if value > acc { value } else { acc }
);

/// Minimum (`IS_MIN = true`) or maximum of the timestamps, read as epoch milliseconds,
/// numeric strings or RFC 3339 strings
#[derive(Debug)]
pub struct TimeExtremum<const IS_MIN: bool>;

impl<const IS_MIN: bool> Sealed for TimeExtremum<IS_MIN> {}

impl<const IS_MIN: bool> NumericKernel for TimeExtremum<IS_MIN> {
    type Native = Timestamp;

    const KIND: AggregatorKind = if IS_MIN {
        AggregatorKind::TimeMin
    } else {
        AggregatorKind::TimeMax
    };
    const WIDTH: usize = 8;
    const INTERMEDIATE_TYPE: ValueType = ValueType::Long;
    const OUTPUT_TYPE: ValueType = ValueType::Long;
    const DEFAULT_FIELD: Option<&'static str> = Some(crate::TIME_COLUMN);
    const SPEC: fn(InputSpec) -> AggregatorSpec = if IS_MIN {
        AggregatorSpec::TimeMin
    } else {
        AggregatorSpec::TimeMax
    };

    #[inline]
    fn identity() -> Timestamp {
        if IS_MIN { Timestamp::MAX } else { Timestamp::MIN }
    }

    #[inline]
    fn fold(acc: Timestamp, value: Timestamp) -> Timestamp {
        if IS_MIN {
            std::cmp::min(acc, value)
        } else {
            std::cmp::max(acc, value)
        }
    }

    #[inline]
    fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<Timestamp>> {
        selector.get_timestamp()
    }

    #[inline]
    fn to_value(state: Timestamp) -> Value {
        Value::Long(state)
    }

    fn from_value(value: &Value) -> std::result::Result<Option<Timestamp>, ValueError> {
        if let Value::String(s) = value {
            if let Some(timestamp) = parse_timestamp(s) {
                return Ok(Some(timestamp));
            }
        }
        value.to_long()
    }

    /// The identity means no timestamp is seen
    fn finalize(state: Timestamp) -> Value {
        if state == Self::identity() {
            Value::Null
        } else {
            Value::Long(state)
        }
    }

    #[inline]
    fn load(span: &[u8]) -> Timestamp {
        i64::load(span)
    }

    #[inline]
    fn store(span: &mut [u8], state: Timestamp) {
        state.store(span)
    }

    #[inline]
    fn compare(lhs: &Timestamp, rhs: &Timestamp) -> Ordering {
        lhs.cmp(rhs)
    }

    #[inline]
    fn as_f64(state: Timestamp) -> f64 {
        state as f64
    }

    #[inline]
    fn as_i64(state: Timestamp) -> i64 {
        state
    }
}

/// Range of the doubles, finalized to `max - min`
#[derive(Debug)]
pub struct RangeKernel;

impl Sealed for RangeKernel {}

impl NumericKernel for RangeKernel {
    type Native = RangeState;

    const KIND: AggregatorKind = AggregatorKind::Range;
    const WIDTH: usize = 16;
    const INTERMEDIATE_TYPE: ValueType = ValueType::Complex(ComplexType::Range);
    const OUTPUT_TYPE: ValueType = ValueType::Double;
    const SPEC: fn(InputSpec) -> AggregatorSpec = AggregatorSpec::Range;

    #[inline]
    fn identity() -> RangeState {
        RangeState::EMPTY
    }

    #[inline]
    fn fold(acc: RangeState, value: RangeState) -> RangeState {
        RangeState {
            min: acc.min.min(value.min),
            max: acc.max.max(value.max),
        }
    }

    #[inline]
    fn read(selector: &dyn ValueSelector) -> SelectorResult<Option<RangeState>> {
        Ok(selector
            .get_double()?
            .filter(|v| !v.is_nan())
            .map(|v| RangeState { min: v, max: v }))
    }

    #[inline]
    fn to_value(state: RangeState) -> Value {
        Value::Complex(ComplexValue::Range(state))
    }

    fn from_value(value: &Value) -> std::result::Result<Option<RangeState>, ValueError> {
        match value {
            Value::Complex(ComplexValue::Range(range)) => Ok(Some(*range)),
            value => Ok(value
                .to_double()?
                .filter(|v| !v.is_nan())
                .map(|v| RangeState { min: v, max: v })),
        }
    }

    fn finalize(state: RangeState) -> Value {
        state.width().map_or(Value::Null, Value::Double)
    }

    #[inline]
    fn load(span: &[u8]) -> RangeState {
        RangeState {
            min: f64::load(span),
            max: f64::load(&span[8..]),
        }
    }

    #[inline]
    fn store(span: &mut [u8], state: RangeState) {
        state.min.store(span);
        state.max.store(&mut span[8..]);
    }

    fn compare(lhs: &RangeState, rhs: &RangeState) -> Ordering {
        let width = |range: &RangeState| range.width().unwrap_or(f64::NEG_INFINITY);
        width(lhs)
            .total_cmp(&width(rhs))
            .then_with(|| lhs.min.total_cmp(&rhs.min))
    }

    #[inline]
    fn as_f64(state: RangeState) -> f64 {
        state.width().unwrap_or(0.0)
    }

    #[inline]
    fn as_i64(state: RangeState) -> i64 {
        state.width().unwrap_or(0.0) as i64
    }
}

/// Object mode accumulator of the numeric kernel
#[derive(Debug)]
pub struct NumericAggregator<K: NumericKernel, P> {
    name: Arc<str>,
    selector: Arc<dyn ValueSelector>,
    predicate: P,
    state: K::Native,
}

impl<K: NumericKernel, P: RowPredicate> Aggregator for NumericAggregator<K, P> {
    #[inline]
    fn aggregate(&mut self) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        let value = K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })?;
        if let Some(value) = value {
            self.state = K::fold(self.state, value);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })?;
        }
        Ok(())
    }

    #[inline]
    fn get(&self) -> Value {
        K::to_value(self.state)
    }

    #[inline]
    fn get_long(&self) -> i64 {
        K::as_i64(self.state)
    }

    #[inline]
    fn get_double(&self) -> f64 {
        K::as_f64(self.state)
    }

    #[inline]
    fn reset(&mut self) {
        self.state = K::identity();
    }
}

/// Buffer mode accumulator of the numeric kernel
#[derive(Debug)]
pub struct NumericBufferAggregator<K, P> {
    name: Arc<str>,
    selector: Arc<dyn ValueSelector>,
    predicate: P,
    _kernel: PhantomData<K>,
}

impl<K: NumericKernel, P: RowPredicate> BufferAggregator for NumericBufferAggregator<K, P> {
    #[inline]
    fn init(&self, span: &mut [u8]) {
        K::store(span, K::identity());
    }

    #[inline]
    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        let value = K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })?;
        if let Some(value) = value {
            K::store(span, K::fold(K::load(span), value));
        }
        Ok(())
    }

    fn validate(&self, _span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })?;
        }
        Ok(())
    }

    #[inline]
    fn get(&self, span: &[u8]) -> Value {
        K::to_value(K::load(span))
    }

    #[inline]
    fn get_long(&self, span: &[u8]) -> i64 {
        K::as_i64(K::load(span))
    }

    #[inline]
    fn get_double(&self, span: &[u8]) -> f64 {
        K::as_f64(K::load(span))
    }
}

/// Factory of the numeric aggregation
///
/// # Generic
///
/// - `K`: The kernel of the aggregation
#[derive(Debug)]
pub struct NumericAggregatorFactory<K> {
    name: String,
    input: Input,
    filter: Option<CompiledFilter>,
    _kernel: PhantomData<K>,
}

impl<K: NumericKernel> NumericAggregatorFactory<K> {
    /// Create the factory, exactly one of the field and expression should be configured
    /// unless the kernel has a default field
    pub fn try_new(
        name: impl Into<String>,
        field_name: Option<&str>,
        expression: Option<&str>,
        filter: Option<&DimFilter>,
    ) -> std::result::Result<Self, ConfigurationError> {
        let name = name.into();
        check_name(&name)?;
        let field_name = match (field_name, expression) {
            (None, None) => K::DEFAULT_FIELD,
            _ => field_name,
        };
        Ok(Self {
            input: Input::try_new(&name, field_name, expression)?,
            filter: compile_filter(&name, filter)?,
            name,
            _kernel: PhantomData,
        })
    }

    /// Create the factory reads the field
    pub fn with_field(
        name: impl Into<String>,
        field_name: &str,
    ) -> std::result::Result<Self, ConfigurationError> {
        Self::try_new(name, Some(field_name), None, None)
    }

    /// Factory reads the intermediate values stored in the column of the same name
    pub(crate) fn combining(name: &str) -> Self {
        Self {
            name: name.to_string(),
            input: Input::Field(name.to_string()),
            filter: None,
            _kernel: PhantomData,
        }
    }

    /// Convert the intermediate value into state
    fn native(&self, value: &Value) -> Result<Option<K::Native>> {
        K::from_value(value).map_err(|_| {
            TypeMismatchSnafu {
                name: &self.name,
                expect: K::INTERMEDIATE_TYPE,
                found: value.to_string(),
            }
            .build()
        })
    }
}

impl<K: NumericKernel> AggregatorFactory for NumericAggregatorFactory<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AggregatorKind {
        K::KIND
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        let name: Arc<str> = Arc::from(self.name.as_str());
        let selector = self.input.make_selector(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(NumericAggregator::<K, _> {
                name,
                selector,
                predicate,
                state: K::identity(),
            }) as Box<dyn Aggregator>
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        let name: Arc<str> = Arc::from(self.name.as_str());
        let selector = self.input.make_selector(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(NumericBufferAggregator::<K, _> {
                name,
                selector,
                predicate,
                _kernel: PhantomData,
            }) as Box<dyn BufferAggregator>
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let lhs = K::from_value(lhs).ok().flatten();
        let rhs = K::from_value(rhs).ok().flatten();
        match (lhs, rhs) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(lhs), Some(rhs)) => K::compare(&lhs, &rhs),
        }
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        Ok(match (self.native(&lhs)?, self.native(&rhs)?) {
            (None, None) => Value::Null,
            (Some(state), None) | (None, Some(state)) => K::to_value(state),
            (Some(lhs), Some(rhs)) => K::to_value(K::fold(lhs, rhs)),
        })
    }

    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        Arc::new(Self::combining(&self.name))
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        let value = decode_transport(&self.name, value)?;
        Ok(self.native(&value)?.map_or(Value::Null, K::to_value))
    }

    fn finalize_computation(&self, value: Value) -> Value {
        match K::from_value(&value) {
            Ok(Some(state)) => K::finalize(state),
            _ => Value::Null,
        }
    }

    fn required_fields(&self) -> Vec<String> {
        required_fields_with_filter(self.input.required_fields(), self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        self.input
            .append_cache_key(CacheKeyBuilder::new(K::KIND.cache_type_id()))
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        K::INTERMEDIATE_TYPE
    }

    fn output_type(&self) -> ValueType {
        K::OUTPUT_TYPE
    }

    fn max_intermediate_size(&self) -> usize {
        K::WIDTH
    }

    fn identity(&self) -> Value {
        K::to_value(K::identity())
    }

    fn spec(&self) -> AggregatorSpec {
        (K::SPEC)(InputSpec {
            name: self.name.clone(),
            field_name: self.input.field_name().map(ToString::to_string),
            expression: self.input.expression(),
            filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
        })
    }
}

macro_rules! numeric_factories {
    ($(($prefix:ident, $ty:ty)),+) => {
        paste::paste! {
            $(
                #[doc = concat!("`", stringify!([<$prefix:lower Sum>]), "` aggregation")]
                pub type [<$prefix SumAggregatorFactory>] = NumericAggregatorFactory<Sum<$ty>>;
                #[doc = concat!("`", stringify!([<$prefix:lower Min>]), "` aggregation")]
                pub type [<$prefix MinAggregatorFactory>] = NumericAggregatorFactory<Min<$ty>>;
                #[doc = concat!("`", stringify!([<$prefix:lower Max>]), "` aggregation")]
                pub type [<$prefix MaxAggregatorFactory>] = NumericAggregatorFactory<Max<$ty>>;
            )+
        }
    };
}

numeric_factories!((Long, i64), (Float, f32), (Double, f64));

/// `timeMin` aggregation
pub type TimeMinAggregatorFactory = NumericAggregatorFactory<TimeExtremum<true>>;
/// `timeMax` aggregation
pub type TimeMaxAggregatorFactory = NumericAggregatorFactory<TimeExtremum<false>>;
/// `range` aggregation
pub type RangeAggregatorFactory = NumericAggregatorFactory<RangeKernel>;

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::tests::{aggregate_rows, value_rows};
    use crate::row::InputRow;
    use crate::selector::ParsePolicy;
    use crate::wire;

    #[test]
    fn test_sum_with_predicate() -> Report<AggregationError> {
        Report::capture(|| {
            let factory = LongSumAggregatorFactory::try_new(
                "big",
                Some("value"),
                None,
                Some(&DimFilter::expression("value > 10")),
            )
            .unwrap();
            let sum = aggregate_rows(&factory, &value_rows(&[5_i64, 15, 20]), ParsePolicy::Strict)?;
            assert_eq!(sum, Value::Long(35));
            assert_eq!(factory.required_fields(), vec!["value"]);
            Ok(())
        })
    }

    #[test]
    fn test_identities() -> Report<AggregationError> {
        Report::capture(|| {
            let rows: Vec<InputRow> = vec![];
            let cases: Vec<(Box<dyn AggregatorFactory>, Value)> = vec![
                (
                    Box::new(LongSumAggregatorFactory::with_field("a", "value").unwrap()),
                    Value::Long(0),
                ),
                (
                    Box::new(LongMinAggregatorFactory::with_field("a", "value").unwrap()),
                    Value::Long(i64::MAX),
                ),
                (
                    Box::new(LongMaxAggregatorFactory::with_field("a", "value").unwrap()),
                    Value::Long(i64::MIN),
                ),
                (
                    Box::new(DoubleMinAggregatorFactory::with_field("a", "value").unwrap()),
                    Value::Double(f64::INFINITY),
                ),
                (
                    Box::new(FloatMaxAggregatorFactory::with_field("a", "value").unwrap()),
                    Value::Float(f32::NEG_INFINITY),
                ),
            ];
            for (factory, identity) in cases {
                assert_eq!(aggregate_rows(&*factory, &rows, ParsePolicy::Strict)?, identity);
                assert_eq!(factory.identity(), identity);
                // Combining with the identity is a no-op
                assert_eq!(factory.combine(identity.clone(), factory.identity())?, identity);
            }
            Ok(())
        })
    }

    #[test]
    fn test_min_max_float() -> Report<AggregationError> {
        Report::capture(|| {
            let rows = value_rows(&[3.5, -1.0, 7.25]);
            let min = DoubleMinAggregatorFactory::with_field("min", "value").unwrap();
            let max = FloatMaxAggregatorFactory::with_field("max", "value").unwrap();
            let sum = DoubleSumAggregatorFactory::with_field("sum", "value").unwrap();
            assert_eq!(aggregate_rows(&min, &rows, ParsePolicy::Strict)?, Value::Double(-1.0));
            assert_eq!(aggregate_rows(&max, &rows, ParsePolicy::Strict)?, Value::Float(7.25));
            assert_eq!(aggregate_rows(&sum, &rows, ParsePolicy::Strict)?, Value::Double(9.75));
            Ok(())
        })
    }

    #[test]
    fn test_combine_is_associative() -> Report<AggregationError> {
        Report::capture(|| {
            let mut rng = StdRng::seed_from_u64(7);
            let values: Vec<i64> = (0..64).map(|_| rng.gen_range(-1000..1000)).collect();
            let factories: Vec<Box<dyn AggregatorFactory>> = vec![
                Box::new(LongSumAggregatorFactory::with_field("a", "value").unwrap()),
                Box::new(LongMinAggregatorFactory::with_field("a", "value").unwrap()),
                Box::new(LongMaxAggregatorFactory::with_field("a", "value").unwrap()),
                Box::new(RangeAggregatorFactory::with_field("a", "value").unwrap()),
            ];
            for factory in factories {
                let whole = aggregate_rows(&*factory, &value_rows(&values), ParsePolicy::Strict)?;
                let split = rng.gen_range(0..values.len());
                let (lhs, rhs) = values.split_at(split);
                let lhs = aggregate_rows(&*factory, &value_rows(lhs), ParsePolicy::Strict)?;
                let rhs = aggregate_rows(&*factory, &value_rows(rhs), ParsePolicy::Strict)?;
                let identity = factory.identity();
                let left = factory.combine(identity.clone(), lhs.clone())?;
                let left_first = factory.combine(left, rhs.clone())?;
                let right_first = factory.combine(lhs, factory.combine(rhs, identity)?)?;
                assert_eq!(factory.compare(&left_first, &whole), Ordering::Equal);
                assert_eq!(factory.compare(&right_first, &whole), Ordering::Equal);
            }
            Ok(())
        })
    }

    #[test]
    fn test_serialization_round_trip() -> Report<AggregationError> {
        Report::capture(|| {
            let factory = DoubleSumAggregatorFactory::with_field("sum", "value").unwrap();
            let value = Value::Double(-2.5);
            let bytes = factory.serialize(&value)?;
            assert_eq!(factory.deserialize(Value::Bytes(bytes.clone()))?, value);
            assert_eq!(
                factory.deserialize(Value::String(wire::base64_encode(&bytes)))?,
                value
            );
            assert_eq!(factory.deserialize(value.clone())?, value);
            assert_eq!(factory.deserialize(Value::from("-2.5"))?, value);
            assert_eq!(
                factory.deserialize(Value::from("Infinity"))?,
                Value::Double(f64::INFINITY)
            );
            assert_eq!(
                factory.deserialize(Value::from("-Infinity"))?,
                Value::Double(f64::NEG_INFINITY)
            );
            let nan = factory.deserialize(Value::from("NaN"))?;
            assert!(matches!(nan, Value::Double(v) if v.is_nan()));
            assert!(factory.deserialize(Value::from("garbage!")).is_err());
            Ok(())
        })
    }

    #[test]
    fn test_malformed_policy() {
        let factory = LongSumAggregatorFactory::with_field("sum", "value").unwrap();
        let rows = value_rows(&["1", "oops", "2"]);
        let err = aggregate_rows(&factory, &rows, ParsePolicy::Strict).unwrap_err();
        assert!(err.is_malformed());
        expect_test::expect!["Malformed input of the aggregator `sum`"].assert_eq(&err.to_string());
        assert_eq!(
            aggregate_rows(&factory, &rows, ParsePolicy::Lenient).unwrap(),
            Value::Long(3)
        );
    }

    #[test]
    fn test_time_extremum() -> Report<AggregationError> {
        Report::capture(|| {
            let rows = vec![
                InputRow::new(5_000),
                InputRow::new(1_000),
                InputRow::new(3_000),
            ];
            let min = TimeMinAggregatorFactory::try_new("first_seen", None, None, None).unwrap();
            let max = TimeMaxAggregatorFactory::try_new("last_seen", None, None, None).unwrap();
            assert_eq!(min.required_fields(), vec![crate::TIME_COLUMN]);
            assert_eq!(aggregate_rows(&min, &rows, ParsePolicy::Strict)?, Value::Long(1_000));
            assert_eq!(aggregate_rows(&max, &rows, ParsePolicy::Strict)?, Value::Long(5_000));

            let iso = vec![InputRow::new(0).with_column("at", "1970-01-01T00:00:02Z")];
            let max = TimeMaxAggregatorFactory::with_field("at_max", "at").unwrap();
            assert_eq!(aggregate_rows(&max, &iso, ParsePolicy::Strict)?, Value::Long(2_000));
            assert_eq!(max.finalize_computation(max.identity()), Value::Null);
            Ok(())
        })
    }

    #[test]
    fn test_range() -> Report<AggregationError> {
        Report::capture(|| {
            let factory = RangeAggregatorFactory::with_field("spread", "value").unwrap();
            let rows = value_rows(&[4.0, -1.0, 2.0]);
            let state = aggregate_rows(&factory, &rows, ParsePolicy::Strict)?;
            assert_eq!(factory.finalize_computation(state.clone()), Value::Double(5.0));
            assert_eq!(factory.finalize_computation(factory.identity()), Value::Null);
            let bytes = factory.serialize(&state)?;
            assert_eq!(factory.deserialize(Value::Bytes(bytes))?, state);
            Ok(())
        })
    }

    #[test]
    fn test_cache_key_and_spec() {
        let lhs = LongSumAggregatorFactory::with_field("a", "x").unwrap();
        let rhs = LongSumAggregatorFactory::with_field("b", "x").unwrap();
        let other = DoubleSumAggregatorFactory::with_field("a", "x").unwrap();
        let expression = LongSumAggregatorFactory::try_new("a", None, Some("x + 1"), None).unwrap();
        // The output name does not change the computation
        assert_eq!(lhs.cache_key(), rhs.cache_key());
        assert_ne!(lhs.cache_key(), other.cache_key());
        assert_ne!(lhs.cache_key(), expression.cache_key());
        assert_eq!(lhs.cache_key()[0], AggregatorKind::LongSum.cache_type_id());

        let json = serde_json::to_string(&expression.spec()).unwrap();
        expect_test::expect![[r#"{"type":"longSum","name":"a","expression":"(\"x\" + 1)"}"#]]
            .assert_eq(&json);
    }
}
