//! Decimal aggregations with fixed precision and scale
//!
//! Every input is rounded to the scale with the configured rounding, the result must
//! fit in `precision` digits. Values that do not fit are malformed: the strict policy
//! reports [`AggregationError::DecimalOverflow`], the lenient policy skips them

use std::cmp::Ordering;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::spec::{AggregatorSpec, DecimalSpec};
use super::{
    AggregationError, Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator,
    ConfigurationError, DecimalOverflowSnafu, Input, InvalidParameterSnafu, MalformedSnafu,
    Result, TypeMismatchSnafu, check_name, compile_filter, decode_transport,
    required_fields_with_filter, with_predicate,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::filter::{CompiledFilter, DimFilter, RowPredicate};
use crate::private::Sealed;
use crate::selector::{ColumnSelectorFactory, ParsePolicy, ValueSelector};
use crate::value::{Value, ValueType};

/// Maximal precision supported by the decimal
pub const MAX_PRECISION: u32 = 28;
/// Precision used when it is not configured
pub const DEFAULT_PRECISION: u32 = 18;
/// Scale used when it is not configured
pub const DEFAULT_SCALE: u32 = 0;

const SPAN_SIZE: usize = 16;

/// Rounding applied to the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecimalRounding {
    /// Round half away from zero
    #[default]
    HalfUp,
    /// Round half to the even neighbor
    HalfEven,
    /// Round half toward zero
    HalfDown,
    /// Away from zero
    Up,
    /// Toward zero
    Down,
    /// Toward positive infinity
    Ceiling,
    /// Toward negative infinity
    Floor,
}

impl DecimalRounding {
    fn strategy(self) -> RoundingStrategy {
        match self {
            Self::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Self::HalfEven => RoundingStrategy::MidpointNearestEven,
            Self::HalfDown => RoundingStrategy::MidpointTowardZero,
            Self::Up => RoundingStrategy::AwayFromZero,
            Self::Down => RoundingStrategy::ToZero,
            Self::Ceiling => RoundingStrategy::ToPositiveInfinity,
            Self::Floor => RoundingStrategy::ToNegativeInfinity,
        }
    }

    fn id(self) -> u8 {
        self as u8
    }
}

/// Precision, scale and rounding of the decimal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecimalContext {
    precision: u32,
    scale: u32,
    rounding: DecimalRounding,
    /// Exclusive bound of the absolute value
    limit: Decimal,
}

impl DecimalContext {
    /// Create the context, `1 <= precision <= 28` and `scale <= precision`
    pub fn try_new(
        name: &str,
        precision: u32,
        scale: u32,
        rounding: DecimalRounding,
    ) -> std::result::Result<Self, ConfigurationError> {
        ensure!(
            (1..=MAX_PRECISION).contains(&precision),
            InvalidParameterSnafu {
                name,
                reason: format!("precision `{precision}` is not in [1, {MAX_PRECISION}]"),
            }
        );
        ensure!(
            scale <= precision,
            InvalidParameterSnafu {
                name,
                reason: format!("scale `{scale}` is greater than the precision `{precision}`"),
            }
        );
        Ok(Self {
            precision,
            scale,
            rounding,
            limit: Decimal::from_i128_with_scale(10_i128.pow(precision - scale), 0),
        })
    }

    /// Round the value to the scale, `None` if it does not fit in the precision
    #[inline]
    pub fn fit(&self, value: Decimal) -> Option<Decimal> {
        let value = value.round_dp_with_strategy(self.scale, self.rounding.strategy());
        (value.abs() < self.limit).then_some(value)
    }
}

/// Decimal operation
pub trait DecimalOp: Sealed + Debug + Send + Sync + 'static {
    /// Kind of the aggregation
    const KIND: AggregatorKind;

    /// Declarative form of the aggregation
    const SPEC: fn(DecimalSpec) -> AggregatorSpec;

    /// State of the empty group
    const IDENTITY: Decimal;

    /// Fold the value into the state, `None` on overflow
    fn fold(acc: Decimal, value: Decimal) -> Option<Decimal>;
}

macro_rules! decimal_op {
    ($op:ident, $doc:literal, $kind:ident, $identity:expr, |$acc:ident, $value:ident| $fold:expr) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $op;

        impl Sealed for $op {}

        impl DecimalOp for $op {
            const KIND: AggregatorKind = AggregatorKind::$kind;
            const SPEC: fn(DecimalSpec) -> AggregatorSpec = AggregatorSpec::$kind;
            const IDENTITY: Decimal = $identity;

            #[inline]
            fn fold($acc: Decimal, $value: Decimal) -> Option<Decimal> {
                $fold
            }
        }
    };
}

decimal_op!(
    DecimalSumOp,
    "Sum of the decimals",
    DecimalSum,
    Decimal::ZERO,
    |acc, value| acc.checked_add(value)
);
decimal_op!(
    DecimalMinOp,
    "Minimum of the decimals",
    DecimalMin,
    Decimal::MAX,
    |acc, value| Some(acc.min(value))
);
decimal_op!(
    DecimalMaxOp,
    "Maximum of the decimals",
    DecimalMax,
    Decimal::MIN,
    |acc, value| Some(acc.max(value))
);

#[derive(Debug)]
struct DecimalReader<O> {
    name: Arc<str>,
    selector: Arc<dyn ValueSelector>,
    context: DecimalContext,
    policy: ParsePolicy,
    _op: PhantomData<O>,
}

impl<O: DecimalOp> DecimalReader<O> {
    /// Read the input of the current row, `None` if it is null or skipped
    fn read(&self) -> Result<Option<Decimal>> {
        let Some(value) = self
            .selector
            .get_decimal()
            .context(MalformedSnafu { name: &*self.name })?
        else {
            return Ok(None);
        };
        match self.fit(value) {
            Some(value) => Ok(Some(value)),
            None => self.overflow(value),
        }
    }

    /// Fit the value into the precision. The identity is outside of the precision of
    /// min/max, it is what the combining factory reads back from an empty group
    #[inline]
    fn fit(&self, value: Decimal) -> Option<Decimal> {
        if value == O::IDENTITY {
            Some(value)
        } else {
            self.context.fit(value)
        }
    }

    /// Fold the input into the state, `None` if the input is skipped
    fn fold(&self, acc: Decimal) -> Result<Option<Decimal>> {
        let Some(value) = self.read()? else {
            return Ok(None);
        };
        match O::fold(acc, value).and_then(|folded| self.fit(folded)) {
            Some(folded) => Ok(Some(folded)),
            None => self.overflow(value),
        }
    }

    fn overflow(&self, value: Decimal) -> Result<Option<Decimal>> {
        match self.policy {
            ParsePolicy::Strict => DecimalOverflowSnafu {
                name: &*self.name,
                precision: self.context.precision,
                value: value.to_string(),
            }
            .fail(),
            ParsePolicy::Lenient => {
                tracing::trace!(
                    "Skip the value `{}` exceeds the precision of the aggregator `{}`",
                    value,
                    self.name
                );
                Ok(None)
            }
        }
    }
}

#[derive(Debug)]
struct DecimalAggregator<O, P> {
    reader: DecimalReader<O>,
    predicate: P,
    state: Decimal,
}

impl<O: DecimalOp, P: RowPredicate> Aggregator for DecimalAggregator<O, P> {
    fn aggregate(&mut self) -> Result<()> {
        if self.predicate.test() {
            if let Some(state) = self.reader.fold(self.state)? {
                self.state = state;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            self.reader.fold(self.state)?;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        Value::Decimal(self.state)
    }

    fn reset(&mut self) {
        self.state = O::IDENTITY;
    }
}

#[derive(Debug)]
struct DecimalBufferAggregator<O, P> {
    reader: DecimalReader<O>,
    predicate: P,
}

#[inline]
fn load(span: &[u8]) -> Decimal {
    let mut bytes = [0; SPAN_SIZE];
    bytes.copy_from_slice(&span[..SPAN_SIZE]);
    Decimal::deserialize(bytes)
}

#[inline]
fn store(span: &mut [u8], value: Decimal) {
    span[..SPAN_SIZE].copy_from_slice(&value.serialize());
}

impl<O: DecimalOp, P: RowPredicate> BufferAggregator for DecimalBufferAggregator<O, P> {
    fn init(&self, span: &mut [u8]) {
        store(span, O::IDENTITY);
    }

    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if self.predicate.test() {
            if let Some(state) = self.reader.fold(load(span))? {
                store(span, state);
            }
        }
        Ok(())
    }

    fn validate(&self, span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            self.reader.fold(load(span))?;
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        Value::Decimal(load(span))
    }
}

/// Factory of the decimal aggregations
#[derive(Debug)]
pub struct DecimalAggregatorFactory<O> {
    name: String,
    input: Input,
    filter: Option<CompiledFilter>,
    context: DecimalContext,
    _op: PhantomData<O>,
}

/// `decimalSum` aggregation
pub type DecimalSumAggregatorFactory = DecimalAggregatorFactory<DecimalSumOp>;
/// `decimalMin` aggregation
pub type DecimalMinAggregatorFactory = DecimalAggregatorFactory<DecimalMinOp>;
/// `decimalMax` aggregation
pub type DecimalMaxAggregatorFactory = DecimalAggregatorFactory<DecimalMaxOp>;

impl<O: DecimalOp> DecimalAggregatorFactory<O> {
    /// Create the factory from its declarative form
    pub fn try_from_spec(spec: &DecimalSpec) -> std::result::Result<Self, ConfigurationError> {
        check_name(&spec.name)?;
        Ok(Self {
            input: Input::try_new(
                &spec.name,
                spec.field_name.as_deref(),
                spec.expression.as_deref(),
            )?,
            filter: compile_filter(&spec.name, spec.filter.as_ref())?,
            context: DecimalContext::try_new(
                &spec.name,
                spec.precision,
                spec.scale,
                spec.rounding,
            )?,
            name: spec.name.clone(),
            _op: PhantomData,
        })
    }

    fn reader(&self, selectors: &dyn ColumnSelectorFactory) -> DecimalReader<O> {
        DecimalReader {
            name: Arc::from(self.name.as_str()),
            selector: self.input.make_selector(selectors),
            context: self.context,
            policy: selectors.policy(),
            _op: PhantomData,
        }
    }

    fn decimal(&self, value: &Value) -> Result<Option<Decimal>> {
        value.to_decimal().map_err(|_| {
            TypeMismatchSnafu {
                name: &self.name,
                expect: ValueType::Decimal,
                found: value.to_string(),
            }
            .build()
        })
    }

    fn overflow(&self, value: impl ToString) -> AggregationError {
        DecimalOverflowSnafu {
            name: &self.name,
            precision: self.context.precision,
            value: value.to_string(),
        }
        .build()
    }
}

impl<O: DecimalOp> AggregatorFactory for DecimalAggregatorFactory<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AggregatorKind {
        O::KIND
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        let reader = self.reader(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(DecimalAggregator {
                reader,
                predicate,
                state: O::IDENTITY,
            }) as Box<dyn Aggregator>
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        let reader = self.reader(selectors);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(DecimalBufferAggregator { reader, predicate }) as Box<dyn BufferAggregator>
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let lhs = lhs.to_decimal().ok().flatten();
        let rhs = rhs.to_decimal().ok().flatten();
        lhs.cmp(&rhs)
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        Ok(match (self.decimal(&lhs)?, self.decimal(&rhs)?) {
            (None, None) => Value::Null,
            (Some(state), None) | (None, Some(state)) => Value::Decimal(state),
            (Some(lhs), Some(rhs)) => {
                let folded =
                    O::fold(lhs, rhs).ok_or_else(|| self.overflow(format!("{lhs} + {rhs}")))?;
                // Identities of min/max are outside of the precision, they are kept
                match self.context.fit(folded) {
                    Some(folded) => Value::Decimal(folded),
                    None if folded == O::IDENTITY => Value::Decimal(folded),
                    None => return Err(self.overflow(folded)),
                }
            }
        })
    }

    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        Arc::new(Self {
            name: self.name.clone(),
            input: Input::Field(self.name.clone()),
            filter: None,
            context: self.context,
            _op: PhantomData,
        })
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        let value = decode_transport(&self.name, value)?;
        Ok(self.decimal(&value)?.map_or(Value::Null, Value::Decimal))
    }

    /// The identity of min/max means no value is seen
    fn finalize_computation(&self, value: Value) -> Value {
        match value.to_decimal() {
            Ok(Some(value)) if O::KIND == AggregatorKind::DecimalSum || value != O::IDENTITY => {
                Value::Decimal(value)
            }
            _ => Value::Null,
        }
    }

    fn required_fields(&self) -> Vec<String> {
        required_fields_with_filter(self.input.required_fields(), self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        self.input
            .append_cache_key(CacheKeyBuilder::new(O::KIND.cache_type_id()))
            .append_u64(self.context.precision as u64)
            .append_u64(self.context.scale as u64)
            .append_u8(self.context.rounding.id())
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        ValueType::Decimal
    }

    fn output_type(&self) -> ValueType {
        ValueType::Decimal
    }

    fn max_intermediate_size(&self) -> usize {
        SPAN_SIZE
    }

    fn identity(&self) -> Value {
        Value::Decimal(O::IDENTITY)
    }

    fn spec(&self) -> AggregatorSpec {
        (O::SPEC)(DecimalSpec {
            name: self.name.clone(),
            field_name: self.input.field_name().map(ToString::to_string),
            expression: self.input.expression(),
            filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
            precision: self.context.precision,
            scale: self.context.scale,
            rounding: self.context.rounding,
        })
    }
}
