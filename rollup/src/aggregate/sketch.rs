//! Sketch aggregations: `hyperUnique`, `approxHistogram` and `countMin`
//!
//! The inputs are raw values or pre-built sketches of the same kind. Raw values are
//! offered to the sketch, sketches are merged

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use snafu::{ResultExt, ensure};

use super::spec::{
    AggregatorSpec, ApproxHistogramSpec, CountMinSpec, HyperUniqueSpec, InputSpec,
};
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError, Input,
    InvalidParameterSnafu, MalformedSnafu, Result, SketchSnafu, TypeMismatchSnafu, check_name,
    compile_filter, decode_transport, required_fields_with_filter, with_predicate,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::filter::{CompiledFilter, RowPredicate};
use crate::private::Sealed;
use crate::selector::{ColumnSelectorFactory, SelectorResult, ValueSelector};
use crate::sketch::count_min::{self, CountMinSketch};
use crate::sketch::histogram::{self, ApproximateHistogram};
use crate::sketch::hll::{self, HyperLogLog};
use crate::sketch::{SketchError, hash_bytes};
use crate::value::{ComplexType, ComplexValue, Value, ValueType};

/// Input of the sketch read from the current row
#[derive(Debug)]
pub enum SketchInput<I, S> {
    /// Raw value offered to the sketch
    Raw(I),
    /// Pre-built sketch merged into the sketch
    Sketch(S),
}

/// Kernel of the sketch aggregation
pub trait SketchKernel: Sealed + Debug + Send + Sync + 'static {
    /// Owned sketch
    type Sketch: Clone + Debug + Send + Sync + 'static;
    /// Parameters of the sketch
    type Params: Clone + Debug + Send + Sync + 'static;
    /// Raw input
    type Input;

    /// Kind of the aggregation
    const KIND: AggregatorKind;
    /// Complex type of the sketch
    const COMPLEX_TYPE: ComplexType;
    /// Type of the finalized value
    const OUTPUT_TYPE: ValueType;
    /// Whether the sketch grows in the object mode
    const REQUIRES_SIZE_ESTIMATION: bool = false;

    /// Validate the parameters
    fn validate(name: &str, params: &Self::Params) -> std::result::Result<(), ConfigurationError>;

    /// Create an empty sketch
    fn new_sketch(params: &Self::Params) -> Self::Sketch;

    /// Read the input of the current row
    fn read(
        selector: &dyn ValueSelector,
    ) -> SelectorResult<Option<SketchInput<Self::Input, Self::Sketch>>>;

    /// Offer the raw input to the sketch
    fn offer(sketch: &mut Self::Sketch, input: &Self::Input);

    /// Merge other into the sketch
    fn merge(
        sketch: &mut Self::Sketch,
        other: &Self::Sketch,
    ) -> std::result::Result<(), SketchError>;

    /// Check other can be merged into the sketches built with the parameters
    fn check_merge(
        _params: &Self::Params,
        _other: &Self::Sketch,
    ) -> std::result::Result<(), SketchError> {
        Ok(())
    }

    /// Size of the dense layout
    fn dense_size(params: &Self::Params) -> usize;

    /// Write the empty sketch into the span
    fn init_dense(params: &Self::Params, span: &mut [u8]);

    /// Offer the raw input to the dense sketch
    fn offer_dense(params: &Self::Params, span: &mut [u8], input: &Self::Input);

    /// Merge the sketch into the dense sketch
    fn merge_dense(
        params: &Self::Params,
        span: &mut [u8],
        other: &Self::Sketch,
    ) -> std::result::Result<(), SketchError>;

    /// Read the sketch from the span
    fn from_dense(params: &Self::Params, span: &[u8]) -> Self::Sketch;

    /// Wrap the sketch
    fn wrap(sketch: Self::Sketch) -> ComplexValue;

    /// Unwrap the sketch
    fn unwrap(value: &ComplexValue) -> Option<&Self::Sketch>;

    /// Finalize the sketch
    fn finalize(params: &Self::Params, sketch: &Self::Sketch) -> Value;

    /// Total order of the sketches
    fn compare(lhs: &Self::Sketch, rhs: &Self::Sketch) -> Ordering;

    /// Heap size of the sketch
    fn estimated_size(_sketch: &Self::Sketch) -> usize {
        0
    }

    /// Append the parameters to the cache key
    fn append_cache_key(params: &Self::Params, builder: CacheKeyBuilder) -> CacheKeyBuilder;

    /// Declarative form of the factory
    fn spec(input: InputSpec, params: &Self::Params) -> AggregatorSpec;
}

/// Non-null values of the row rendered as strings, multi-value rows yield all elements
fn raw_items(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = value.dimension_values().into_iter().flatten().collect();
    (!items.is_empty()).then_some(items)
}

/// Parameters of `hyperUnique`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HyperUniqueParams {
    /// Logarithm of the number of registers
    pub log2m: u8,
    /// Round the estimate to long when finalized
    pub round: bool,
}

/// Distinct count with [`HyperLogLog`]
#[derive(Debug)]
pub struct HyperUniqueKernel;

impl Sealed for HyperUniqueKernel {}

impl SketchKernel for HyperUniqueKernel {
    type Sketch = HyperLogLog;
    type Params = HyperUniqueParams;
    /// Hashes of the items
    type Input = Vec<u64>;

    const KIND: AggregatorKind = AggregatorKind::HyperUnique;
    const COMPLEX_TYPE: ComplexType = ComplexType::HyperUnique;
    const OUTPUT_TYPE: ValueType = ValueType::Double;

    fn validate(
        name: &str,
        params: &HyperUniqueParams,
    ) -> std::result::Result<(), ConfigurationError> {
        ensure!(
            (hll::MIN_LOG2M..=hll::MAX_LOG2M).contains(&params.log2m),
            InvalidParameterSnafu {
                name,
                reason: format!(
                    "log2m `{}` is not in [{}, {}]",
                    params.log2m,
                    hll::MIN_LOG2M,
                    hll::MAX_LOG2M
                ),
            }
        );
        Ok(())
    }

    fn new_sketch(params: &HyperUniqueParams) -> HyperLogLog {
        HyperLogLog::new(params.log2m)
    }

    fn read(
        selector: &dyn ValueSelector,
    ) -> SelectorResult<Option<SketchInput<Vec<u64>, HyperLogLog>>> {
        Ok(match selector.get_object() {
            Value::Complex(ComplexValue::HyperUnique(sketch)) => Some(SketchInput::Sketch(*sketch)),
            value => raw_items(&value).map(|items| {
                SketchInput::Raw(items.iter().map(|item| hash_bytes(item.as_bytes())).collect())
            }),
        })
    }

    fn offer(sketch: &mut HyperLogLog, input: &Vec<u64>) {
        input.iter().for_each(|&hash| sketch.add_hash(hash));
    }

    fn merge(
        sketch: &mut HyperLogLog,
        other: &HyperLogLog,
    ) -> std::result::Result<(), SketchError> {
        sketch.merge(other)
    }

    fn dense_size(params: &HyperUniqueParams) -> usize {
        HyperLogLog::dense_size(params.log2m)
    }

    fn init_dense(_params: &HyperUniqueParams, span: &mut [u8]) {
        span.fill(0);
    }

    fn offer_dense(params: &HyperUniqueParams, span: &mut [u8], input: &Vec<u64>) {
        input
            .iter()
            .for_each(|&hash| hll::add_hash_to_registers(span, params.log2m, hash));
    }

    fn check_merge(
        params: &HyperUniqueParams,
        other: &HyperLogLog,
    ) -> std::result::Result<(), SketchError> {
        if other.log2m() != params.log2m {
            return Err(SketchError::ParameterMismatch {
                sketch: "hyperUnique",
                left: format!("log2m={}", params.log2m),
                right: format!("log2m={}", other.log2m()),
            });
        }
        Ok(())
    }

    fn merge_dense(
        params: &HyperUniqueParams,
        span: &mut [u8],
        other: &HyperLogLog,
    ) -> std::result::Result<(), SketchError> {
        Self::check_merge(params, other)?;
        hll::merge_registers(span, other.as_dense());
        Ok(())
    }

    fn from_dense(params: &HyperUniqueParams, span: &[u8]) -> HyperLogLog {
        HyperLogLog::from_dense(span, params.log2m)
    }

    fn wrap(sketch: HyperLogLog) -> ComplexValue {
        ComplexValue::HyperUnique(Box::new(sketch))
    }

    fn unwrap(value: &ComplexValue) -> Option<&HyperLogLog> {
        match value {
            ComplexValue::HyperUnique(sketch) => Some(sketch),
            _ => None,
        }
    }

    fn finalize(params: &HyperUniqueParams, sketch: &HyperLogLog) -> Value {
        let estimate = sketch.estimate();
        if params.round {
            Value::Long(estimate.round() as i64)
        } else {
            Value::Double(estimate)
        }
    }

    fn compare(lhs: &HyperLogLog, rhs: &HyperLogLog) -> Ordering {
        lhs.estimate().total_cmp(&rhs.estimate())
    }

    fn append_cache_key(params: &HyperUniqueParams, builder: CacheKeyBuilder) -> CacheKeyBuilder {
        builder.append_u8(params.log2m).append_bool(params.round)
    }

    fn spec(input: InputSpec, params: &HyperUniqueParams) -> AggregatorSpec {
        AggregatorSpec::HyperUnique(HyperUniqueSpec {
            input,
            log2m: params.log2m,
            round: params.round,
        })
    }
}

/// Parameters of `approxHistogram`
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramParams {
    /// Maximal number of the bins
    pub resolution: usize,
    /// Quantiles reported by the finalized value
    pub quantiles: Arc<[f64]>,
}

/// Quantiles with [`ApproximateHistogram`]
#[derive(Debug)]
pub struct HistogramKernel;

impl Sealed for HistogramKernel {}

impl SketchKernel for HistogramKernel {
    type Sketch = ApproximateHistogram;
    type Params = HistogramParams;
    type Input = f64;

    const KIND: AggregatorKind = AggregatorKind::ApproximateHistogram;
    const COMPLEX_TYPE: ComplexType = ComplexType::ApproximateHistogram;
    const OUTPUT_TYPE: ValueType = ValueType::Array;
    const REQUIRES_SIZE_ESTIMATION: bool = true;

    fn validate(
        name: &str,
        params: &HistogramParams,
    ) -> std::result::Result<(), ConfigurationError> {
        ensure!(
            (1..=histogram::MAX_RESOLUTION).contains(&params.resolution),
            InvalidParameterSnafu {
                name,
                reason: format!(
                    "resolution `{}` is not in [1, {}]",
                    params.resolution,
                    histogram::MAX_RESOLUTION
                ),
            }
        );
        ensure!(
            !params.quantiles.is_empty()
                && params.quantiles.iter().all(|q| (0.0..=1.0).contains(q)),
            InvalidParameterSnafu {
                name,
                reason: format!(
                    "quantiles `{:?}` should be non-empty and in [0, 1]",
                    params.quantiles
                ),
            }
        );
        Ok(())
    }

    fn new_sketch(params: &HistogramParams) -> ApproximateHistogram {
        ApproximateHistogram::new(params.resolution)
    }

    fn read(
        selector: &dyn ValueSelector,
    ) -> SelectorResult<Option<SketchInput<f64, ApproximateHistogram>>> {
        if let Value::Complex(ComplexValue::Histogram(sketch)) = selector.get_object() {
            return Ok(Some(SketchInput::Sketch(*sketch)));
        }
        Ok(selector.get_double()?.map(SketchInput::Raw))
    }

    fn offer(sketch: &mut ApproximateHistogram, input: &f64) {
        sketch.offer(*input);
    }

    fn merge(
        sketch: &mut ApproximateHistogram,
        other: &ApproximateHistogram,
    ) -> std::result::Result<(), SketchError> {
        sketch.merge(other);
        Ok(())
    }

    fn dense_size(params: &HistogramParams) -> usize {
        ApproximateHistogram::dense_size(params.resolution)
    }

    fn init_dense(params: &HistogramParams, span: &mut [u8]) {
        ApproximateHistogram::new(params.resolution).write_dense(span);
    }

    fn offer_dense(params: &HistogramParams, span: &mut [u8], input: &f64) {
        let mut sketch = ApproximateHistogram::from_dense(span, params.resolution);
        sketch.offer(*input);
        sketch.write_dense(span);
    }

    fn merge_dense(
        params: &HistogramParams,
        span: &mut [u8],
        other: &ApproximateHistogram,
    ) -> std::result::Result<(), SketchError> {
        let mut sketch = ApproximateHistogram::from_dense(span, params.resolution);
        sketch.merge(other);
        sketch.write_dense(span);
        Ok(())
    }

    fn from_dense(params: &HistogramParams, span: &[u8]) -> ApproximateHistogram {
        ApproximateHistogram::from_dense(span, params.resolution)
    }

    fn wrap(sketch: ApproximateHistogram) -> ComplexValue {
        ComplexValue::Histogram(Box::new(sketch))
    }

    fn unwrap(value: &ComplexValue) -> Option<&ApproximateHistogram> {
        match value {
            ComplexValue::Histogram(sketch) => Some(sketch),
            _ => None,
        }
    }

    /// Array of the configured quantiles, null quantiles for the empty histogram
    fn finalize(params: &HistogramParams, sketch: &ApproximateHistogram) -> Value {
        Value::Array(
            sketch
                .quantiles(&params.quantiles)
                .into_iter()
                .map(|q| if q.is_nan() { Value::Null } else { Value::Double(q) })
                .collect(),
        )
    }

    fn compare(lhs: &ApproximateHistogram, rhs: &ApproximateHistogram) -> Ordering {
        lhs.count().cmp(&rhs.count())
    }

    fn estimated_size(sketch: &ApproximateHistogram) -> usize {
        sketch.estimated_size()
    }

    fn append_cache_key(params: &HistogramParams, builder: CacheKeyBuilder) -> CacheKeyBuilder {
        params
            .quantiles
            .iter()
            .fold(builder.append_u64(params.resolution as u64), |builder, &q| {
                builder.append_f64(q)
            })
    }

    fn spec(input: InputSpec, params: &HistogramParams) -> AggregatorSpec {
        AggregatorSpec::ApproxHistogram(ApproxHistogramSpec {
            input,
            resolution: params.resolution,
            quantiles: params.quantiles.to_vec(),
        })
    }
}

/// Parameters of `countMin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountMinParams {
    /// Number of the counters per row
    pub width: u32,
    /// Number of the rows
    pub depth: u32,
}

/// Frequencies with [`CountMinSketch`]
#[derive(Debug)]
pub struct CountMinKernel;

impl Sealed for CountMinKernel {}

impl SketchKernel for CountMinKernel {
    type Sketch = CountMinSketch;
    type Params = CountMinParams;
    type Input = Vec<String>;

    const KIND: AggregatorKind = AggregatorKind::CountMin;
    const COMPLEX_TYPE: ComplexType = ComplexType::CountMin;
    const OUTPUT_TYPE: ValueType = ValueType::Complex(ComplexType::CountMin);

    fn validate(
        name: &str,
        params: &CountMinParams,
    ) -> std::result::Result<(), ConfigurationError> {
        ensure!(
            params.width > 0
                && params.depth > 0
                && params.width as u64 * params.depth as u64 <= count_min::MAX_COUNTERS,
            InvalidParameterSnafu {
                name,
                reason: format!(
                    "shape {}x{} should be positive and has at most {} counters",
                    params.depth,
                    params.width,
                    count_min::MAX_COUNTERS
                ),
            }
        );
        Ok(())
    }

    fn new_sketch(params: &CountMinParams) -> CountMinSketch {
        CountMinSketch::new(params.width, params.depth)
    }

    fn read(
        selector: &dyn ValueSelector,
    ) -> SelectorResult<Option<SketchInput<Vec<String>, CountMinSketch>>> {
        Ok(match selector.get_object() {
            Value::Complex(ComplexValue::CountMin(sketch)) => Some(SketchInput::Sketch(*sketch)),
            value => raw_items(&value).map(SketchInput::Raw),
        })
    }

    fn offer(sketch: &mut CountMinSketch, input: &Vec<String>) {
        input.iter().for_each(|item| sketch.add(item.as_bytes(), 1));
    }

    fn merge(
        sketch: &mut CountMinSketch,
        other: &CountMinSketch,
    ) -> std::result::Result<(), SketchError> {
        sketch.merge(other)
    }

    fn check_merge(
        params: &CountMinParams,
        other: &CountMinSketch,
    ) -> std::result::Result<(), SketchError> {
        if other.width() != params.width || other.depth() != params.depth {
            return Err(SketchError::ParameterMismatch {
                sketch: "countMin",
                left: format!("{}x{}", params.depth, params.width),
                right: format!("{}x{}", other.depth(), other.width()),
            });
        }
        Ok(())
    }

    fn dense_size(params: &CountMinParams) -> usize {
        CountMinSketch::dense_size(params.width, params.depth)
    }

    fn init_dense(_params: &CountMinParams, span: &mut [u8]) {
        span.fill(0);
    }

    fn offer_dense(params: &CountMinParams, span: &mut [u8], input: &Vec<String>) {
        input.iter().for_each(|item| {
            CountMinSketch::add_dense(span, params.width, params.depth, item.as_bytes(), 1)
        });
    }

    fn merge_dense(
        params: &CountMinParams,
        span: &mut [u8],
        other: &CountMinSketch,
    ) -> std::result::Result<(), SketchError> {
        Self::check_merge(params, other)?;
        other.merge_into_dense(span);
        Ok(())
    }

    fn from_dense(params: &CountMinParams, span: &[u8]) -> CountMinSketch {
        CountMinSketch::from_dense(span, params.width, params.depth)
    }

    fn wrap(sketch: CountMinSketch) -> ComplexValue {
        ComplexValue::CountMin(Box::new(sketch))
    }

    fn unwrap(value: &ComplexValue) -> Option<&CountMinSketch> {
        match value {
            ComplexValue::CountMin(sketch) => Some(sketch),
            _ => None,
        }
    }

    fn finalize(_params: &CountMinParams, sketch: &CountMinSketch) -> Value {
        Value::Complex(ComplexValue::CountMin(Box::new(sketch.clone())))
    }

    fn compare(lhs: &CountMinSketch, rhs: &CountMinSketch) -> Ordering {
        lhs.total().cmp(&rhs.total())
    }

    fn append_cache_key(params: &CountMinParams, builder: CacheKeyBuilder) -> CacheKeyBuilder {
        builder
            .append_u64(params.width as u64)
            .append_u64(params.depth as u64)
    }

    fn spec(input: InputSpec, params: &CountMinParams) -> AggregatorSpec {
        AggregatorSpec::CountMin(CountMinSpec {
            input,
            width: params.width,
            depth: params.depth,
        })
    }
}

/// Read the input and check the sketches in it can be merged
fn validate_input<K: SketchKernel>(
    name: &str,
    selector: &dyn ValueSelector,
    params: &K::Params,
) -> Result<()> {
    if let Some(SketchInput::Sketch(other)) = K::read(selector).context(MalformedSnafu { name })? {
        K::check_merge(params, &other).context(SketchSnafu { name })?;
    }
    Ok(())
}

#[derive(Debug)]
struct SketchAggregator<K: SketchKernel, P> {
    name: Arc<str>,
    selector: Arc<dyn ValueSelector>,
    predicate: P,
    params: K::Params,
    sketch: K::Sketch,
}

impl<K: SketchKernel, P: RowPredicate> Aggregator for SketchAggregator<K, P> {
    fn aggregate(&mut self) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        match K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })? {
            None => {}
            Some(SketchInput::Raw(input)) => K::offer(&mut self.sketch, &input),
            Some(SketchInput::Sketch(other)) => {
                K::merge(&mut self.sketch, &other).context(SketchSnafu { name: &*self.name })?
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            validate_input::<K>(&self.name, &*self.selector, &self.params)?;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        Value::Complex(K::wrap(self.sketch.clone()))
    }

    fn reset(&mut self) {
        self.sketch = K::new_sketch(&self.params);
    }

    fn estimated_size(&self) -> usize {
        K::estimated_size(&self.sketch)
    }
}

#[derive(Debug)]
struct SketchBufferAggregator<K: SketchKernel, P> {
    name: Arc<str>,
    selector: Arc<dyn ValueSelector>,
    predicate: P,
    params: K::Params,
}

impl<K: SketchKernel, P: RowPredicate> BufferAggregator for SketchBufferAggregator<K, P> {
    fn init(&self, span: &mut [u8]) {
        K::init_dense(&self.params, span);
    }

    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        match K::read(&*self.selector).context(MalformedSnafu { name: &*self.name })? {
            None => {}
            Some(SketchInput::Raw(input)) => K::offer_dense(&self.params, span, &input),
            Some(SketchInput::Sketch(other)) => K::merge_dense(&self.params, span, &other)
                .context(SketchSnafu { name: &*self.name })?,
        }
        Ok(())
    }

    fn validate(&self, _span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            validate_input::<K>(&self.name, &*self.selector, &self.params)?;
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        Value::Complex(K::wrap(K::from_dense(&self.params, span)))
    }
}

/// Factory of the sketch aggregations
///
/// # Generic
///
/// - `K`: The kernel of the sketch
#[derive(Debug)]
pub struct SketchAggregatorFactory<K: SketchKernel> {
    name: String,
    input: Input,
    filter: Option<CompiledFilter>,
    params: K::Params,
}

/// `hyperUnique` aggregation
pub type HyperUniqueAggregatorFactory = SketchAggregatorFactory<HyperUniqueKernel>;
/// `approxHistogram` aggregation
pub type ApproxHistogramAggregatorFactory = SketchAggregatorFactory<HistogramKernel>;
/// `countMin` aggregation
pub type CountMinAggregatorFactory = SketchAggregatorFactory<CountMinKernel>;

impl<K: SketchKernel> SketchAggregatorFactory<K> {
    /// Create the factory
    pub fn try_new(
        input: &InputSpec,
        params: K::Params,
    ) -> std::result::Result<Self, ConfigurationError> {
        check_name(&input.name)?;
        K::validate(&input.name, &params)?;
        Ok(Self {
            input: Input::try_new(
                &input.name,
                input.field_name.as_deref(),
                input.expression.as_deref(),
            )?,
            filter: compile_filter(&input.name, input.filter.as_ref())?,
            name: input.name.clone(),
            params,
        })
    }

    /// Create the factory reads the field
    pub fn with_field(
        name: impl Into<String>,
        field_name: &str,
        params: K::Params,
    ) -> std::result::Result<Self, ConfigurationError> {
        Self::try_new(&InputSpec::field(name, field_name), params)
    }

    /// Parameters of the sketch
    pub fn params(&self) -> &K::Params {
        &self.params
    }

    fn sketch<'a>(&self, value: &'a Value) -> Result<Option<&'a K::Sketch>> {
        match value {
            Value::Null => Ok(None),
            Value::Complex(complex) if K::unwrap(complex).is_some() => Ok(K::unwrap(complex)),
            value => TypeMismatchSnafu {
                name: &self.name,
                expect: ValueType::Complex(K::COMPLEX_TYPE),
                found: value.to_string(),
            }
            .fail(),
        }
    }
}

impl<K: SketchKernel> AggregatorFactory for SketchAggregatorFactory<K>
{
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
            Box::new(SketchAggregator::<K, _> {
                name,
                selector,
                predicate,
                params: self.params.clone(),
                sketch: K::new_sketch(&self.params),
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
            Box::new(SketchBufferAggregator::<K, _> {
                name,
                selector,
                predicate,
                params: self.params.clone(),
            }) as Box<dyn BufferAggregator>
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let lhs = self.sketch(lhs).ok().flatten();
        let rhs = self.sketch(rhs).ok().flatten();
        match (lhs, rhs) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(lhs), Some(rhs)) => K::compare(lhs, rhs),
        }
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        let merged = match (self.sketch(&lhs)?, self.sketch(&rhs)?) {
            (None, None) => return Ok(Value::Null),
            (Some(sketch), None) | (None, Some(sketch)) => sketch.clone(),
            (Some(lhs), Some(rhs)) => {
                let mut merged = lhs.clone();
                K::merge(&mut merged, rhs).context(SketchSnafu { name: &self.name })?;
                merged
            }
        };
        Ok(Value::Complex(K::wrap(merged)))
    }

    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        Arc::new(Self {
            name: self.name.clone(),
            input: Input::Field(self.name.clone()),
            filter: None,
            params: self.params.clone(),
        })
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        let value = decode_transport(&self.name, value)?;
        self.sketch(&value)?;
        Ok(value)
    }

    fn finalize_computation(&self, value: Value) -> Value {
        match self.sketch(&value) {
            Ok(Some(sketch)) => K::finalize(&self.params, sketch),
            _ => Value::Null,
        }
    }

    fn required_fields(&self) -> Vec<String> {
        required_fields_with_filter(self.input.required_fields(), self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        let builder = self
            .input
            .append_cache_key(CacheKeyBuilder::new(K::KIND.cache_type_id()));
        K::append_cache_key(&self.params, builder)
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        ValueType::Complex(K::COMPLEX_TYPE)
    }

    fn output_type(&self) -> ValueType {
        K::OUTPUT_TYPE
    }

    fn max_intermediate_size(&self) -> usize {
        K::dense_size(&self.params)
    }

    fn requires_size_estimation(&self) -> bool {
        K::REQUIRES_SIZE_ESTIMATION
    }

    fn identity(&self) -> Value {
        Value::Complex(K::wrap(K::new_sketch(&self.params)))
    }

    fn spec(&self) -> AggregatorSpec {
        K::spec(
            InputSpec {
                name: self.name.clone(),
                field_name: self.input.field_name().map(ToString::to_string),
                expression: self.input.expression(),
                filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
            },
            &self.params,
        )
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::tests::{aggregate_rows, value_rows};
    use crate::row::InputRow;
    use crate::selector::ParsePolicy;
    use crate::wire;

    fn hll_params() -> HyperUniqueParams {
        HyperUniqueParams {
            log2m: hll::DEFAULT_LOG2M,
            round: true,
        }
    }

    #[test]
    fn test_hyper_unique() -> Report<AggregationError> {
        Report::capture(|| {
            let factory =
                HyperUniqueAggregatorFactory::with_field("users", "user", hll_params()).unwrap();
            let rows: Vec<InputRow> = (0..100)
                .map(|i| InputRow::new(0).with_column("user", format!("user-{}", i % 20)))
                .collect();
            let state = aggregate_rows(&factory, &rows, ParsePolicy::Strict)?;
            let Value::Long(estimate) = factory.finalize_computation(state.clone()) else {
                panic!("rounded estimate should be long");
            };
            assert!((18..=22).contains(&estimate), "estimate {estimate}");

            // Pre-built sketches are merged
            let sketches = vec![InputRow::new(0).with_column("user", state.clone())];
            let merged = aggregate_rows(&factory, &sketches, ParsePolicy::Strict)?;
            assert_eq!(merged, state);
            Ok(())
        })
    }

    #[test]
    fn test_hyper_unique_combine() -> Report<AggregationError> {
        Report::capture(|| {
            let factory =
                HyperUniqueAggregatorFactory::with_field("users", "value", hll_params()).unwrap();
            let lhs = aggregate_rows(&factory, &value_rows(&["a", "b", "c"]), ParsePolicy::Strict)?;
            let rhs = aggregate_rows(&factory, &value_rows(&["c", "d"]), ParsePolicy::Strict)?;
            let combined = factory.combine(lhs.clone(), rhs.clone())?;
            assert_eq!(factory.finalize_computation(combined.clone()), Value::Long(4));
            assert_eq!(factory.combine(rhs, lhs)?, combined);
            assert_eq!(factory.combine(combined.clone(), Value::Null)?, combined);

            let other = HyperUniqueAggregatorFactory::with_field(
                "users",
                "value",
                HyperUniqueParams { log2m: 12, round: true },
            )
            .unwrap();
            let err = factory.combine(combined, other.identity()).unwrap_err();
            expect_test::expect!["Aggregator `users` failed to merge the sketches"]
                .assert_eq(&err.to_string());
            Ok(())
        })
    }

    #[test]
    fn test_histogram() -> Report<AggregationError> {
        Report::capture(|| {
            let params = HistogramParams {
                resolution: 10,
                quantiles: Arc::from([0.0, 0.5, 1.0]),
            };
            let factory =
                ApproxHistogramAggregatorFactory::with_field("latency", "value", params).unwrap();
            assert!(factory.requires_size_estimation());
            let values: Vec<f64> = (1..=100).map(f64::from).collect();
            let state = aggregate_rows(&factory, &value_rows(&values), ParsePolicy::Strict)?;
            let Value::Array(quantiles) = factory.finalize_computation(state.clone()) else {
                panic!("histogram should finalize to array");
            };
            assert_eq!(quantiles[0], Value::Double(1.0));
            assert_eq!(quantiles[2], Value::Double(100.0));
            let median = quantiles[1].lossy_double();
            assert!((35.0..=65.0).contains(&median), "median {median}");

            let empty = factory.finalize_computation(factory.identity());
            assert_eq!(empty, Value::Array(vec![Value::Null; 3]));

            let encoded = wire::base64_encode(&factory.serialize(&state)?);
            assert_eq!(factory.deserialize(Value::String(encoded))?, state);
            Ok(())
        })
    }

    #[test]
    fn test_count_min() -> Report<AggregationError> {
        Report::capture(|| {
            let params = CountMinParams { width: 64, depth: 4 };
            let factory = CountMinAggregatorFactory::with_field("pages", "value", params).unwrap();
            let state = aggregate_rows(
                &factory,
                &value_rows(&["home", "about", "home", "home"]),
                ParsePolicy::Strict,
            )?;
            let finalized = factory.finalize_computation(state);
            let Value::Complex(ComplexValue::CountMin(sketch)) = finalized else {
                panic!("countMin should finalize to itself");
            };
            assert!(sketch.estimate(b"home") >= 3);
            assert_eq!(sketch.total(), 4);
            Ok(())
        })
    }

    #[test]
    fn test_invalid_parameters() {
        let err = HyperUniqueAggregatorFactory::with_field(
            "users",
            "user",
            HyperUniqueParams { log2m: 3, round: false },
        )
        .unwrap_err();
        expect_test::expect!["Aggregator `users` has invalid parameter: log2m `3` is not in [4, 16]"]
            .assert_eq(&err.to_string());
        assert!(
            CountMinAggregatorFactory::with_field("c", "v", CountMinParams { width: 0, depth: 1 })
                .is_err()
        );
        assert!(
            ApproxHistogramAggregatorFactory::with_field(
                "h",
                "v",
                HistogramParams {
                    resolution: 10,
                    quantiles: Arc::from([1.5]),
                }
            )
            .is_err()
        );
    }
}
