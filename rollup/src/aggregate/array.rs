//! `arrayFanOut` aggregation, aggregates every element of the array inputs
//!
//! The predicate is evaluated once per row. The delegate reads the elements through
//! [`ElementSelectorFactory`], scalars are broadcast to every element and null rows have
//! no element. With the strict policy all of the elements are validated before any of
//! them is aggregated, a malformed element rejects the whole row. With the lenient
//! policy every element is coerced on its own and malformed elements are skipped

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use snafu::ensure;

use super::spec::AggregatorSpec;
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError,
    NotMergeableSnafu, Result, compile_filter, required_fields_with_filter, with_predicate,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::filter::{CompiledFilter, DimFilter, RowPredicate};
use crate::selector::{
    ColumnSelectorFactory, ElementSelectorFactory, ParsePolicy, ValueSelector, element_count,
};
use crate::value::{Value, ValueType};

/// Fan the array inputs out to the delegate
#[derive(Debug)]
pub struct ArrayFanOutAggregatorFactory {
    delegate: Arc<dyn AggregatorFactory>,
    filter: Option<CompiledFilter>,
}

impl ArrayFanOutAggregatorFactory {
    /// Create the factory
    pub fn try_new(
        delegate: Arc<dyn AggregatorFactory>,
        filter: Option<&DimFilter>,
    ) -> std::result::Result<Self, ConfigurationError> {
        let filter = compile_filter(delegate.name(), filter)?;
        Ok(Self { delegate, filter })
    }

    fn elements(&self, selectors: &dyn ColumnSelectorFactory, index: Arc<AtomicUsize>) -> Elements {
        Elements {
            columns: self
                .delegate
                .required_fields()
                .iter()
                .map(|field| selectors.make_selector(field))
                .collect(),
            policy: selectors.policy(),
            index,
        }
    }
}

/// Element cursor shared with the element selectors of the delegate
#[derive(Debug)]
struct Elements {
    columns: Vec<Arc<dyn ValueSelector>>,
    policy: ParsePolicy,
    index: Arc<AtomicUsize>,
}

impl Elements {
    /// Number of the elements of the current row, the longest input wins
    fn count(&self) -> usize {
        self.columns
            .iter()
            .map(|column| element_count(&column.get_object()))
            .max()
            .unwrap_or(0)
    }

    #[inline]
    fn is_strict(&self) -> bool {
        self.policy == ParsePolicy::Strict
    }

    /// Point the cursor at each of the elements and visit it
    fn visit(&self, count: usize, mut f: impl FnMut() -> Result<()>) -> Result<()> {
        for i in 0..count {
            self.index.store(i, AtomicOrdering::Relaxed);
            f()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ArrayFanOutAggregator<P> {
    predicate: P,
    elements: Elements,
    delegate: Box<dyn Aggregator>,
}

impl<P: RowPredicate> Aggregator for ArrayFanOutAggregator<P> {
    fn aggregate(&mut self) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        let count = self.elements.count();
        if self.elements.is_strict() {
            self.elements.visit(count, || self.delegate.validate())?;
        }
        self.elements.visit(count, || self.delegate.aggregate())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            self.elements
                .visit(self.elements.count(), || self.delegate.validate())?;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        self.delegate.get()
    }

    fn get_long(&self) -> i64 {
        self.delegate.get_long()
    }

    fn get_double(&self) -> f64 {
        self.delegate.get_double()
    }

    fn reset(&mut self) {
        self.delegate.reset()
    }

    fn estimated_size(&self) -> usize {
        self.delegate.estimated_size()
    }

    fn close(&mut self) -> Result<()> {
        self.delegate.close()
    }
}

#[derive(Debug)]
struct ArrayFanOutBufferAggregator<P> {
    predicate: P,
    elements: Elements,
    delegate: Box<dyn BufferAggregator>,
}

impl<P: RowPredicate> BufferAggregator for ArrayFanOutBufferAggregator<P> {
    fn init(&self, span: &mut [u8]) {
        self.delegate.init(span)
    }

    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if !self.predicate.test() {
            return Ok(());
        }
        let count = self.elements.count();
        if self.elements.is_strict() {
            let current = &*span;
            self.elements
                .visit(count, || self.delegate.validate(current))?;
        }
        self.elements.visit(count, || self.delegate.aggregate(span))
    }

    fn validate(&self, span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            self.elements
                .visit(self.elements.count(), || self.delegate.validate(span))?;
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        self.delegate.get(span)
    }

    fn get_long(&self, span: &[u8]) -> i64 {
        self.delegate.get_long(span)
    }

    fn get_double(&self, span: &[u8]) -> f64 {
        self.delegate.get_double(span)
    }

    fn close(&mut self) -> Result<()> {
        self.delegate.close()
    }
}

impl AggregatorFactory for ArrayFanOutAggregatorFactory {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::ArrayFanOut
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        let (view, index) = ElementSelectorFactory::new(selectors);
        let delegate = self.delegate.factorize(&view)?;
        let elements = self.elements(selectors, index);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(ArrayFanOutAggregator {
                predicate,
                elements,
                delegate,
            }) as Box<dyn Aggregator>
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        let (view, index) = ElementSelectorFactory::new(selectors);
        let delegate = self.delegate.factorize_buffered(&view)?;
        let elements = self.elements(selectors, index);
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(ArrayFanOutBufferAggregator {
                predicate,
                elements,
                delegate,
            }) as Box<dyn BufferAggregator>
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        self.delegate.compare(lhs, rhs)
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        self.delegate.combine(lhs, rhs)
    }

    /// The stored values are already fanned out, the delegate combines them
    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        self.delegate.combining_factory()
    }

    fn merging_factory(
        &self,
        other: &dyn AggregatorFactory,
    ) -> Result<Arc<dyn AggregatorFactory>> {
        let combining = self.combining_factory();
        ensure!(
            self.name() == other.name()
                && self.kind().is_mergeable_with(other.kind())
                && combining
                    .kind()
                    .is_mergeable_with(other.combining_factory().kind()),
            NotMergeableSnafu {
                name: self.name(),
                kind: self.kind(),
                other_name: other.name(),
                other_kind: other.kind(),
            }
        );
        Ok(combining)
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        self.delegate.deserialize(value)
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        self.delegate.serialize(value)
    }

    fn finalize_computation(&self, value: Value) -> Value {
        self.delegate.finalize_computation(value)
    }

    fn required_fields(&self) -> Vec<String> {
        required_fields_with_filter(self.delegate.required_fields(), self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        CacheKeyBuilder::new(AggregatorKind::ArrayFanOut.cache_type_id())
            .append_nested_key(&self.delegate.cache_key())
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        self.delegate.intermediate_type()
    }

    fn output_type(&self) -> ValueType {
        self.delegate.output_type()
    }

    fn max_intermediate_size(&self) -> usize {
        self.delegate.max_intermediate_size()
    }

    fn requires_size_estimation(&self) -> bool {
        self.delegate.requires_size_estimation()
    }

    fn identity(&self) -> Value {
        self.delegate.identity()
    }

    fn spec(&self) -> AggregatorSpec {
        AggregatorSpec::ArrayFanOut {
            aggregator: Box::new(self.delegate.spec()),
            filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::numeric::{LongMaxAggregatorFactory, LongSumAggregatorFactory};
    use crate::aggregate::tests::{aggregate_rows, value_rows};
    use crate::row::InputRow;
    use crate::selector::{RowPointer, RowSelectorFactory};

    fn fan_out_sum() -> ArrayFanOutAggregatorFactory {
        ArrayFanOutAggregatorFactory::try_new(
            Arc::new(LongSumAggregatorFactory::with_field("total", "value").unwrap()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_fan_out() -> Report<AggregationError> {
        Report::capture(|| {
            let rows = value_rows(&[
                Value::from(vec![1_i64, 2, 3]),
                Value::from(vec![4_i64]),
                Value::Long(5),
                Value::Null,
                Value::Array(vec![]),
            ]);
            let factory = fan_out_sum();
            assert_eq!(aggregate_rows(&factory, &rows, ParsePolicy::Strict)?, Value::Long(15));

            let max = ArrayFanOutAggregatorFactory::try_new(
                Arc::new(LongMaxAggregatorFactory::with_field("peak", "value").unwrap()),
                Some(&DimFilter::selector("keep", "yes")),
            )
            .unwrap();
            let rows = vec![
                InputRow::new(0)
                    .with_column("keep", "yes")
                    .with_column("value", vec![3_i64, 9]),
                InputRow::new(0)
                    .with_column("keep", "no")
                    .with_column("value", vec![100_i64]),
            ];
            assert_eq!(aggregate_rows(&max, &rows, ParsePolicy::Strict)?, Value::Long(9));
            assert_eq!(max.required_fields(), vec!["keep", "value"]);
            Ok(())
        })
    }

    #[test]
    fn test_strict_rejects_whole_row() {
        let factory = fan_out_sum();
        let selectors =
            RowSelectorFactory::new(Arc::new(RowPointer::default()), ParsePolicy::Strict);
        let mut aggregator = factory.factorize(&selectors).unwrap();
        let mut buffer_aggregator = factory.factorize_buffered(&selectors).unwrap();
        let mut span = vec![0; factory.max_intermediate_size()];
        buffer_aggregator.init(&mut span);

        let row = InputRow::new(0).with_column("value", vec![1_i64, 2]);
        selectors.pointer().set(Arc::new(row));
        aggregator.aggregate().unwrap();
        buffer_aggregator.aggregate(&mut span).unwrap();

        let malformed = InputRow::new(0).with_column(
            "value",
            Value::Array(vec![Value::Long(10), Value::from("oops")]),
        );
        selectors.pointer().set(Arc::new(malformed));
        assert!(aggregator.validate().is_err());
        assert!(buffer_aggregator.validate(&span).is_err());
        assert!(aggregator.aggregate().unwrap_err().is_malformed());
        assert!(buffer_aggregator.aggregate(&mut span).is_err());
        // The valid element of the rejected row is not aggregated
        assert_eq!(aggregator.get(), Value::Long(3));
        assert_eq!(buffer_aggregator.get(&span), Value::Long(3));
    }

    #[test]
    fn test_lenient_skips_element() -> Report<AggregationError> {
        Report::capture(|| {
            let rows = value_rows(&[Value::Array(vec![
                Value::Long(10),
                Value::from("oops"),
                Value::from("2"),
            ])]);
            let factory = fan_out_sum();
            assert_eq!(aggregate_rows(&factory, &rows, ParsePolicy::Lenient)?, Value::Long(12));
            Ok(())
        })
    }
}
