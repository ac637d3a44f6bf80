//! `filtered` aggregation, wraps any aggregation with a row predicate

use std::cmp::Ordering;
use std::sync::Arc;

use snafu::{ResultExt, ensure};

use super::spec::AggregatorSpec;
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError,
    InvalidFilterSnafu, NotMergeableSnafu, Result, required_fields_with_filter,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::filter::{CompiledFilter, DimFilter, MatcherPredicate, RowPredicate};
use crate::selector::ColumnSelectorFactory;
use crate::value::{Value, ValueType};

/// Aggregate the rows matching the filter with the delegate
#[derive(Debug)]
pub struct FilteredAggregatorFactory {
    delegate: Arc<dyn AggregatorFactory>,
    filter: CompiledFilter,
}

impl FilteredAggregatorFactory {
    /// Create the factory
    pub fn try_new(
        delegate: Arc<dyn AggregatorFactory>,
        filter: &DimFilter,
    ) -> std::result::Result<Self, ConfigurationError> {
        let filter = filter
            .compile()
            .context(InvalidFilterSnafu { name: delegate.name() })?;
        Ok(Self { delegate, filter })
    }

    /// The wrapped factory
    pub fn delegate(&self) -> &Arc<dyn AggregatorFactory> {
        &self.delegate
    }
}

#[derive(Debug)]
struct FilteredAggregator {
    predicate: MatcherPredicate,
    delegate: Box<dyn Aggregator>,
}

impl Aggregator for FilteredAggregator {
    fn aggregate(&mut self) -> Result<()> {
        if self.predicate.test() {
            self.delegate.aggregate()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.predicate.test() {
            self.delegate.validate()?;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        self.delegate.get()
    }

    fn get_long(&self) -> i64 {
        self.delegate.get_long()
    }

    fn get_float(&self) -> f32 {
        self.delegate.get_float()
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
struct FilteredBufferAggregator {
    predicate: MatcherPredicate,
    delegate: Box<dyn BufferAggregator>,
}

impl BufferAggregator for FilteredBufferAggregator {
    fn init(&self, span: &mut [u8]) {
        self.delegate.init(span)
    }

    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if self.predicate.test() {
            self.delegate.aggregate(span)?;
        }
        Ok(())
    }

    fn validate(&self, span: &[u8]) -> Result<()> {
        if self.predicate.test() {
            self.delegate.validate(span)?;
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        self.delegate.get(span)
    }

    fn get_long(&self, span: &[u8]) -> i64 {
        self.delegate.get_long(span)
    }

    fn get_float(&self, span: &[u8]) -> f32 {
        self.delegate.get_float(span)
    }

    fn get_double(&self, span: &[u8]) -> f64 {
        self.delegate.get_double(span)
    }

    fn close(&mut self) -> Result<()> {
        self.delegate.close()
    }
}

impl AggregatorFactory for FilteredAggregatorFactory {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Filtered
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(FilteredAggregator {
            predicate: MatcherPredicate(self.filter.make_matcher(selectors)),
            delegate: self.delegate.factorize(selectors)?,
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        Ok(Box::new(FilteredBufferAggregator {
            predicate: MatcherPredicate(self.filter.make_matcher(selectors)),
            delegate: self.delegate.factorize_buffered(selectors)?,
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        self.delegate.compare(lhs, rhs)
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        self.delegate.combine(lhs, rhs)
    }

    /// The stored values are already filtered, the delegate combines them
    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        self.delegate.combining_factory()
    }

    /// Both sides should be filtered and their delegates should be mergeable
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
        required_fields_with_filter(self.delegate.required_fields(), Some(&self.filter))
    }

    fn cache_key(&self) -> Vec<u8> {
        CacheKeyBuilder::new(AggregatorKind::Filtered.cache_type_id())
            .append_nested_key(&self.delegate.cache_key())
            .append_cacheable(Some(&self.filter as &dyn Cacheable))
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
        AggregatorSpec::Filtered {
            aggregator: Box::new(self.delegate.spec()),
            filter: self.filter.spec().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::numeric::{DoubleSumAggregatorFactory, LongSumAggregatorFactory};
    use crate::aggregate::tests::aggregate_rows;
    use crate::row::InputRow;
    use crate::selector::ParsePolicy;

    fn rows() -> Vec<InputRow> {
        [("a", 1_i64), ("b", 2), ("a", 3)]
            .into_iter()
            .map(|(page, value)| {
                InputRow::new(0)
                    .with_dimension("page", page)
                    .with_column("value", value)
            })
            .collect()
    }

    fn filtered_sum(name: &str) -> FilteredAggregatorFactory {
        FilteredAggregatorFactory::try_new(
            Arc::new(LongSumAggregatorFactory::with_field(name, "value").unwrap()),
            &DimFilter::selector("page", "a"),
        )
        .unwrap()
    }

    #[test]
    fn test_filtered() -> Report<AggregationError> {
        Report::capture(|| {
            let factory = filtered_sum("a_sum");
            assert_eq!(aggregate_rows(&factory, &rows(), ParsePolicy::Strict)?, Value::Long(4));
            assert_eq!(factory.name(), "a_sum");
            assert_eq!(factory.required_fields(), vec!["page", "value"]);
            assert_eq!(factory.combining_factory().kind(), AggregatorKind::LongSum);
            Ok(())
        })
    }

    #[test]
    fn test_merging() {
        let lhs = filtered_sum("x");
        let rhs = filtered_sum("x");
        assert_eq!(lhs.merging_factory(&rhs).unwrap().kind(), AggregatorKind::LongSum);

        let doubles = FilteredAggregatorFactory::try_new(
            Arc::new(DoubleSumAggregatorFactory::with_field("x", "value").unwrap()),
            &DimFilter::selector("page", "a"),
        )
        .unwrap();
        assert!(lhs.merging_factory(&doubles).is_err());
        let plain = LongSumAggregatorFactory::with_field("x", "value").unwrap();
        assert!(lhs.merging_factory(&plain).is_err());
    }

    #[test]
    fn test_cache_key() {
        let lhs = filtered_sum("x");
        let other_filter = FilteredAggregatorFactory::try_new(
            Arc::new(LongSumAggregatorFactory::with_field("x", "value").unwrap()),
            &DimFilter::selector("page", "b"),
        )
        .unwrap();
        let key = lhs.cache_key();
        assert_eq!(key[0], AggregatorKind::Filtered.cache_type_id());
        assert_ne!(key, other_filter.cache_key());
        assert_eq!(key, filtered_sum("y").cache_key());
    }
}
