//! `count` aggregation

use std::cmp::Ordering;
use std::sync::Arc;

use super::numeric::{LongSumAggregatorFactory, NumericPrimitive};
use super::spec::AggregatorSpec;
use super::{
    Aggregator, AggregatorFactory, AggregatorKind, BufferAggregator, ConfigurationError, Result,
    TypeMismatchSnafu, check_name, compile_filter, decode_transport, required_fields_with_filter,
    with_predicate,
};
use crate::cache_key::{CacheKeyBuilder, Cacheable};
use crate::filter::{CompiledFilter, DimFilter, RowPredicate};
use crate::selector::ColumnSelectorFactory;
use crate::value::{Value, ValueType};

/// Count the rows matching the optional filter
#[derive(Debug)]
pub struct CountAggregatorFactory {
    name: String,
    filter: Option<CompiledFilter>,
}

impl CountAggregatorFactory {
    /// Create the factory
    pub fn try_new(
        name: impl Into<String>,
        filter: Option<&DimFilter>,
    ) -> std::result::Result<Self, ConfigurationError> {
        let name = name.into();
        check_name(&name)?;
        Ok(Self {
            filter: compile_filter(&name, filter)?,
            name,
        })
    }

    fn count(&self, value: &Value) -> Result<Option<i64>> {
        value.to_long().map_err(|_| {
            TypeMismatchSnafu {
                name: &self.name,
                expect: ValueType::Long,
                found: value.to_string(),
            }
            .build()
        })
    }
}

#[derive(Debug)]
struct CountAggregator<P> {
    predicate: P,
    count: i64,
}

impl<P: RowPredicate> Aggregator for CountAggregator<P> {
    #[inline]
    fn aggregate(&mut self) -> Result<()> {
        if self.predicate.test() {
            self.count += 1;
        }
        Ok(())
    }

    fn get(&self) -> Value {
        Value::Long(self.count)
    }

    fn get_long(&self) -> i64 {
        self.count
    }

    fn get_double(&self) -> f64 {
        self.count as f64
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

#[derive(Debug)]
struct CountBufferAggregator<P> {
    predicate: P,
}

impl<P: RowPredicate> BufferAggregator for CountBufferAggregator<P> {
    fn init(&self, span: &mut [u8]) {
        0_i64.store(span);
    }

    #[inline]
    fn aggregate(&mut self, span: &mut [u8]) -> Result<()> {
        if self.predicate.test() {
            (i64::load(span) + 1).store(span);
        }
        Ok(())
    }

    fn get(&self, span: &[u8]) -> Value {
        Value::Long(i64::load(span))
    }

    fn get_long(&self, span: &[u8]) -> i64 {
        i64::load(span)
    }
}

impl AggregatorFactory for CountAggregatorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Count
    }

    fn factorize(&self, selectors: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(CountAggregator {
                predicate,
                count: 0,
            }) as Box<dyn Aggregator>
        }))
    }

    fn factorize_buffered(
        &self,
        selectors: &dyn ColumnSelectorFactory,
    ) -> Result<Box<dyn BufferAggregator>> {
        Ok(with_predicate!(&self.filter, selectors, |predicate| {
            Box::new(CountBufferAggregator { predicate }) as Box<dyn BufferAggregator>
        }))
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> Ordering {
        let lhs = lhs.to_long().ok().flatten();
        let rhs = rhs.to_long().ok().flatten();
        lhs.cmp(&rhs)
    }

    fn combine(&self, lhs: Value, rhs: Value) -> Result<Value> {
        Ok(match (self.count(&lhs)?, self.count(&rhs)?) {
            (None, None) => Value::Null,
            (Some(count), None) | (None, Some(count)) => Value::Long(count),
            (Some(lhs), Some(rhs)) => Value::Long(lhs.add(rhs)),
        })
    }

    /// Counts are summed when they are combined
    fn combining_factory(&self) -> Arc<dyn AggregatorFactory> {
        Arc::new(LongSumAggregatorFactory::combining(&self.name))
    }

    fn deserialize(&self, value: Value) -> Result<Value> {
        let value = decode_transport(&self.name, value)?;
        Ok(self.count(&value)?.map_or(Value::Null, Value::Long))
    }

    fn finalize_computation(&self, value: Value) -> Value {
        value
    }

    fn required_fields(&self) -> Vec<String> {
        required_fields_with_filter(vec![], self.filter.as_ref())
    }

    fn cache_key(&self) -> Vec<u8> {
        CacheKeyBuilder::new(AggregatorKind::Count.cache_type_id())
            .append_cacheable(self.filter.as_ref().map(|filter| filter as &dyn Cacheable))
            .build()
    }

    fn intermediate_type(&self) -> ValueType {
        ValueType::Long
    }

    fn output_type(&self) -> ValueType {
        ValueType::Long
    }

    fn max_intermediate_size(&self) -> usize {
        8
    }

    fn identity(&self) -> Value {
        Value::Long(0)
    }

    fn spec(&self) -> AggregatorSpec {
        AggregatorSpec::Count {
            name: self.name.clone(),
            filter: self.filter.as_ref().map(|filter| filter.spec().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Report;

    use super::*;
    use crate::aggregate::AggregationError;
    use crate::aggregate::tests::{aggregate_rows, value_rows};
    use crate::selector::ParsePolicy;

    #[test]
    fn test_count() -> Report<AggregationError> {
        Report::capture(|| {
            let count = CountAggregatorFactory::try_new("rows", None).unwrap();
            let filtered =
                CountAggregatorFactory::try_new("big", Some(&DimFilter::expression("value > 10")))
                    .unwrap();
            let rows = value_rows(&[5_i64, 15, 20]);
            assert_eq!(aggregate_rows(&count, &rows, ParsePolicy::Strict)?, Value::Long(3));
            assert_eq!(aggregate_rows(&filtered, &rows, ParsePolicy::Strict)?, Value::Long(2));
            assert!(count.required_fields().is_empty());
            assert_eq!(filtered.required_fields(), vec!["value"]);
            assert_ne!(count.cache_key(), filtered.cache_key());
            Ok(())
        })
    }

    #[test]
    fn test_merge_counts() -> Report<AggregationError> {
        Report::capture(|| {
            let lhs = CountAggregatorFactory::try_new("rows", None).unwrap();
            let rhs = CountAggregatorFactory::try_new("rows", None).unwrap();
            let merging = lhs.merging_factory(&rhs)?;
            assert_eq!(merging.kind(), AggregatorKind::LongSum);
            assert_eq!(merging.required_fields(), vec!["rows"]);
            assert_eq!(merging.combine(Value::Long(2), Value::Long(3))?, Value::Long(5));
            assert_eq!(lhs.combine(Value::Long(2), Value::Long(3))?, Value::Long(5));
            assert_eq!(lhs.combine(Value::Null, Value::Long(3))?, Value::Long(3));
            Ok(())
        })
    }

    #[test]
    fn test_count_is_not_mergeable_with_sum() {
        let count = CountAggregatorFactory::try_new("x", None).unwrap();
        let sum = LongSumAggregatorFactory::with_field("x", "x").unwrap();
        let err = count.merging_factory(&sum).unwrap_err();
        expect_test::expect![
            "Aggregator `x`(count) is not mergeable with the aggregator `x`(longSum)"
        ]
        .assert_eq(&err.to_string());
        assert!(sum.merging_factory(&count).is_err());
    }

    #[test]
    fn test_combining_factory_reads_counts() -> Report<AggregationError> {
        Report::capture(|| {
            let count = CountAggregatorFactory::try_new("rows", None).unwrap();
            let combining = count.combining_factory();
            let rows = vec![
                crate::row::InputRow::new(0).with_column("rows", 2_i64),
                crate::row::InputRow::new(0).with_column("rows", 3_i64),
            ];
            assert_eq!(aggregate_rows(&*combining, &rows, ParsePolicy::Strict)?, Value::Long(5));
            Ok(())
        })
    }
}
