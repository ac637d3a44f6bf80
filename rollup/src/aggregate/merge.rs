//! Merge the factory lists of different sources, for example the chunks persisted by
//! different nodes

use std::sync::Arc;

use super::AggregatorFactory;
use crate::common::utils::hash::new_hash_map;

/// Merged factory of the output column `name`
#[derive(Debug, Clone)]
pub struct MergedMetric {
    /// Name of the output column
    pub name: String,
    /// Factory combines the column of all of the sources, `None` if the column is
    /// missing in some sources or the factories are not mergeable
    pub factory: Option<Arc<dyn AggregatorFactory>>,
}

/// Merge the factory lists. Names are ordered by their first appearance
///
/// Returns `None` if any list is unknown. Otherwise, every name is merged
/// independently: it has the combining factory if all of the lists contain it and they
/// are pairwise mergeable, or `None` if not
pub fn merge_aggregator_factories(
    lists: &[Option<Vec<Arc<dyn AggregatorFactory>>>],
) -> Option<Vec<MergedMetric>> {
    let lists = lists.iter().map(Option::as_ref).collect::<Option<Vec<_>>>()?;

    let mut names = Vec::new();
    let mut groups = new_hash_map::<&str, Group<'_>>();
    for (source, list) in lists.iter().enumerate() {
        for factory in list.iter() {
            let group = groups.entry(factory.name()).or_insert_with(|| {
                names.push(factory.name());
                Group::default()
            });
            if group.last_source != Some(source) {
                group.last_source = Some(source);
                group.sources += 1;
            }
            group.factories.push(&**factory);
        }
    }

    let merged = names
        .into_iter()
        .map(|name| {
            let group = groups.remove(name).unwrap_or_default();
            let factory = if group.sources == lists.len() {
                merge_group(&group.factories)
            } else {
                tracing::debug!("Metric `{name}` is missing in some of the sources");
                None
            };
            MergedMetric {
                name: name.to_string(),
                factory,
            }
        })
        .collect();
    Some(merged)
}

/// Factories of the same name
#[derive(Debug, Default)]
struct Group<'a> {
    factories: Vec<&'a dyn AggregatorFactory>,
    /// Number of the lists that contain the name
    sources: usize,
    last_source: Option<usize>,
}

fn merge_group(factories: &[&dyn AggregatorFactory]) -> Option<Arc<dyn AggregatorFactory>> {
    let (first, others) = factories.split_first()?;
    for other in others {
        if let Err(e) = first.merging_factory(*other) {
            tracing::warn!("Failed to merge the metric: {e}");
            return None;
        }
    }
    Some(first.combining_factory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatorKind;
    use crate::aggregate::count::CountAggregatorFactory;
    use crate::aggregate::numeric::{DoubleMaxAggregatorFactory, LongSumAggregatorFactory};

    fn count(name: &str) -> Arc<dyn AggregatorFactory> {
        Arc::new(CountAggregatorFactory::try_new(name, None).unwrap())
    }

    fn long_sum(name: &str) -> Arc<dyn AggregatorFactory> {
        Arc::new(LongSumAggregatorFactory::with_field(name, "value").unwrap())
    }

    fn summary(merged: &[MergedMetric]) -> Vec<(String, Option<AggregatorKind>)> {
        merged
            .iter()
            .map(|metric| {
                (
                    metric.name.clone(),
                    metric.factory.as_ref().map(|factory| factory.kind()),
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_factories() {
        let max: Arc<dyn AggregatorFactory> =
            Arc::new(DoubleMaxAggregatorFactory::with_field("max", "value").unwrap());
        let merged = merge_aggregator_factories(&[
            Some(vec![count("rows"), long_sum("sum"), max.clone()]),
            Some(vec![long_sum("sum"), count("rows"), count("max")]),
            Some(vec![count("rows"), long_sum("sum"), max, count("extra")]),
        ])
        .unwrap();
        assert_eq!(
            summary(&merged),
            vec![
                ("rows".to_string(), Some(AggregatorKind::LongSum)),
                ("sum".to_string(), Some(AggregatorKind::LongSum)),
                ("max".to_string(), None),
                ("extra".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_repeated_name_is_not_containment() {
        let merged = merge_aggregator_factories(&[
            Some(vec![count("rows"), count("rows")]),
            Some(vec![long_sum("sum")]),
        ])
        .unwrap();
        assert_eq!(
            summary(&merged),
            vec![("rows".to_string(), None), ("sum".to_string(), None)]
        );

        let merged = merge_aggregator_factories(&[
            Some(vec![long_sum("sum"), long_sum("sum")]),
            Some(vec![long_sum("sum")]),
        ])
        .unwrap();
        assert_eq!(
            summary(&merged),
            vec![("sum".to_string(), Some(AggregatorKind::LongSum))]
        );
    }

    #[test]
    fn test_unknown_list() {
        assert!(merge_aggregator_factories(&[Some(vec![count("rows")]), None]).is_none());
        assert_eq!(merge_aggregator_factories(&[]).map(|merged| merged.len()), Some(0));
    }
}
