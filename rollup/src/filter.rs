//! Row filters of the filtered aggregators
//!
//! [`DimFilter`] is the declarative form. It is compiled once into a [`CompiledFilter`]
//! when the aggregator factory is created, invalid regex/expression/bounds are reported
//! as configuration errors there. The compiled filter creates a [`ValueMatcher`] per
//! aggregator, the matcher reads the current row through the selectors

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::cache_key::{CacheKeyBuilder, Cacheable, filter_type_id};
use crate::expr::{Expr, ExprError};
use crate::selector::{ColumnSelectorFactory, ValueSelector};
use crate::value::Value;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum FilterError {
    #[snafu(display("Invalid regex pattern `{pattern}`"))]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[snafu(display("Invalid filter expression"))]
    InvalidExpression { source: ExprError },
    #[snafu(display("Numeric bound `{bound}` of dimension `{dimension}` is not a number"))]
    InvalidBound { dimension: String, bound: String },
    #[snafu(display("Logical filter `{kind}` requires at least one field"))]
    EmptyFields { kind: &'static str },
}

type Result<T> = std::result::Result<T, FilterError>;

/// Ordering used by the bound filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BoundOrdering {
    /// Compare the utf8 strings
    #[default]
    Lexicographic,
    /// Compare as double, non-numeric values never match
    Numeric,
}

/// Declarative filter
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DimFilter {
    True,
    /// Dimension equals the value, `None` matches null
    Selector {
        dimension: String,
        value: Option<String>,
    },
    In {
        dimension: String,
        values: Vec<Option<String>>,
    },
    #[serde(rename_all = "camelCase")]
    Bound {
        dimension: String,
        #[serde(default)]
        lower: Option<String>,
        #[serde(default)]
        upper: Option<String>,
        #[serde(default)]
        lower_strict: bool,
        #[serde(default)]
        upper_strict: bool,
        #[serde(default)]
        ordering: BoundOrdering,
    },
    Regex {
        dimension: String,
        pattern: String,
    },
    /// Matches if the expression is truthy
    Expression {
        expression: String,
    },
    And {
        fields: Vec<DimFilter>,
    },
    Or {
        fields: Vec<DimFilter>,
    },
    Not {
        field: Box<DimFilter>,
    },
}

impl DimFilter {
    /// Selector filter
    pub fn selector(dimension: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Selector {
            dimension: dimension.into(),
            value: Some(value.into()),
        }
    }

    /// Expression filter
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
        }
    }

    /// Compile the filter
    pub fn compile(&self) -> Result<CompiledFilter> {
        let node = match self {
            Self::True => FilterNode::True,
            Self::Selector { dimension, value } => FilterNode::In {
                dimension: dimension.clone(),
                values: vec![value.clone()],
            },
            Self::In { dimension, values } => FilterNode::In {
                dimension: dimension.clone(),
                values: values.clone(),
            },
            Self::Bound {
                dimension,
                lower,
                upper,
                lower_strict,
                upper_strict,
                ordering,
            } => {
                let parse = |bound: &Option<String>| -> Result<Option<BoundValue>> {
                    bound
                        .as_ref()
                        .map(|bound| match ordering {
                            BoundOrdering::Lexicographic => Ok(BoundValue::String(bound.clone())),
                            BoundOrdering::Numeric => bound
                                .trim()
                                .parse::<f64>()
                                .map(BoundValue::Number)
                                .map_err(|_| FilterError::InvalidBound {
                                    dimension: dimension.clone(),
                                    bound: bound.clone(),
                                }),
                        })
                        .transpose()
                };
                FilterNode::Bound {
                    dimension: dimension.clone(),
                    lower: parse(lower)?,
                    upper: parse(upper)?,
                    lower_strict: *lower_strict,
                    upper_strict: *upper_strict,
                }
            }
            Self::Regex { dimension, pattern } => FilterNode::Regex {
                dimension: dimension.clone(),
                regex: Regex::new(pattern).context(InvalidRegexSnafu { pattern })?,
            },
            Self::Expression { expression } => FilterNode::Expression(Arc::new(
                Expr::parse(expression).context(InvalidExpressionSnafu)?,
            )),
            Self::And { fields } | Self::Or { fields } => {
                if fields.is_empty() {
                    return EmptyFieldsSnafu {
                        kind: match self {
                            Self::And { .. } => "and",
                            _ => "or",
                        },
                    }
                    .fail();
                }
                let children = fields
                    .iter()
                    .map(|field| field.compile().map(|compiled| compiled.node))
                    .collect::<Result<Vec<_>>>()?;
                match self {
                    Self::And { .. } => FilterNode::And(children),
                    _ => FilterNode::Or(children),
                }
            }
            Self::Not { field } => FilterNode::Not(Box::new(field.compile()?.node)),
        };
        Ok(CompiledFilter {
            spec: self.clone(),
            node,
        })
    }

    /// Columns read by the filter
    pub fn required_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    fn collect_columns(&self, columns: &mut Vec<String>) {
        match self {
            Self::True => (),
            Self::Selector { dimension, .. }
            | Self::In { dimension, .. }
            | Self::Bound { dimension, .. }
            | Self::Regex { dimension, .. } => columns.push(dimension.clone()),
            Self::Expression { expression } => {
                if let Ok(expr) = Expr::parse(expression) {
                    columns.extend(expr.required_columns());
                }
            }
            Self::And { fields } | Self::Or { fields } => {
                fields.iter().for_each(|field| field.collect_columns(columns))
            }
            Self::Not { field } => field.collect_columns(columns),
        }
    }
}

impl Cacheable for DimFilter {
    fn cache_key(&self) -> Vec<u8> {
        match self {
            Self::True => CacheKeyBuilder::new(filter_type_id::TRUE).build(),
            Self::Selector { dimension, value } => CacheKeyBuilder::new(filter_type_id::SELECTOR)
                .append_string(dimension)
                .append_bool(value.is_some())
                .append_optional_string(value.as_deref())
                .build(),
            Self::In { dimension, values } => {
                let mut values: Vec<&Option<String>> = values.iter().collect();
                values.sort_unstable();
                values.dedup();
                CacheKeyBuilder::new(filter_type_id::IN)
                    .append_string(dimension)
                    .append_bool(values.iter().any(|value| value.is_none()))
                    .append_strings(values.iter().filter_map(|value| value.as_deref()))
                    .build()
            }
            Self::Bound {
                dimension,
                lower,
                upper,
                lower_strict,
                upper_strict,
                ordering,
            } => CacheKeyBuilder::new(filter_type_id::BOUND)
                .append_string(dimension)
                .append_bool(lower.is_some())
                .append_optional_string(lower.as_deref())
                .append_bool(upper.is_some())
                .append_optional_string(upper.as_deref())
                .append_bool(*lower_strict)
                .append_bool(*upper_strict)
                .append_u8(*ordering as u8)
                .build(),
            Self::Regex { dimension, pattern } => CacheKeyBuilder::new(filter_type_id::REGEX)
                .append_string(dimension)
                .append_string(pattern)
                .build(),
            Self::Expression { expression } => {
                // Canonical form, whitespaces and redundant parentheses do not matter
                let canonical = Expr::parse(expression)
                    .map_or_else(|_| expression.clone(), |expr| expr.to_string());
                CacheKeyBuilder::new(filter_type_id::EXPRESSION)
                    .append_string(&canonical)
                    .build()
            }
            Self::And { fields } => CacheKeyBuilder::new(filter_type_id::AND)
                .append_cacheables(fields.iter().map(|field| field as &dyn Cacheable))
                .build(),
            Self::Or { fields } => CacheKeyBuilder::new(filter_type_id::OR)
                .append_cacheables(fields.iter().map(|field| field as &dyn Cacheable))
                .build(),
            Self::Not { field } => CacheKeyBuilder::new(filter_type_id::NOT)
                .append_cacheable(Some(field.as_ref()))
                .build(),
        }
    }
}

#[derive(Debug, Clone)]
enum BoundValue {
    String(String),
    Number(f64),
}

#[derive(Debug, Clone)]
enum FilterNode {
    True,
    In {
        dimension: String,
        values: Vec<Option<String>>,
    },
    Bound {
        dimension: String,
        lower: Option<BoundValue>,
        upper: Option<BoundValue>,
        lower_strict: bool,
        upper_strict: bool,
    },
    Regex {
        dimension: String,
        regex: Regex,
    },
    Expression(Arc<Expr>),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

/// Validated filter, ready to create matchers
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    spec: DimFilter,
    node: FilterNode,
}

impl CompiledFilter {
    /// The declarative form
    pub fn spec(&self) -> &DimFilter {
        &self.spec
    }

    /// Create the matcher over the selectors
    pub fn make_matcher(&self, selectors: &dyn ColumnSelectorFactory) -> Box<dyn ValueMatcher> {
        make_matcher(&self.node, selectors)
    }
}

impl Cacheable for CompiledFilter {
    fn cache_key(&self) -> Vec<u8> {
        self.spec.cache_key()
    }
}

/// Decides whether the current row matches
pub trait ValueMatcher: Debug + Send + Sync {
    /// Returns true if the current row matches
    fn matches(&self) -> bool;
}

fn make_matcher(node: &FilterNode, selectors: &dyn ColumnSelectorFactory) -> Box<dyn ValueMatcher> {
    match node {
        FilterNode::True => Box::new(TrueMatcher),
        FilterNode::In { dimension, values } => Box::new(DimensionMatcher {
            selector: selectors.make_selector(dimension),
            predicate: InPredicate {
                values: values.clone(),
            },
        }),
        FilterNode::Bound {
            dimension,
            lower,
            upper,
            lower_strict,
            upper_strict,
        } => Box::new(DimensionMatcher {
            selector: selectors.make_selector(dimension),
            predicate: BoundPredicate {
                lower: lower.clone(),
                upper: upper.clone(),
                lower_strict: *lower_strict,
                upper_strict: *upper_strict,
            },
        }),
        FilterNode::Regex { dimension, regex } => Box::new(DimensionMatcher {
            selector: selectors.make_selector(dimension),
            predicate: RegexPredicate {
                regex: regex.clone(),
            },
        }),
        FilterNode::Expression(expr) => Box::new(ExpressionMatcher {
            selector: selectors.make_expression_selector(expr),
        }),
        FilterNode::And(children) => Box::new(AndMatcher(
            children
                .iter()
                .map(|child| make_matcher(child, selectors))
                .collect(),
        )),
        FilterNode::Or(children) => Box::new(OrMatcher(
            children
                .iter()
                .map(|child| make_matcher(child, selectors))
                .collect(),
        )),
        FilterNode::Not(child) => Box::new(NotMatcher(make_matcher(child, selectors))),
    }
}

#[derive(Debug)]
struct TrueMatcher;

impl ValueMatcher for TrueMatcher {
    #[inline]
    fn matches(&self) -> bool {
        true
    }
}

/// Predicate over a single dimension value, `None` is null
trait DimensionPredicate: Debug + Send + Sync {
    fn test(&self, value: Option<&str>) -> bool;
}

/// Applies the predicate to the dimension. Multi-value dimensions match if any of the
/// values matches, empty arrays are null
#[derive(Debug)]
struct DimensionMatcher<P> {
    selector: Arc<dyn ValueSelector>,
    predicate: P,
}

impl<P: DimensionPredicate> ValueMatcher for DimensionMatcher<P> {
    fn matches(&self) -> bool {
        let values = self.selector.get_object().dimension_values();
        if values.is_empty() {
            return self.predicate.test(None);
        }
        values
            .iter()
            .any(|value| self.predicate.test(value.as_deref()))
    }
}

#[derive(Debug)]
struct InPredicate {
    values: Vec<Option<String>>,
}

impl DimensionPredicate for InPredicate {
    #[inline]
    fn test(&self, value: Option<&str>) -> bool {
        self.values.iter().any(|v| v.as_deref() == value)
    }
}

#[derive(Debug)]
struct BoundPredicate {
    lower: Option<BoundValue>,
    upper: Option<BoundValue>,
    lower_strict: bool,
    upper_strict: bool,
}

impl BoundPredicate {
    fn compare(bound: &BoundValue, value: &str) -> Option<Ordering> {
        match bound {
            BoundValue::String(bound) => Some(value.cmp(bound.as_str())),
            BoundValue::Number(bound) => value.trim().parse::<f64>().ok()?.partial_cmp(bound),
        }
    }
}

impl DimensionPredicate for BoundPredicate {
    fn test(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        let lower_ok = self.lower.as_ref().is_none_or(|bound| {
            match Self::compare(bound, value) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => !self.lower_strict,
                _ => false,
            }
        });
        let upper_ok = self.upper.as_ref().is_none_or(|bound| {
            match Self::compare(bound, value) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => !self.upper_strict,
                _ => false,
            }
        });
        lower_ok && upper_ok
    }
}

#[derive(Debug)]
struct RegexPredicate {
    regex: Regex,
}

impl DimensionPredicate for RegexPredicate {
    #[inline]
    fn test(&self, value: Option<&str>) -> bool {
        value.is_some_and(|value| self.regex.is_match(value))
    }
}

#[derive(Debug)]
struct ExpressionMatcher {
    selector: Arc<dyn ValueSelector>,
}

impl ValueMatcher for ExpressionMatcher {
    fn matches(&self) -> bool {
        match self.selector.get_object() {
            Value::Long(v) => v != 0,
            Value::Double(v) => v != 0.0 && !v.is_nan(),
            Value::Float(v) => v != 0.0 && !v.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct AndMatcher(Vec<Box<dyn ValueMatcher>>);

impl ValueMatcher for AndMatcher {
    fn matches(&self) -> bool {
        self.0.iter().all(|matcher| matcher.matches())
    }
}

#[derive(Debug)]
struct OrMatcher(Vec<Box<dyn ValueMatcher>>);

impl ValueMatcher for OrMatcher {
    fn matches(&self) -> bool {
        self.0.iter().any(|matcher| matcher.matches())
    }
}

#[derive(Debug)]
struct NotMatcher(Box<dyn ValueMatcher>);

impl ValueMatcher for NotMatcher {
    fn matches(&self) -> bool {
        !self.0.matches()
    }
}

/// Row level predicate of the aggregators. Aggregators are generic over it, the
/// unfiltered aggregators use [`AlwaysTrue`] and the check is compiled away
pub trait RowPredicate: Debug + Send + Sync + 'static {
    /// Returns true if the current row should be aggregated
    fn test(&self) -> bool;
}

/// Predicate accepts all of the rows
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTrue;

impl RowPredicate for AlwaysTrue {
    #[inline(always)]
    fn test(&self) -> bool {
        true
    }
}

/// Predicate backed by the [`ValueMatcher`]
#[derive(Debug)]
pub struct MatcherPredicate(pub Box<dyn ValueMatcher>);

impl RowPredicate for MatcherPredicate {
    #[inline]
    fn test(&self) -> bool {
        self.0.matches()
    }
}
