//! Column selectors, the typed read views of the row currently being aggregated
//!
//! The index points the shared [`RowPointer`] at each incoming row, then invokes the
//! aggregators. Aggregators hold selectors created once by the
//! [`ColumnSelectorFactory`], they never see the row directly

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::common::types::Timestamp;
use crate::expr::Expr;
use crate::row::{InputRow, parse_timestamp};
use crate::value::{Value, ValueError};

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum SelectorError {
    #[snafu(display("Malformed value in column `{column}`"))]
    Malformed { column: String, source: ValueError },
    #[snafu(display("Malformed timestamp `{value}` in column `{column}`"))]
    MalformedTimestamp { column: String, value: String },
}

/// Result of the selectors
pub type SelectorResult<T> = std::result::Result<T, SelectorError>;

/// How to handle the values that can not be coerced to the requested type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParsePolicy {
    /// Report the malformed values as error, the row is rejected
    Strict,
    /// Malformed values are treated as null, the row is kept
    #[default]
    Lenient,
}

/// Typed read view of a column
pub trait ValueSelector: Debug + Send + Sync {
    /// Raw value
    fn get_object(&self) -> Value;

    /// Policy applied by the typed getters
    fn policy(&self) -> ParsePolicy;

    /// Name of the column, used by errors
    fn column(&self) -> &str;

    /// Value coerced to long, `None` for null
    fn get_long(&self) -> SelectorResult<Option<i64>> {
        let value = self.get_object();
        coerce(self, value.to_long())
    }

    /// Value coerced to float, `None` for null
    fn get_float(&self) -> SelectorResult<Option<f32>> {
        let value = self.get_object();
        coerce(self, value.to_float())
    }

    /// Value coerced to double, `None` for null
    fn get_double(&self) -> SelectorResult<Option<f64>> {
        let value = self.get_object();
        coerce(self, value.to_double())
    }

    /// Value coerced to decimal, `None` for null
    fn get_decimal(&self) -> SelectorResult<Option<Decimal>> {
        let value = self.get_object();
        coerce(self, value.to_decimal())
    }

    /// Value interpreted as timestamp: milliseconds, numeric strings and RFC 3339
    /// strings are accepted
    fn get_timestamp(&self) -> SelectorResult<Option<Timestamp>> {
        let value = self.get_object();
        if let Value::String(s) = &value {
            if let Some(timestamp) = parse_timestamp(s) {
                return Ok(Some(timestamp));
            }
        }
        match value.to_long() {
            Ok(timestamp) => Ok(timestamp),
            Err(_) => match self.policy() {
                ParsePolicy::Strict => MalformedTimestampSnafu {
                    column: self.column(),
                    value: value.to_string(),
                }
                .fail(),
                ParsePolicy::Lenient => {
                    tracing::trace!(
                        "Treat the malformed timestamp `{}` in column `{}` as null",
                        value,
                        self.column()
                    );
                    Ok(None)
                }
            },
        }
    }
}

#[inline]
fn coerce<S: ValueSelector + ?Sized, T>(
    selector: &S,
    result: Result<Option<T>, ValueError>,
) -> SelectorResult<Option<T>> {
    match result {
        Ok(v) => Ok(v),
        Err(source) => match selector.policy() {
            ParsePolicy::Strict => Err(SelectorError::Malformed {
                column: selector.column().to_string(),
                source,
            }),
            ParsePolicy::Lenient => {
                tracing::trace!(
                    "Treat the malformed value in column `{}` as null: {}",
                    selector.column(),
                    source
                );
                Ok(None)
            }
        },
    }
}

/// Creates selectors over the current row
pub trait ColumnSelectorFactory: Debug + Send + Sync {
    /// Selector of the column
    fn make_selector(&self, column: &str) -> Arc<dyn ValueSelector>;

    /// Policy of the created selectors
    fn policy(&self) -> ParsePolicy;

    /// Selector that evaluates the expression over the columns of the current row
    fn make_expression_selector(&self, expr: &Arc<Expr>) -> Arc<dyn ValueSelector> {
        let columns = expr
            .required_columns()
            .into_iter()
            .map(|column| {
                let selector = self.make_selector(&column);
                (column, selector)
            })
            .collect();
        Arc::new(ExpressionSelector {
            expr: Arc::clone(expr),
            columns,
            policy: self.policy(),
        })
    }
}

/// Points to the row the index is aggregating
#[derive(Debug, Default)]
pub struct RowPointer {
    row: RwLock<Option<Arc<InputRow>>>,
}

impl RowPointer {
    /// Point to the row
    pub fn set(&self, row: Arc<InputRow>) {
        *self.row.write() = Some(row);
    }

    /// Release the row
    pub fn clear(&self) {
        *self.row.write() = None;
    }

    /// Visit the raw value of the column in current row, null if no row is set
    #[inline]
    pub fn with_value<R>(&self, column: &str, f: impl FnOnce(&Value) -> R) -> R {
        match &*self.row.read() {
            Some(row) => row.with_raw(column, f),
            None => f(&Value::Null),
        }
    }
}

/// Selector of a column in the row the [`RowPointer`] points to
#[derive(Debug)]
pub struct RowColumnSelector {
    pointer: Arc<RowPointer>,
    column: String,
    policy: ParsePolicy,
}

impl ValueSelector for RowColumnSelector {
    #[inline]
    fn get_object(&self) -> Value {
        self.pointer.with_value(&self.column, Value::clone)
    }

    #[inline]
    fn policy(&self) -> ParsePolicy {
        self.policy
    }

    #[inline]
    fn column(&self) -> &str {
        &self.column
    }

    // Fast paths avoid cloning the strings

    fn get_long(&self) -> SelectorResult<Option<i64>> {
        let result = self.pointer.with_value(&self.column, Value::to_long);
        coerce(self, result)
    }

    fn get_float(&self) -> SelectorResult<Option<f32>> {
        let result = self.pointer.with_value(&self.column, Value::to_float);
        coerce(self, result)
    }

    fn get_double(&self) -> SelectorResult<Option<f64>> {
        let result = self.pointer.with_value(&self.column, Value::to_double);
        coerce(self, result)
    }
}

/// [`ColumnSelectorFactory`] over the [`RowPointer`]
#[derive(Debug, Clone)]
pub struct RowSelectorFactory {
    pointer: Arc<RowPointer>,
    policy: ParsePolicy,
}

impl RowSelectorFactory {
    /// Create a new factory
    pub fn new(pointer: Arc<RowPointer>, policy: ParsePolicy) -> Self {
        Self { pointer, policy }
    }

    /// The pointer the selectors read from
    pub fn pointer(&self) -> &Arc<RowPointer> {
        &self.pointer
    }
}

impl ColumnSelectorFactory for RowSelectorFactory {
    fn make_selector(&self, column: &str) -> Arc<dyn ValueSelector> {
        Arc::new(RowColumnSelector {
            pointer: Arc::clone(&self.pointer),
            column: column.to_string(),
            policy: self.policy,
        })
    }

    fn policy(&self) -> ParsePolicy {
        self.policy
    }
}

/// Selector evaluates the expression
#[derive(Debug)]
pub struct ExpressionSelector {
    expr: Arc<Expr>,
    columns: Vec<(String, Arc<dyn ValueSelector>)>,
    policy: ParsePolicy,
}

impl ValueSelector for ExpressionSelector {
    fn get_object(&self) -> Value {
        let bindings = |name: &str| {
            self.columns
                .iter()
                .find(|(column, _)| column == name)
                .map_or(Value::Null, |(_, selector)| selector.get_object())
        };
        self.expr.eval(&bindings)
    }

    #[inline]
    fn policy(&self) -> ParsePolicy {
        self.policy
    }

    #[inline]
    fn column(&self) -> &str {
        "<expression>"
    }
}

/// Element view of a multi-value column. All of the element selectors created by the same
/// [`ElementSelectorFactory`] share the index. Arrays yield their element at the index
/// or null, scalars are broadcast to every index
#[derive(Debug)]
pub struct ElementSelector {
    inner: Arc<dyn ValueSelector>,
    index: Arc<AtomicUsize>,
}

impl ValueSelector for ElementSelector {
    fn get_object(&self) -> Value {
        match self.inner.get_object() {
            Value::Array(mut values) => {
                let index = self.index.load(Ordering::Relaxed);
                if index < values.len() {
                    values.swap_remove(index)
                } else {
                    Value::Null
                }
            }
            scalar => scalar,
        }
    }

    #[inline]
    fn policy(&self) -> ParsePolicy {
        self.inner.policy()
    }

    #[inline]
    fn column(&self) -> &str {
        self.inner.column()
    }
}

/// Factory creates [`ElementSelector`]s over the selectors of the inner factory
#[derive(Debug)]
pub struct ElementSelectorFactory<'a> {
    inner: &'a dyn ColumnSelectorFactory,
    index: Arc<AtomicUsize>,
}

impl<'a> ElementSelectorFactory<'a> {
    /// Create a factory, the returned index selects the element
    pub fn new(inner: &'a dyn ColumnSelectorFactory) -> (Self, Arc<AtomicUsize>) {
        let index = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                index: Arc::clone(&index),
            },
            index,
        )
    }
}

impl ColumnSelectorFactory for ElementSelectorFactory<'_> {
    fn make_selector(&self, column: &str) -> Arc<dyn ValueSelector> {
        Arc::new(ElementSelector {
            inner: self.inner.make_selector(column),
            index: Arc::clone(&self.index),
        })
    }

    fn policy(&self) -> ParsePolicy {
        self.inner.policy()
    }
}

/// Number of the elements of the value seen by the element selectors: length of the
/// array, `1` for scalars and `0` for null
pub fn element_count(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(values) => values.len(),
        _ => 1,
    }
}
