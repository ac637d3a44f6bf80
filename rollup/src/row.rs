//! Input rows and the aggregated output rows

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::TIME_COLUMN;
use crate::common::types::Timestamp;
use crate::value::Value;

/// Row fed into the index
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputRow {
    /// Milliseconds since the epoch
    pub timestamp: Timestamp,
    /// Names of the dimensions present in this row, in the order they should be
    /// discovered when the index does not declare its dimensions
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// All of the columns of the row, dimensions and metric inputs
    #[serde(default)]
    pub event: BTreeMap<String, Value>,
}

impl InputRow {
    /// Create a row without columns
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// Add a dimension column
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !self.dimensions.contains(&name) {
            self.dimensions.push(name.clone());
        }
        self.event.insert(name, value.into());
        self
    }

    /// Add a column that is not a dimension
    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.insert(name.into(), value.into());
        self
    }

    /// Raw value of the column, the timestamp for [`TIME_COLUMN`]
    pub fn get(&self, column: &str) -> Value {
        if column == TIME_COLUMN {
            return Value::Long(self.timestamp);
        }
        self.event.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Visit the raw value of the column without cloning it
    pub fn with_raw<R>(&self, column: &str, f: impl FnOnce(&Value) -> R) -> R {
        if column == TIME_COLUMN {
            return f(&Value::Long(self.timestamp));
        }
        match self.event.get(column) {
            Some(value) => f(value),
            None => f(&Value::Null),
        }
    }
}

/// Aggregated row produced by the index and the merger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Start of the bucket of the row
    pub timestamp: Timestamp,
    /// Dimension values in the dimension order of the index
    pub dimensions: Vec<(String, Value)>,
    /// Metric values in the order of the metrics
    pub metrics: Vec<(String, Value)>,
}

impl Row {
    /// Value of the dimension
    pub fn dimension(&self, name: &str) -> Option<&Value> {
        self.dimensions
            .iter()
            .find_map(|(n, value)| (n == name).then_some(value))
    }

    /// Value of the metric
    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.metrics
            .iter()
            .find_map(|(n, value)| (n == name).then_some(value))
    }
}

/// Format the timestamp in RFC 3339, fallback to the raw milliseconds if it is out of
/// range
pub fn format_timestamp(timestamp: Timestamp) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(timestamp as i128 * 1_000_000)
        .ok()
        .and_then(|datetime| {
            datetime
                .format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| timestamp.to_string())
}

/// Parse the RFC 3339 string into milliseconds since the epoch
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    time::OffsetDateTime::parse(s.trim(), &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|datetime| (datetime.unix_timestamp_nanos() / 1_000_000) as Timestamp)
}

/// Pretty table of the rows, the columns are the union of the columns of the rows
#[derive(Debug)]
pub struct RowsTable<'a>(pub &'a [Row]);

impl Display for RowsTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut columns: Vec<&str> = vec![TIME_COLUMN];
        self.0.iter().for_each(|row| {
            row.dimensions
                .iter()
                .chain(&row.metrics)
                .for_each(|(name, _)| {
                    if !columns.contains(&name.as_str()) {
                        columns.push(name);
                    }
                })
        });

        let mut builder = Builder::default();
        builder.push_record(columns.iter().copied());
        self.0.iter().for_each(|row| {
            builder.push_record(columns.iter().map(|&column| {
                if column == TIME_COLUMN {
                    format_timestamp(row.timestamp)
                } else {
                    row.dimension(column)
                        .or_else(|| row.metric(column))
                        .map_or_else(|| Value::Null.to_string(), ToString::to_string)
                }
            }));
        });
        write!(f, "{}", builder.build().with(Style::modern()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(parse_timestamp("1970-01-01T00:00:01.5Z"), Some(1500));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_display_rows() {
        let rows = vec![
            Row {
                timestamp: 0,
                dimensions: vec![("page".to_string(), Value::from("a"))],
                metrics: vec![("count".to_string(), Value::Long(3))],
            },
            Row {
                timestamp: 60_000,
                dimensions: vec![("page".to_string(), Value::from("b"))],
                metrics: vec![("count".to_string(), Value::Long(5))],
            },
        ];
        expect_test::expect![[r#"
            ┌──────────────────────┬──────┬───────┐
            │ __time               │ page │ count │
            ├──────────────────────┼──────┼───────┤
            │ 1970-01-01T00:00:00Z │ a    │ 3     │
            ├──────────────────────┼──────┼───────┤
            │ 1970-01-01T00:01:00Z │ b    │ 5     │
            └──────────────────────┴──────┴───────┘"#]]
        .assert_eq(&RowsTable(&rows).to_string());
    }

    #[test]
    fn test_input_row() {
        let row = InputRow::new(7)
            .with_dimension("page", "a")
            .with_column("value", 3_i64);
        assert_eq!(row.dimensions, vec!["page"]);
        assert_eq!(row.get(TIME_COLUMN), Value::Long(7));
        assert_eq!(row.get("value"), Value::Long(3));
        assert_eq!(row.get("missing"), Value::Null);
    }
}
