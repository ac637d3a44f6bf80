//! Values flowing through the engine
//!
//! [`Value`] is used for raw input values, intermediate aggregation states and finalized
//! outputs. Intermediate states of the sketches and the pair/range aggregations are
//! wrapped in [`ComplexValue`]

use std::fmt::{Debug, Display};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{Snafu, ensure};

use crate::sketch::count_min::CountMinSketch;
use crate::sketch::histogram::ApproximateHistogram;
use crate::sketch::hll::HyperLogLog;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum ValueError {
    #[snafu(display("Can not coerce `{value}` to `{target}`"))]
    Coerce { value: String, target: ValueType },
    #[snafu(display("Can not coerce the non-finite number `{value}` to `{target}`"))]
    NonFinite { value: f64, target: ValueType },
}

type Result<T> = std::result::Result<T, ValueError>;

/// Type of the complex values
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplexType {
    HyperUnique,
    ApproximateHistogram,
    CountMin,
    Range,
    LongPair,
    DoublePair,
}

/// Type of the [`Value`]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Long,
    Float,
    Double,
    String,
    Decimal,
    Bytes,
    Array,
    Complex(ComplexType),
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complex(complex) => write!(f, "Complex<{:?}>", complex),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Dynamically typed value
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Decimal(Decimal),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Complex(ComplexValue),
}

/// Intermediate state of the `range` aggregation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeState {
    /// Minimum value seen so far, `+∞` if empty
    pub min: f64,
    /// Maximum value seen so far, `-∞` if empty
    pub max: f64,
}

impl RangeState {
    /// Range that does not contain any value
    pub const EMPTY: Self = Self {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
    };

    /// Returns true if no value has been folded into the range
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Width of the range, `None` if it is empty
    #[inline]
    pub fn width(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.max - self.min)
    }
}

/// Value associated with the timestamp it was observed at, the intermediate state of the
/// `first`/`last` aggregations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampedValue<T> {
    /// Timestamp of the row that produced the value
    pub timestamp: i64,
    /// The value, `None` if the row had null
    pub value: Option<T>,
}

/// Complex intermediate states
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum ComplexValue {
    HyperUnique(Box<HyperLogLog>),
    Histogram(Box<ApproximateHistogram>),
    CountMin(Box<CountMinSketch>),
    Range(RangeState),
    LongPair(TimestampedValue<i64>),
    DoublePair(TimestampedValue<f64>),
}

impl ComplexValue {
    /// Type of the complex value
    pub fn complex_type(&self) -> ComplexType {
        match self {
            Self::HyperUnique(_) => ComplexType::HyperUnique,
            Self::Histogram(_) => ComplexType::ApproximateHistogram,
            Self::CountMin(_) => ComplexType::CountMin,
            Self::Range(_) => ComplexType::Range,
            Self::LongPair(_) => ComplexType::LongPair,
            Self::DoublePair(_) => ComplexType::DoublePair,
        }
    }
}

impl Display for ComplexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HyperUnique(hll) => write!(f, "HyperUnique({:.2})", hll.estimate()),
            Self::Histogram(histogram) => write!(
                f,
                "Histogram(count={}, bins={})",
                histogram.count(),
                histogram.num_bins()
            ),
            Self::CountMin(sketch) => write!(
                f,
                "CountMin({}x{}, total={})",
                sketch.depth(),
                sketch.width(),
                sketch.total()
            ),
            Self::Range(range) => match range.is_empty() {
                true => write!(f, "Range(empty)"),
                false => write!(f, "Range({}, {})", range.min, range.max),
            },
            Self::LongPair(pair) => write!(f, "Pair({}, {:?})", pair.timestamp, pair.value),
            Self::DoublePair(pair) => write!(f, "Pair({}, {:?})", pair.timestamp, pair.value),
        }
    }
}

impl Value {
    /// Returns true if the value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type of the value, `None` for null
    pub fn value_type(&self) -> Option<ValueType> {
        Some(match self {
            Self::Null => return None,
            Self::Long(_) => ValueType::Long,
            Self::Float(_) => ValueType::Float,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
            Self::Decimal(_) => ValueType::Decimal,
            Self::Bytes(_) => ValueType::Bytes,
            Self::Array(_) => ValueType::Array,
            Self::Complex(complex) => ValueType::Complex(complex.complex_type()),
        })
    }

    /// Coerce the value to long. Returns `Ok(None)` for null and empty strings.
    ///
    /// Floating numbers are truncated, numeric strings are parsed. Single element arrays
    /// are unwrapped
    pub fn to_long(&self) -> Result<Option<i64>> {
        match self {
            Self::Null => Ok(None),
            Self::Long(v) => Ok(Some(*v)),
            Self::Float(v) => float_to_long(*v as f64).map(Some),
            Self::Double(v) => float_to_long(*v).map(Some),
            Self::Decimal(v) => Ok(Some(
                i64::try_from(v.trunc()).map_err(|_| coerce_error(self, ValueType::Long))?,
            )),
            Self::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                match s.parse::<i64>() {
                    Ok(v) => Ok(Some(v)),
                    Err(_) => {
                        let v = s
                            .parse::<f64>()
                            .map_err(|_| coerce_error(self, ValueType::Long))?;
                        float_to_long(v).map(Some)
                    }
                }
            }
            Self::Array(values) if values.len() == 1 => values[0].to_long(),
            Self::Array(values) if values.is_empty() => Ok(None),
            _ => Err(coerce_error(self, ValueType::Long)),
        }
    }

    /// Coerce the value to double. Returns `Ok(None)` for null and empty strings.
    ///
    /// Strings `"NaN"`, `"Infinity"` and `"-Infinity"` are accepted
    pub fn to_double(&self) -> Result<Option<f64>> {
        match self {
            Self::Null => Ok(None),
            Self::Long(v) => Ok(Some(*v as f64)),
            Self::Float(v) => Ok(Some(*v as f64)),
            Self::Double(v) => Ok(Some(*v)),
            Self::Decimal(v) => Ok(Some(
                num_traits::ToPrimitive::to_f64(v)
                    .ok_or_else(|| coerce_error(self, ValueType::Double))?,
            )),
            Self::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                s.parse::<f64>()
                    .map(Some)
                    .map_err(|_| coerce_error(self, ValueType::Double))
            }
            Self::Array(values) if values.len() == 1 => values[0].to_double(),
            Self::Array(values) if values.is_empty() => Ok(None),
            _ => Err(coerce_error(self, ValueType::Double)),
        }
    }

    /// Coerce the value to float, see [`Self::to_double`]
    #[inline]
    pub fn to_float(&self) -> Result<Option<f32>> {
        self.to_double().map(|v| v.map(|v| v as f32))
    }

    /// Coerce the value to decimal. Floating numbers must be finite
    pub fn to_decimal(&self) -> Result<Option<Decimal>> {
        match self {
            Self::Null => Ok(None),
            Self::Long(v) => Ok(Some(Decimal::from(*v))),
            Self::Float(v) => finite_to_decimal(*v as f64).map(Some),
            Self::Double(v) => finite_to_decimal(*v).map(Some),
            Self::Decimal(v) => Ok(Some(*v)),
            Self::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .map(Some)
                    .map_err(|_| coerce_error(self, ValueType::Decimal))
            }
            Self::Array(values) if values.len() == 1 => values[0].to_decimal(),
            Self::Array(values) if values.is_empty() => Ok(None),
            _ => Err(coerce_error(self, ValueType::Decimal)),
        }
    }

    /// Lossy numeric view used by the `get_long`/`get_double` accessors of the
    /// aggregators: null and non-numeric values are `0`, sketches return their estimate
    pub fn lossy_double(&self) -> f64 {
        match self {
            Self::Complex(ComplexValue::HyperUnique(hll)) => hll.estimate(),
            Self::Complex(ComplexValue::Histogram(histogram)) => histogram.count() as f64,
            Self::Complex(ComplexValue::CountMin(sketch)) => sketch.total() as f64,
            Self::Complex(ComplexValue::Range(range)) => range.width().unwrap_or(0.0),
            Self::Complex(ComplexValue::LongPair(pair)) => pair.value.unwrap_or(0) as f64,
            Self::Complex(ComplexValue::DoublePair(pair)) => pair.value.unwrap_or(0.0),
            _ => self.to_double().ok().flatten().unwrap_or(0.0),
        }
    }

    /// Lossy long view, see [`Self::lossy_double`]
    pub fn lossy_long(&self) -> i64 {
        match self {
            Self::Long(v) => *v,
            Self::Complex(ComplexValue::LongPair(pair)) => pair.value.unwrap_or(0),
            _ => {
                let v = self.lossy_double();
                if v.is_finite() { v as i64 } else { 0 }
            }
        }
    }

    /// Values of a dimension. Scalars become a single element, arrays are flattened and
    /// null elements are kept as `None`
    pub fn dimension_values(&self) -> Vec<Option<String>> {
        match self {
            Self::Null => vec![],
            Self::Array(values) => values
                .iter()
                .map(|value| (!value.is_null()).then(|| value.to_string()))
                .collect(),
            value => vec![Some(value.to_string())],
        }
    }
}

#[inline]
fn coerce_error(value: &Value, target: ValueType) -> ValueError {
    ValueError::Coerce {
        value: value.to_string(),
        target,
    }
}

#[inline]
fn float_to_long(v: f64) -> Result<i64> {
    ensure!(
        v.is_finite(),
        NonFiniteSnafu {
            value: v,
            target: ValueType::Long
        }
    );
    Ok(v as i64)
}

#[inline]
fn finite_to_decimal(v: f64) -> Result<Decimal> {
    ensure!(
        v.is_finite(),
        NonFiniteSnafu {
            value: v,
            target: ValueType::Decimal
        }
    );
    Decimal::from_f64_retain(v).ok_or(ValueError::Coerce {
        value: v.to_string(),
        target: ValueType::Decimal,
    })
}

/// Format the floating number the way the wire/json format does: `NaN`, `Infinity` and
/// `-Infinity` for the non-finite numbers
pub(crate) fn format_double(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{:?}", v)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Long(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", format_double(*v as f64)),
            Self::Double(v) => write!(f, "{}", format_double(*v)),
            Self::String(v) => write!(f, "{}", v),
            Self::Decimal(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "Bytes({})", v.len()),
            Self::Array(values) => {
                write!(f, "[")?;
                let mut iter = values.iter();
                if let Some(value) = iter.next() {
                    write!(f, "{}", value)?;
                }
                iter.try_for_each(|value| write!(f, ", {}", value))?;
                write!(f, "]")
            }
            Self::Complex(complex) => write!(f, "{}", complex),
        }
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<f32> for Value {
    #[inline]
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Decimal> for Value {
    #[inline]
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    #[inline]
    fn from(values: Vec<T>) -> Self {
        Self::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Json representation: non-finite numbers are strings, decimals are strings, bytes and
/// complex values are base64 encoded wire bytes
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Long(v) => serializer.serialize_i64(*v),
            Self::Float(v) if v.is_finite() => serializer.serialize_f32(*v),
            Self::Double(v) if v.is_finite() => serializer.serialize_f64(*v),
            Self::Float(v) => serializer.serialize_str(&format_double(*v as f64)),
            Self::Double(v) => serializer.serialize_str(&format_double(*v)),
            Self::String(v) => serializer.serialize_str(v),
            Self::Decimal(v) => serializer.serialize_str(&v.to_string()),
            Self::Bytes(v) => serializer.serialize_str(&crate::wire::base64_encode(v)),
            Self::Array(values) => serializer.collect_seq(values),
            Self::Complex(_) => {
                let bytes = crate::wire::encode(self).map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&crate::wire::base64_encode(&bytes))
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "null, number, string or array")
    }

    fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: serde::de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Long(v as i64))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Long(v))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Double(v as f64), Value::Long))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Double(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(value) = seq.next_element::<Value>()? {
            values.push(value);
        }
        Ok(Value::Array(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_long() {
        assert_eq!(Value::from("42").to_long().unwrap(), Some(42));
        assert_eq!(Value::from(" 4.9 ").to_long().unwrap(), Some(4));
        assert_eq!(Value::from("").to_long().unwrap(), None);
        assert_eq!(Value::Null.to_long().unwrap(), None);
        assert_eq!(Value::from(vec![7_i64]).to_long().unwrap(), Some(7));
        assert!(Value::from("NaN").to_long().is_err());
        assert!(Value::from("abc").to_long().is_err());
        assert!(Value::from(vec![1_i64, 2]).to_long().is_err());
    }

    #[test]
    fn test_to_double_accepts_non_finite_strings() {
        assert!(Value::from("NaN").to_double().unwrap().unwrap().is_nan());
        assert_eq!(
            Value::from("Infinity").to_double().unwrap(),
            Some(f64::INFINITY)
        );
        assert_eq!(
            Value::from("-Infinity").to_double().unwrap(),
            Some(f64::NEG_INFINITY)
        );
        assert_eq!(Value::Long(3).to_double().unwrap(), Some(3.0));
    }

    #[test]
    fn test_to_decimal() {
        assert_eq!(
            Value::from("1.25").to_decimal().unwrap(),
            Some(Decimal::new(125, 2))
        );
        assert_eq!(
            Value::from("1.5e2").to_decimal().unwrap(),
            Some(Decimal::from(150))
        );
        assert!(Value::Double(f64::NAN).to_decimal().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let value = Value::Array(vec![
            Value::Long(1),
            Value::Double(f64::INFINITY),
            Value::from("a"),
            Value::Null,
        ]);
        let json = serde_json::to_string(&value).unwrap();
        expect_test::expect![[r#"[1,"Infinity","a",null]"#]].assert_eq(&json);

        let back: Value = serde_json::from_str(&json).unwrap();
        // Non-finite numbers come back as strings, factories normalize them
        assert_eq!(
            back,
            Value::Array(vec![
                Value::Long(1),
                Value::from("Infinity"),
                Value::from("a"),
                Value::Null
            ])
        );
    }

    #[test]
    fn test_dimension_values() {
        assert_eq!(Value::Null.dimension_values(), Vec::<Option<String>>::new());
        assert_eq!(
            Value::from(vec!["b", "a"]).dimension_values(),
            vec![Some("b".to_string()), Some("a".to_string())]
        );
        assert_eq!(Value::Long(3).dimension_values(), vec![Some("3".to_string())]);
    }
}
