//! Dimensions of the index: the discovered order, the string dictionaries and the
//! encoded group keys

use std::hash::BuildHasher;

use snafu::ResultExt;

use super::schema::{DimensionSchema, DimensionType, DimensionsSpec};
use super::{MalformedDimensionSnafu, Result};
use crate::common::types::HashValue;
use crate::common::utils::hash::{BUILD_HASHER_DEFAULT, HashMap, new_hash_map};
use crate::row::InputRow;
use crate::selector::ParsePolicy;
use crate::value::{Value, ValueError};

/// Encoded value of one dimension in the group key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DimKey {
    Null,
    /// Dictionary ids of the values, multi-value dimensions keep their order
    Strings(Box<[Option<u32>]>),
    Long(i64),
    /// Bits of the float
    Float(u32),
    /// Bits of the double
    Double(u64),
}

/// Group key: the bucket timestamp and the encoded dimensions. Trailing nulls are
/// trimmed, rows added before a dimension is discovered have the same key with the
/// rows without it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey {
    pub(crate) timestamp: i64,
    pub(crate) dims: Box<[DimKey]>,
}

impl GroupKey {
    /// Stable hash of the key
    pub(crate) fn hash_value(&self) -> HashValue {
        BUILD_HASHER_DEFAULT.hash_one(self)
    }

    /// Number of bytes used by the key
    pub(crate) fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .dims
                .iter()
                .map(|dim| {
                    std::mem::size_of::<DimKey>()
                        + match dim {
                            DimKey::Strings(ids) => ids.len() * std::mem::size_of::<Option<u32>>(),
                            _ => 0,
                        }
                })
                .sum::<usize>()
    }
}

/// Bidirectional mapping between the strings and their ids
#[derive(Debug)]
struct Dictionary {
    ids: HashMap<String, u32>,
    values: Vec<String>,
    /// Bytes of the strings
    size: usize,
}

impl Dictionary {
    fn new() -> Self {
        Self {
            ids: new_hash_map(),
            values: Vec::new(),
            size: 0,
        }
    }

    fn id_or_insert(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.size += 2 * value.len() + std::mem::size_of::<String>();
        self.values.push(value.to_string());
        self.ids.insert(value.to_string(), id);
        id
    }

    fn value(&self, id: u32) -> Option<&str> {
        self.values.get(id as usize).map(String::as_str)
    }
}

#[derive(Debug)]
struct Dimension {
    schema: DimensionSchema,
    dictionary: Dictionary,
}

impl Dimension {
    fn new(schema: DimensionSchema) -> Self {
        Self {
            schema,
            dictionary: Dictionary::new(),
        }
    }

    fn decode(&self, key: &DimKey) -> Value {
        match key {
            DimKey::Null => Value::Null,
            DimKey::Strings(ids) => {
                let string = |id: &Option<u32>| {
                    id.and_then(|id| self.dictionary.value(id))
                        .map_or(Value::Null, |v| Value::String(v.to_string()))
                };
                match &ids[..] {
                    [id] => string(id),
                    ids => Value::Array(ids.iter().map(string).collect()),
                }
            }
            DimKey::Long(v) => Value::Long(*v),
            DimKey::Float(bits) => Value::Float(f32::from_bits(*bits)),
            DimKey::Double(bits) => Value::Double(f64::from_bits(*bits)),
        }
    }
}

/// Encode the value of the dimension, the strings are interned in the dictionary
fn encode(
    schema: &DimensionSchema,
    dictionary: &mut Dictionary,
    value: &Value,
    policy: ParsePolicy,
) -> Result<DimKey> {
    let parsed = |result: std::result::Result<Option<DimKey>, ValueError>| -> Result<DimKey> {
        match result {
            Ok(key) => Ok(key.unwrap_or(DimKey::Null)),
            Err(e) if policy == ParsePolicy::Lenient => {
                tracing::trace!(
                    "Treat the malformed value of dimension `{}` as null: {e}",
                    schema.name
                );
                Ok(DimKey::Null)
            }
            Err(e) => Err(e).context(MalformedDimensionSnafu {
                dimension: &schema.name,
            }),
        }
    };
    match schema.value_type {
        DimensionType::String => Ok(match value.dimension_values().as_slice() {
            [] | [None] => DimKey::Null,
            values => DimKey::Strings(
                values
                    .iter()
                    .map(|v| v.as_deref().map(|v| dictionary.id_or_insert(v)))
                    .collect(),
            ),
        }),
        DimensionType::Long => parsed(value.to_long().map(|v| v.map(DimKey::Long))),
        DimensionType::Float => {
            parsed(value.to_float().map(|v| v.map(|v| DimKey::Float(v.to_bits()))))
        }
        DimensionType::Double => {
            parsed(value.to_double().map(|v| v.map(|v| DimKey::Double(v.to_bits()))))
        }
    }
}

/// Dimensions known by the index, in their order
#[derive(Debug)]
pub(crate) struct Dimensions {
    spec: DimensionsSpec,
    dimensions: Vec<Dimension>,
    positions: HashMap<String, usize>,
}

impl Dimensions {
    /// Create the dimensions, the declared dimensions come first, then the seeded
    /// order if the dimensions are discovered
    pub(crate) fn new(spec: DimensionsSpec, seed: &[String]) -> Self {
        let mut this = Self {
            dimensions: Vec::new(),
            positions: new_hash_map(),
            spec,
        };
        if this.spec.is_discovery() {
            for name in seed {
                if this.spec.is_discoverable(name) {
                    this.push(DimensionSchema::string(name.as_str()));
                }
            }
        } else {
            this.spec
                .dimensions
                .clone()
                .into_iter()
                .for_each(|schema| this.push(schema));
        }
        this
    }

    fn push(&mut self, schema: DimensionSchema) {
        if self.positions.contains_key(&schema.name) {
            return;
        }
        self.positions.insert(schema.name.clone(), self.dimensions.len());
        self.dimensions.push(Dimension::new(schema));
    }

    /// Discover the new dimensions of the row. Returns the number of new dimensions
    pub(crate) fn discover(&mut self, row: &InputRow) -> usize {
        if !self.spec.is_discovery() {
            return 0;
        }
        let before = self.dimensions.len();
        for name in &row.dimensions {
            if !self.positions.contains_key(name) && self.spec.is_discoverable(name) {
                self.push(DimensionSchema::string(name.as_str()));
            }
        }
        self.dimensions.len() - before
    }

    /// Forget the dimensions discovered after the first `len` dimensions
    pub(crate) fn truncate(&mut self, len: usize) {
        for dimension in self.dimensions.drain(len.min(self.dimensions.len())..) {
            self.positions.remove(&dimension.schema.name);
        }
    }

    /// Number of the dimensions
    pub(crate) fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// Encode the dimensions of the row. All of the dimensions of the row should be
    /// discovered
    pub(crate) fn encode(&mut self, row: &InputRow, policy: ParsePolicy) -> Result<Box<[DimKey]>> {
        let mut dims = Vec::with_capacity(self.dimensions.len());
        for Dimension { schema, dictionary } in &mut self.dimensions {
            let key =
                row.with_raw(&schema.name, |value| encode(schema, dictionary, value, policy))?;
            dims.push(key);
        }
        while dims.last() == Some(&DimKey::Null) {
            dims.pop();
        }
        Ok(dims.into_boxed_slice())
    }

    /// Decode the key into the named values of all of the dimensions
    pub(crate) fn decode(&self, dims: &[DimKey]) -> Vec<(String, Value)> {
        self.dimensions
            .iter()
            .enumerate()
            .map(|(i, dimension)| {
                let value = dims.get(i).map_or(Value::Null, |key| dimension.decode(key));
                (dimension.schema.name.clone(), value)
            })
            .collect()
    }

    /// Names of the dimensions in order
    pub(crate) fn names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|dimension| dimension.schema.name.clone())
            .collect()
    }

    /// Bytes used by the dictionaries
    pub(crate) fn estimated_size(&self) -> usize {
        self.dimensions
            .iter()
            .map(|dimension| dimension.dictionary.size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::schema::DimensionType;

    fn row() -> InputRow {
        InputRow::new(0)
            .with_dimension("page", "a")
            .with_dimension("tags", vec!["x", "y"])
            .with_dimension("bytes", "12")
    }

    #[test]
    fn test_discover_and_trim() {
        let mut dimensions = Dimensions::new(
            DimensionsSpec {
                dimensions: vec![],
                exclusions: vec!["bytes".to_string()],
            },
            &[],
        );
        let first = InputRow::new(0).with_dimension("page", "a");
        assert_eq!(dimensions.discover(&first), 1);
        let before = dimensions.encode(&first, ParsePolicy::Strict).unwrap();

        assert_eq!(dimensions.discover(&row()), 1);
        assert_eq!(dimensions.names(), vec!["page", "tags"]);
        // Rows without the new dimension keep their key
        assert_eq!(dimensions.encode(&first, ParsePolicy::Strict).unwrap(), before);

        let key = dimensions.encode(&row(), ParsePolicy::Strict).unwrap();
        assert_eq!(
            dimensions.decode(&key),
            vec![
                ("page".to_string(), Value::from("a")),
                ("tags".to_string(), Value::from(vec!["x", "y"])),
            ]
        );
    }

    #[test]
    fn test_typed_dimensions() {
        let mut dimensions = Dimensions::new(
            DimensionsSpec {
                dimensions: vec![DimensionSchema {
                    name: "bytes".to_string(),
                    value_type: DimensionType::Long,
                }],
                exclusions: vec![],
            },
            &["ignored".to_string()],
        );
        assert_eq!(dimensions.discover(&row()), 0);
        let key = dimensions.encode(&row(), ParsePolicy::Strict).unwrap();
        assert_eq!(dimensions.decode(&key), vec![("bytes".to_string(), Value::Long(12))]);

        let malformed = InputRow::new(0).with_dimension("bytes", "many");
        expect_test::expect!["Malformed value of the dimension `bytes`"].assert_eq(
            &dimensions
                .encode(&malformed, ParsePolicy::Strict)
                .unwrap_err()
                .to_string(),
        );
        let key = dimensions.encode(&malformed, ParsePolicy::Lenient).unwrap();
        assert!(key.is_empty());
    }
}
