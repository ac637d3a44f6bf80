//! Deterministic cache keys of the configurations
//!
//! A key is `[type id][field][0xFF][field]...`. Strings are utf8 and never contain the
//! `0xFF` byte, therefore two different configurations can not produce the same key.
//! Keys must be stable across processes, do not hash them with a seeded hasher

/// Separator between the fields of the key
pub const STRING_SEPARATOR: u8 = 0xFF;

/// Type ids of the filters, aggregator ids live in [`AggregatorKind`]
///
/// [`AggregatorKind`]: crate::aggregate::AggregatorKind
pub mod filter_type_id {
    #![allow(missing_docs)]
    pub const SELECTOR: u8 = 0x00;
    pub const AND: u8 = 0x01;
    pub const OR: u8 = 0x02;
    pub const NOT: u8 = 0x03;
    pub const REGEX: u8 = 0x05;
    pub const IN: u8 = 0x09;
    pub const BOUND: u8 = 0x0A;
    pub const EXPRESSION: u8 = 0x0E;
    pub const TRUE: u8 = 0x0F;
}

/// Types that have a cache key
pub trait Cacheable {
    /// Compute the cache key
    fn cache_key(&self) -> Vec<u8>;
}

/// Builder of the cache key
#[derive(Debug)]
pub struct CacheKeyBuilder {
    buf: Vec<u8>,
    num_fields: usize,
}

impl CacheKeyBuilder {
    /// Create a builder for the type
    pub fn new(type_id: u8) -> Self {
        Self {
            buf: vec![type_id],
            num_fields: 0,
        }
    }

    #[inline]
    fn separate(&mut self) {
        if self.num_fields > 0 {
            self.buf.push(STRING_SEPARATOR);
        }
        self.num_fields += 1;
    }

    /// Append a string field
    pub fn append_string(mut self, s: &str) -> Self {
        self.separate();
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Append an optional string field, `None` is an empty field
    pub fn append_optional_string(self, s: Option<&str>) -> Self {
        self.append_string(s.unwrap_or_default())
    }

    /// Append the strings in the given order. The length prefix keeps `["a", "b"]`
    /// and `["a\u{0}b"]` apart
    pub fn append_strings<'a>(mut self, strings: impl IntoIterator<Item = &'a str>) -> Self {
        self.separate();
        let strings: Vec<&str> = strings.into_iter().collect();
        self.buf
            .extend_from_slice(&(strings.len() as u32).to_be_bytes());
        strings.into_iter().for_each(|s| {
            self.buf.extend_from_slice(s.as_bytes());
            self.buf.push(STRING_SEPARATOR);
        });
        self
    }

    /// Append the strings ignoring their order
    pub fn append_strings_ignoring_order<'a>(
        self,
        strings: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut strings: Vec<&str> = strings.into_iter().collect();
        strings.sort_unstable();
        self.append_strings(strings)
    }

    /// Append a byte field
    pub fn append_u8(mut self, v: u8) -> Self {
        self.separate();
        self.buf.push(v);
        self
    }

    /// Append a boolean field
    pub fn append_bool(self, v: bool) -> Self {
        self.append_u8(v as u8)
    }

    /// Append an integer field
    pub fn append_u64(mut self, v: u64) -> Self {
        self.separate();
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a floating field
    pub fn append_f64(mut self, v: f64) -> Self {
        self.separate();
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
        self
    }

    /// Append the key of the nested cacheable, `None` is an empty field
    pub fn append_cacheable(mut self, cacheable: Option<&dyn Cacheable>) -> Self {
        match cacheable {
            Some(cacheable) => self.append_nested_key(&cacheable.cache_key()),
            None => {
                self.separate();
                self
            }
        }
    }

    /// Append the key computed by another builder
    pub fn append_nested_key(mut self, key: &[u8]) -> Self {
        self.separate();
        // Nested keys may contain the separator, length prefix them
        self.buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(key);
        self
    }

    /// Append the keys of the nested cacheables in the given order
    pub fn append_cacheables<'a>(
        mut self,
        cacheables: impl IntoIterator<Item = &'a dyn Cacheable>,
    ) -> Self {
        self.separate();
        let keys: Vec<Vec<u8>> = cacheables.into_iter().map(|c| c.cache_key()).collect();
        self.buf
            .extend_from_slice(&(keys.len() as u32).to_be_bytes());
        keys.into_iter().for_each(|key| {
            self.buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(&key);
        });
        self
    }

    /// Build the key
    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let key = CacheKeyBuilder::new(0x0C)
            .append_string("a")
            .append_string("b")
            .build();
        assert_eq!(key, vec![0x0C, b'a', 0xFF, b'b']);
    }

    #[test]
    fn test_fields_do_not_collide() {
        let lhs = CacheKeyBuilder::new(1)
            .append_string("ab")
            .append_string("")
            .build();
        let rhs = CacheKeyBuilder::new(1)
            .append_string("a")
            .append_string("b")
            .build();
        assert_ne!(lhs, rhs);

        let lhs = CacheKeyBuilder::new(1)
            .append_strings_ignoring_order(["b", "a"])
            .build();
        let rhs = CacheKeyBuilder::new(1)
            .append_strings_ignoring_order(["a", "b"])
            .build();
        assert_eq!(lhs, rhs);
    }
}
