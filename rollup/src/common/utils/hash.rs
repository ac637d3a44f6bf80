//! Utils for hash

/// Default hash builder
pub type BuildHasherDefault = ahash::RandomState;

/// Constant build hasher default. Seeds are fixed such that the group table has the same
/// layout in every run, which keeps the insertion-ordered output reproducible
pub const BUILD_HASHER_DEFAULT: BuildHasherDefault = BuildHasherDefault::with_seeds(9, 7, 9, 8);

/// Hash map used across the crate
pub type HashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault>;

/// Create an empty [`HashMap`] with the default hash builder
#[inline]
pub fn new_hash_map<K, V>() -> HashMap<K, V> {
    HashMap::with_hasher(BUILD_HASHER_DEFAULT)
}
