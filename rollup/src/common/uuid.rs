//! uuids in the crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! make_id {
    ($name:ident, $comment:expr) => {
        #[doc = $comment]
        #[repr(transparent)]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a random id
            #[inline]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
    };
}

make_id!(IndexId, "[`IndexId`] is the unique identifier of an incremental index");
make_id!(
    ChunkId,
    "[`ChunkId`] is the unique identifier of a persisted chunk of rows"
);
