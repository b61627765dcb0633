//! Zero-sized hash builder for the per-scope event listener tables.
//!
//! Event names are short strings chosen by the application, so HashDoS
//! resistance buys nothing here. A fixed-seed foldhash keeps each table free of
//! per-instance hasher state.

use std::collections::HashMap;
use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// Map keyed by event name using [`FastHashBuilder`].
pub(crate) type FastHashMap<K, V> = HashMap<K, V, FastHashBuilder>;

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// # Properties
/// - Zero-sized (`size_of::<FastHashBuilder>()` == 0)
/// - Deterministic across instances
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e37_79b9_7f4a_7c15).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_hash_builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn event_names_hash_identically_across_tables() {
        let a = FastHashBuilder.hash_one("someEvent");
        let b = FastHashBuilder.hash_one("someEvent");
        assert_eq!(a, b);
        assert_ne!(a, FastHashBuilder.hash_one("otherEvent"));
    }

    #[test]
    fn table_round_trips_entries() {
        let mut table: FastHashMap<String, usize> = FastHashMap::default();
        table.insert("click".to_owned(), 1);
        table.entry("click".to_owned()).and_modify(|n| *n += 1);
        assert_eq!(table.get("click"), Some(&2));
    }
}
