#[cfg(feature = "std-hash")]
pub mod map {
    pub use std::collections::HashMap;
}

#[cfg(not(feature = "std-hash"))]
pub mod map {
    pub use rustc_hash::FxHashMap as HashMap;
}

/// Builds an empty map regardless of which hasher backs [`map::HashMap`].
#[inline]
pub(crate) fn new_map<K, V>() -> map::HashMap<K, V> {
    map::HashMap::default()
}
