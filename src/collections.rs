//! Hash collections used across the engine.
//!
//! With the `gxhash` feature (default) the maps hash with gxhash, which needs
//! AES-NI/SSE2. Without it they fall back to the std SipHash collections so
//! the crate still builds on hosts lacking those intrinsics.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashMapExt, HashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Constructor shim so call sites can write `HashMap::new()` under either backend
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates an empty map
    fn new() -> Self;
    /// Creates an empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        Default::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// Constructor shim for sets, see [`HashMapExt`]
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates an empty set
    fn new() -> Self;
    /// Creates an empty set with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        Default::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashSet::with_capacity_and_hasher(capacity, Default::default())
    }
}
