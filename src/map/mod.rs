//! Index maps: which rank owns which global indices.

pub mod directory;
pub mod index_map;
pub mod map_coloring;

pub use directory::Directory;
pub use index_map::{GlobalIndex, IndexMap, LocalIndex};
pub use map_coloring::{Color, MapColoring};

#[cfg(feature = "fast-hash")]
pub type FastMap<K, V> = ahash::AHashMap<K, V>;

#[cfg(not(feature = "fast-hash"))]
pub type FastMap<K, V> = hashbrown::HashMap<K, V>;
