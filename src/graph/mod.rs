//! Sparse graphs over row and column maps.

pub mod crs_graph;
pub mod overlap;

pub use crs_graph::{ColumnOrdering, CrsGraph, FillOptions};
pub use overlap::{OverlapGraph, overlap_graph};
