//! Communication backends, collectives, and graph algorithms.

pub mod coloring;
pub mod collectives;
pub mod communicator;
pub mod rcm;
pub mod wire;

pub use coloring::{ColoringConfig, color_graph, is_valid_coloring};
pub use rcm::{Reordering, ReorderedBlock, bandwidth, reverse_cuthill_mckee};
