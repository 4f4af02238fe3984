#![cfg_attr(docsrs, feature(doc_cfg))]
//! # sparse-halo
//!
//! sparse-halo distributes index spaces, sparse graphs, and sparse matrices
//! across the ranks of a parallel program and moves data between different
//! distributions. It is the data-distribution layer underneath iterative
//! solvers and preconditioners.
//!
//! ## Features
//! - [`IndexMap`](map::IndexMap): which rank owns which global indices, with
//!   analytic lookups for contiguous maps and a distributed directory otherwise
//! - [`Distributor`](distributor::Distributor): the send/receive plan of one
//!   exchange pattern, with reverse plans and variable-length payloads
//! - [`Import`](distributor::Import) / [`Export`](distributor::Export): transfer
//!   plans between two maps with configurable [`CombineMode`](distributor::CombineMode)
//! - [`CrsGraph`](graph::CrsGraph) with fill-complete, column-map construction,
//!   and overlap (ghost-layer) graphs
//! - [`CrsMatrix`](linalg::CrsMatrix) and [`MultiVector`](linalg::MultiVector)
//!   with halo-exchanging apply, transpose apply, norms, and scaling
//! - Distributed coloring and local RCM reordering
//! - Pluggable communication backends (serial, Rayon threads, MPI)
//!
//! ## Collectives
//!
//! Every operation documented as *collective* must be called by all ranks of
//! the communicator in the same order. A collective that fails on one rank
//! fails on all of them: ranks that saw no local error return
//! [`DistError::RemoteFailure`](dist_error::DistError::RemoteFailure).
//!
//! ## Determinism
//!
//! Randomized decisions (coloring priorities, random vectors) are derived from
//! seeds passed in by the caller, so runs are reproducible.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! sparse-halo = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon", "fast-hash"]
//! ```

pub mod algs;
pub mod debug_invariants;
pub mod dist_error;
pub mod distributor;
pub mod graph;
pub mod linalg;
pub mod map;

pub use debug_invariants::DebugInvariants;
pub use dist_error::DistError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::coloring::{ColoringConfig, color_graph, is_valid_coloring};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm, RayonCommConfig};
    pub use crate::algs::rcm::{Reordering, ReorderedBlock, reverse_cuthill_mckee};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::dist_error::DistError;
    pub use crate::distributor::{CombineMode, Distributor, Export, Import};
    pub use crate::graph::{ColumnOrdering, CrsGraph, FillOptions, OverlapGraph, overlap_graph};
    pub use crate::linalg::{CrsMatrix, MultiVector, Operator, RowMatrix, Scalar, TransposeMode};
    pub use crate::map::{GlobalIndex, IndexMap, LocalIndex, MapColoring};
}
