//! DistError: unified error type for sparse-halo public APIs.
//!
//! Every fallible operation in the crate (map construction, plan creation,
//! transfers, fill-complete, apply) returns `Result<_, DistError>` instead of
//! panicking.

use thiserror::Error;

/// Unified error type for sparse-halo operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistError {
    /// A rank outside `0..size` was named as a peer.
    #[error("invalid rank {rank} (communicator size {size})")]
    InvalidRank { rank: usize, size: usize },
    /// A global index is not owned by any rank of the map it was looked up in.
    #[error("global index {0} is not owned by any rank")]
    UnknownGlobalIndex(u64),
    /// A global index is not present on the calling rank.
    #[error("global index {0} is not local to this rank")]
    GlobalIndexNotLocal(u64),
    /// A local index is outside `0..len`.
    #[error("local index {index} out of bounds (len {len})")]
    LocalIndexOutOfBounds { index: usize, len: usize },
    /// The same global index was listed twice on one rank.
    #[error("global index {0} listed more than once on this rank")]
    DuplicateGlobalIndex(u64),
    /// A global index lies below the map's index base.
    #[error("global index {gid} is below the index base {index_base}")]
    BelowIndexBase { gid: u64, index_base: u64 },
    /// A user-supplied global count disagrees with the sum of local counts.
    #[error("global element count mismatch: expected {expected}, got {got}")]
    GlobalCountMismatch { expected: u64, got: u64 },
    /// Two maps were required to be compatible but are not.
    #[error("incompatible maps: {0}")]
    IncompatibleMaps(String),
    /// A column index is not part of the fixed column map.
    #[error("column {0} is not in the column map")]
    ColumnNotInColMap(u64),
    /// Local indices were used before a column map exists.
    #[error("operation requires a column map")]
    MissingColumnMap,
    /// The structure is frozen; no more insertions are allowed.
    #[error("operation not allowed after fill-complete")]
    AlreadyFillComplete,
    /// The structure must be fill-complete for this operation.
    #[error("operation requires fill-complete")]
    NotFillComplete,
    /// An entry was addressed that is not part of a static sparsity pattern.
    #[error("entry ({row}, {col}) is not in the sparsity pattern")]
    EntryNotInPattern { row: u64, col: u64 },
    /// Multivector column counts disagree.
    #[error("number of vectors mismatch: expected {expected}, got {got}")]
    VectorCountMismatch { expected: usize, got: usize },
    /// Local lengths disagree with the map they were laid over.
    #[error("local length mismatch: expected {expected}, got {got}")]
    LocalLengthMismatch { expected: usize, got: usize },
    /// A send or receive with a neighbour failed.
    #[error("communication error with rank {neighbor}: {message}")]
    CommError { neighbor: usize, message: String },
    /// A received buffer did not have the expected byte length.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Another rank failed inside a collective operation.
    #[error("collective operation failed on rank {rank}")]
    RemoteFailure { rank: usize },
    /// A permutation did not cover `0..n` exactly once.
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),
    /// Distributed coloring did not converge.
    #[error("coloring did not converge after {rounds} rounds")]
    ColoringIncomplete { rounds: usize },
    /// A structural precondition does not hold.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}
