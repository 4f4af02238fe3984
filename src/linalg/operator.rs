//! Operator and row-matrix abstractions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::linalg::multivector::MultiVector;
use crate::linalg::scalar::Scalar;
use crate::map::{IndexMap, LocalIndex};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransposeMode {
    #[default]
    NoTranspose,
    Transpose,
}

/// A linear map `y = alpha * op(A) x + beta * y` between distributed vectors.
pub trait Operator<S: Scalar> {
    fn domain_map(&self) -> Result<&Arc<IndexMap>, DistError>;
    fn range_map(&self) -> Result<&Arc<IndexMap>, DistError>;

    /// Collective. With `beta == 0` the previous contents of `y` are ignored.
    fn apply<C: Communicator>(
        &self,
        x: &MultiVector<S>,
        y: &mut MultiVector<S>,
        mode: TransposeMode,
        alpha: S,
        beta: S,
        comm: &C,
    ) -> Result<(), DistError>;
}

/// Row access to a distributed sparse matrix.
pub trait RowMatrix<S: Scalar>: Operator<S> {
    fn row_map(&self) -> &Arc<IndexMap>;
    fn col_map(&self) -> Result<&Arc<IndexMap>, DistError>;
    fn num_my_rows(&self) -> usize;
    fn num_global_nonzeros(&self) -> u64;
    fn max_num_entries(&self) -> usize;
    /// Local column indices and values of a local row.
    fn extract_my_row_copy(&self, lrow: LocalIndex) -> Result<(Vec<LocalIndex>, Vec<S>), DistError>;
    fn extract_diagonal_copy(&self) -> Result<MultiVector<S>, DistError>;
    fn norm_inf<C: Communicator>(&self, comm: &C) -> Result<S, DistError>;
    fn norm_one<C: Communicator>(&self, comm: &C) -> Result<S, DistError>;
}
