//! Distributed dense multivectors and sparse matrices.

pub mod crs_matrix;
pub mod multivector;
pub mod operator;
pub mod scalar;

pub use crs_matrix::CrsMatrix;
pub use multivector::MultiVector;
pub use operator::{Operator, RowMatrix, TransposeMode};
pub use scalar::Scalar;
