//! Dense multivectors laid over an index map.
//!
//! Storage is column-major: column `j` occupies
//! `values[j * local_length..(j + 1) * local_length]`.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::algs::collectives::{all_reduce_slice_with, all_reduce_sum_u64};
use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::distributor::{CombineMode, Export, Import, TransferPlan};
use crate::linalg::scalar::Scalar;
use crate::map::{GlobalIndex, IndexMap, LocalIndex};

#[derive(Clone, Debug)]
pub struct MultiVector<S: Scalar> {
    map: Arc<IndexMap>,
    num_vectors: usize,
    values: Vec<S>,
}

impl<S: Scalar> MultiVector<S> {
    /// Zero-initialised.
    pub fn new(map: Arc<IndexMap>, num_vectors: usize) -> Self {
        let values = vec![S::zero(); map.num_my() * num_vectors];
        Self {
            map,
            num_vectors,
            values,
        }
    }

    /// Single zero vector.
    pub fn vector(map: Arc<IndexMap>) -> Self {
        Self::new(map, 1)
    }

    pub fn from_columns(map: Arc<IndexMap>, columns: Vec<Vec<S>>) -> Result<Self, DistError> {
        let n = map.num_my();
        let mut values = Vec::with_capacity(n * columns.len());
        for col in &columns {
            if col.len() != n {
                return Err(DistError::LocalLengthMismatch {
                    expected: n,
                    got: col.len(),
                });
            }
            values.extend_from_slice(col);
        }
        Ok(Self {
            map,
            num_vectors: columns.len(),
            values,
        })
    }

    pub fn map(&self) -> &Arc<IndexMap> {
        &self.map
    }

    pub fn num_vectors(&self) -> usize {
        self.num_vectors
    }

    pub fn local_length(&self) -> usize {
        self.map.num_my()
    }

    pub fn global_length(&self) -> u64 {
        self.map.num_global()
    }

    pub fn local_values(&self) -> &[S] {
        &self.values
    }

    pub fn local_values_mut(&mut self) -> &mut [S] {
        &mut self.values
    }

    pub fn col(&self, j: usize) -> &[S] {
        let n = self.local_length();
        &self.values[j * n..(j + 1) * n]
    }

    pub fn col_mut(&mut self, j: usize) -> &mut [S] {
        let n = self.local_length();
        &mut self.values[j * n..(j + 1) * n]
    }

    pub fn put_scalar(&mut self, v: S) {
        self.values.fill(v);
    }

    /// Uniform values in `[-1, 1]`; every rank draws from `seed + rank`.
    pub fn random(&mut self, seed: u64) {
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(self.map.rank() as u64));
        for v in &mut self.values {
            *v = S::from_f64(rng.gen_range(-1.0..=1.0));
        }
    }

    fn slot(&self, lid: LocalIndex, j: usize) -> Result<usize, DistError> {
        let n = self.local_length();
        if lid >= n {
            return Err(DistError::LocalIndexOutOfBounds { index: lid, len: n });
        }
        if j >= self.num_vectors {
            return Err(DistError::VectorCountMismatch {
                expected: self.num_vectors,
                got: j + 1,
            });
        }
        Ok(j * n + lid)
    }

    pub fn replace_local_value(&mut self, lid: LocalIndex, j: usize, v: S) -> Result<(), DistError> {
        let k = self.slot(lid, j)?;
        self.values[k] = v;
        Ok(())
    }

    pub fn sum_into_local_value(
        &mut self,
        lid: LocalIndex,
        j: usize,
        v: S,
    ) -> Result<(), DistError> {
        let k = self.slot(lid, j)?;
        self.values[k] = self.values[k] + v;
        Ok(())
    }

    pub fn replace_global_value(&mut self, gid: GlobalIndex, j: usize, v: S) -> Result<(), DistError> {
        let lid = self.map.lid(gid).ok_or(DistError::GlobalIndexNotLocal(gid))?;
        self.replace_local_value(lid, j, v)
    }

    pub fn sum_into_global_value(
        &mut self,
        gid: GlobalIndex,
        j: usize,
        v: S,
    ) -> Result<(), DistError> {
        let lid = self.map.lid(gid).ok_or(DistError::GlobalIndexNotLocal(gid))?;
        self.sum_into_local_value(lid, j, v)
    }

    // --- local algebra ---------------------------------------------------

    pub fn scale(&mut self, alpha: S) {
        for v in &mut self.values {
            *v = *v * alpha;
        }
    }

    fn check_compatible(&self, other: &MultiVector<S>) -> Result<(), DistError> {
        if self.num_vectors != other.num_vectors {
            return Err(DistError::VectorCountMismatch {
                expected: self.num_vectors,
                got: other.num_vectors,
            });
        }
        if self.local_length() != other.local_length() {
            return Err(DistError::LocalLengthMismatch {
                expected: self.local_length(),
                got: other.local_length(),
            });
        }
        Ok(())
    }

    /// `self = alpha * a + beta * self`; `beta == 0` overwrites `self`.
    pub fn update(&mut self, alpha: S, a: &MultiVector<S>, beta: S) -> Result<(), DistError> {
        self.check_compatible(a)?;
        if beta == S::zero() {
            for (y, &x) in self.values.iter_mut().zip(&a.values) {
                *y = alpha * x;
            }
        } else {
            for (y, &x) in self.values.iter_mut().zip(&a.values) {
                *y = alpha * x + beta * *y;
            }
        }
        Ok(())
    }

    // --- reductions (collective) -----------------------------------------

    fn reduce_columns<C, F, G>(&self, comm: &C, per_entry: F, combine: G) -> Result<Vec<S>, DistError>
    where
        C: Communicator,
        F: Fn(S) -> S,
        G: Fn(S, S) -> S + Copy,
    {
        let local: Vec<S> = (0..self.num_vectors)
            .map(|j| self.col(j).iter().map(|&v| per_entry(v)).fold(S::zero(), combine))
            .collect();
        all_reduce_slice_with(comm, &local, combine)
    }

    pub fn dot<C: Communicator>(&self, other: &MultiVector<S>, comm: &C) -> Result<Vec<S>, DistError> {
        self.check_compatible(other)?;
        let local: Vec<S> = (0..self.num_vectors)
            .map(|j| {
                self.col(j)
                    .iter()
                    .zip(other.col(j))
                    .fold(S::zero(), |acc, (&a, &b)| acc + a * b)
            })
            .collect();
        all_reduce_slice_with(comm, &local, |a, b| a + b)
    }

    pub fn norm_1<C: Communicator>(&self, comm: &C) -> Result<Vec<S>, DistError> {
        self.reduce_columns(comm, |v| v.abs(), |a, b| a + b)
    }

    pub fn norm_2<C: Communicator>(&self, comm: &C) -> Result<Vec<S>, DistError> {
        Ok(self
            .reduce_columns(comm, |v| v * v, |a, b| a + b)?
            .into_iter()
            .map(|s| s.sqrt())
            .collect())
    }

    pub fn norm_inf<C: Communicator>(&self, comm: &C) -> Result<Vec<S>, DistError> {
        self.reduce_columns(comm, |v| v.abs(), |a, b| a.max(b))
    }

    pub fn mean_value<C: Communicator>(&self, comm: &C) -> Result<Vec<S>, DistError> {
        let sums = self.reduce_columns(comm, |v| v, |a, b| a + b)?;
        let n = all_reduce_sum_u64(comm, self.local_length() as u64)?;
        let n = S::from_f64(n.max(1) as f64);
        Ok(sums.into_iter().map(|s| s / n).collect())
    }

    // --- transfers (collective) ------------------------------------------

    /// `self` (over the importer's target) receives `source` (over its source).
    pub fn import<C: Communicator>(
        &mut self,
        source: &MultiVector<S>,
        importer: &Import,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        self.transfer_from(source, importer, mode, false, comm)
    }

    /// `self` (over the exporter's target) receives `source` (over its source).
    pub fn export<C: Communicator>(
        &mut self,
        source: &MultiVector<S>,
        exporter: &Export,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        self.transfer_from(source, exporter, mode, false, comm)
    }

    /// Importer run backwards: `source` lives on the importer's target map,
    /// `self` on its source map.
    pub fn import_reverse<C: Communicator>(
        &mut self,
        source: &MultiVector<S>,
        importer: &Import,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        self.transfer_from(source, importer, mode, true, comm)
    }

    /// Exporter run backwards: `source` lives on the exporter's target map,
    /// `self` on its source map.
    pub fn export_reverse<C: Communicator>(
        &mut self,
        source: &MultiVector<S>,
        exporter: &Export,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        self.transfer_from(source, exporter, mode, true, comm)
    }

    fn transfer_from<C: Communicator>(
        &mut self,
        source: &MultiVector<S>,
        plan: &TransferPlan,
        mode: CombineMode,
        reverse: bool,
        comm: &C,
    ) -> Result<(), DistError> {
        if self.num_vectors != source.num_vectors {
            return Err(DistError::VectorCountMismatch {
                expected: self.num_vectors,
                got: source.num_vectors,
            });
        }
        let nv = self.num_vectors;
        if nv == 1 {
            return if reverse {
                plan.reverse_transfer(&source.values, &mut self.values, 1, mode, comm)
            } else {
                plan.transfer(&source.values, &mut self.values, 1, mode, comm)
            };
        }
        // transfers move all columns of an index together
        let src = source.to_row_major();
        let mut dst = self.to_row_major();
        if reverse {
            plan.reverse_transfer(&src, &mut dst, nv, mode, comm)?;
        } else {
            plan.transfer(&src, &mut dst, nv, mode, comm)?;
        }
        self.copy_from_row_major(&dst);
        Ok(())
    }

    fn to_row_major(&self) -> Vec<S> {
        let n = self.local_length();
        let nv = self.num_vectors;
        let mut out = vec![S::zero(); n * nv];
        for j in 0..nv {
            for (i, &v) in self.col(j).iter().enumerate() {
                out[i * nv + j] = v;
            }
        }
        out
    }

    fn copy_from_row_major(&mut self, buf: &[S]) {
        let n = self.local_length();
        let nv = self.num_vectors;
        for j in 0..nv {
            let col = &mut self.values[j * n..(j + 1) * n];
            for (i, v) in col.iter_mut().enumerate() {
                *v = buf[i * nv + j];
            }
        }
    }
}
