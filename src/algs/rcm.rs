//! Reverse Cuthill–McKee reordering of the local diagonal block.
//!
//! Only couplings between locally owned rows are considered: a column takes
//! part when its global index is also a local row. The block is symmetrized
//! before ordering, so unsymmetric patterns are handled as `A + A^T`.
//!
//! Each connected component is started from a pseudo-peripheral vertex
//! (George–Liu: repeated BFS from a minimum-degree vertex of the last level
//! until the eccentricity stops growing). Frontiers are ordered by
//! `(parent label, degree, vertex)` and the final labels are reversed.

use std::sync::Arc;

use crate::dist_error::DistError;
use crate::graph::CrsGraph;
use crate::linalg::{CrsMatrix, MultiVector, Scalar};
use crate::map::LocalIndex;

/// A permutation of the local rows: `perm[new] = old`, `inv[old] = new`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reordering {
    perm: Vec<LocalIndex>,
    inv: Vec<LocalIndex>,
}

impl Reordering {
    pub fn identity(n: usize) -> Self {
        Self {
            perm: (0..n).collect(),
            inv: (0..n).collect(),
        }
    }

    /// From a new-to-old list; fails unless it is a permutation of `0..n`.
    pub fn from_perm(perm: Vec<LocalIndex>) -> Result<Self, DistError> {
        let n = perm.len();
        let mut inv = vec![usize::MAX; n];
        for (new, &old) in perm.iter().enumerate() {
            if old >= n {
                return Err(DistError::InvalidPermutation(format!(
                    "index {old} out of range for length {n}"
                )));
            }
            if inv[old] != usize::MAX {
                return Err(DistError::InvalidPermutation(format!(
                    "index {old} appears twice"
                )));
            }
            inv[old] = new;
        }
        Ok(Self { perm, inv })
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// New-to-old.
    pub fn perm(&self) -> &[LocalIndex] {
        &self.perm
    }

    /// Old-to-new.
    pub fn inv(&self) -> &[LocalIndex] {
        &self.inv
    }

    /// `out[new] = v[old]`.
    pub fn permute_slice<T: Copy>(&self, v: &[T]) -> Result<Vec<T>, DistError> {
        self.check_len(v.len())?;
        Ok(self.perm.iter().map(|&old| v[old]).collect())
    }

    /// Inverse of [`permute_slice`](Self::permute_slice).
    pub fn unpermute_slice<T: Copy>(&self, v: &[T]) -> Result<Vec<T>, DistError> {
        self.check_len(v.len())?;
        Ok(self.inv.iter().map(|&new| v[new]).collect())
    }

    /// Each column of `x` permuted into the new local order. The result keeps
    /// `x`'s map; only the local storage order changes.
    pub fn permute_vector<S: Scalar>(&self, x: &MultiVector<S>) -> Result<MultiVector<S>, DistError> {
        let columns = (0..x.num_vectors())
            .map(|j| self.permute_slice(x.col(j)))
            .collect::<Result<Vec<_>, _>>()?;
        MultiVector::from_columns(Arc::clone(x.map()), columns)
    }

    /// Inverse of [`permute_vector`](Self::permute_vector).
    pub fn unpermute_vector<S: Scalar>(
        &self,
        x: &MultiVector<S>,
    ) -> Result<MultiVector<S>, DistError> {
        let columns = (0..x.num_vectors())
            .map(|j| self.unpermute_slice(x.col(j)))
            .collect::<Result<Vec<_>, _>>()?;
        MultiVector::from_columns(Arc::clone(x.map()), columns)
    }

    fn check_len(&self, len: usize) -> Result<(), DistError> {
        if len != self.perm.len() {
            return Err(DistError::LocalLengthMismatch {
                expected: self.perm.len(),
                got: len,
            });
        }
        Ok(())
    }
}

/// Column position of every local entry inside the diagonal block, `None`
/// for entries that couple to a row owned elsewhere.
fn block_columns(graph: &CrsGraph) -> Result<Vec<Option<LocalIndex>>, DistError> {
    let (_, col_ind) = graph.local_csr()?;
    let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
    let row_map = graph.row_map();
    Ok(col_ind
        .iter()
        .map(|&c| row_map.lid(col_map.my_gids()[c]))
        .collect())
}

/// Symmetrized adjacency of the diagonal block, self loops removed.
fn block_adjacency(graph: &CrsGraph) -> Result<Vec<Vec<usize>>, DistError> {
    let (row_ptr, _) = graph.local_csr()?;
    let cols = block_columns(graph)?;
    let n = graph.num_my_rows();
    let mut adj = vec![Vec::new(); n];
    for i in 0..n {
        for j in cols[row_ptr[i]..row_ptr[i + 1]].iter().flatten().copied() {
            if i != j {
                adj[i].push(j);
                adj[j].push(i);
            }
        }
    }
    for a in &mut adj {
        a.sort_unstable();
        a.dedup();
    }
    Ok(adj)
}

/// BFS level structure of the component containing `root`.
fn level_structure(adj: &[Vec<usize>], root: usize, seen: &mut [bool]) -> Vec<Vec<usize>> {
    let mut touched = vec![root];
    seen[root] = true;
    let mut levels = vec![vec![root]];
    loop {
        let mut next = Vec::new();
        for &u in levels.last().map(Vec::as_slice).unwrap_or(&[]) {
            for &v in &adj[u] {
                if !seen[v] {
                    seen[v] = true;
                    touched.push(v);
                    next.push(v);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        levels.push(next);
    }
    for v in touched {
        seen[v] = false;
    }
    levels
}

fn pseudo_peripheral_root(adj: &[Vec<usize>], start: usize, seen: &mut [bool]) -> usize {
    let mut root = start;
    let mut depth = 0;
    loop {
        let levels = level_structure(adj, root, seen);
        let Some(last) = levels.last() else {
            return root;
        };
        let candidate = last
            .iter()
            .copied()
            .min_by_key(|&v| (adj[v].len(), v))
            .unwrap_or(root);
        if levels.len() <= depth {
            return root;
        }
        depth = levels.len();
        root = candidate;
    }
}

fn rcm_order(adj: &[Vec<usize>]) -> Vec<usize> {
    let n = adj.len();
    let mut label = vec![usize::MAX; n];
    let mut order = Vec::with_capacity(n);
    let mut seen = vec![false; n];

    // components in order of their minimum-degree vertex
    let mut starts: Vec<usize> = (0..n).collect();
    starts.sort_by_key(|&v| (adj[v].len(), v));

    for s in starts {
        if label[s] != usize::MAX {
            continue;
        }
        let root = pseudo_peripheral_root(adj, s, &mut seen);
        label[root] = order.len();
        order.push(root);
        let mut frontier = vec![root];
        while !frontier.is_empty() {
            let mut next: Vec<(usize, usize, usize)> = Vec::new();
            for &u in &frontier {
                for &v in &adj[u] {
                    if label[v] == usize::MAX {
                        label[v] = usize::MAX - 1;
                        next.push((label[u], adj[v].len(), v));
                    }
                }
            }
            next.sort_unstable();
            frontier = next.into_iter().map(|(_, _, v)| v).collect();
            for &v in &frontier {
                label[v] = order.len();
                order.push(v);
            }
        }
    }
    order.reverse();
    order
}

/// RCM ordering of the local diagonal block of a fill-complete graph. Local.
pub fn reverse_cuthill_mckee(graph: &CrsGraph) -> Result<Reordering, DistError> {
    let adj = block_adjacency(graph)?;
    let reordering = Reordering::from_perm(rcm_order(&adj))?;
    log::debug!(
        "rcm: {} local rows, block bandwidth {} -> {}",
        adj.len(),
        adjacency_bandwidth(&adj, &Reordering::identity(adj.len())),
        adjacency_bandwidth(&adj, &reordering)
    );
    Ok(reordering)
}

fn adjacency_bandwidth(adj: &[Vec<usize>], r: &Reordering) -> usize {
    adj.iter()
        .enumerate()
        .flat_map(|(i, a)| a.iter().map(move |&j| r.inv[i].abs_diff(r.inv[j])))
        .max()
        .unwrap_or(0)
}

/// Largest `|new(i) - new(j)|` over the entries of the local diagonal block.
pub fn bandwidth(graph: &CrsGraph, reordering: &Reordering) -> Result<usize, DistError> {
    let (row_ptr, _) = graph.local_csr()?;
    let cols = block_columns(graph)?;
    reordering.check_len(graph.num_my_rows())?;
    let inv = reordering.inv();
    Ok((0..graph.num_my_rows())
        .flat_map(|i| {
            cols[row_ptr[i]..row_ptr[i + 1]]
                .iter()
                .flatten()
                .map(move |&j| inv[i].abs_diff(inv[j]))
        })
        .max()
        .unwrap_or(0))
}

/// The local diagonal block of a matrix with rows and columns renumbered.
#[derive(Clone, Debug)]
pub struct ReorderedBlock<S: Scalar> {
    reordering: Reordering,
    row_ptr: Vec<usize>,
    col_ind: Vec<LocalIndex>,
    values: Vec<S>,
}

impl<S: Scalar> ReorderedBlock<S> {
    /// Entries coupling to rows owned elsewhere are dropped.
    pub fn new(matrix: &CrsMatrix<S>, reordering: Reordering) -> Result<Self, DistError> {
        let graph = matrix.graph().ok_or(DistError::NotFillComplete)?;
        let (row_ptr, _, values) = matrix.local_crs()?;
        let cols = block_columns(graph)?;
        reordering.check_len(graph.num_my_rows())?;

        let mut new_ptr = Vec::with_capacity(reordering.len() + 1);
        new_ptr.push(0);
        let mut col_ind = Vec::new();
        let mut new_vals = Vec::new();
        let mut row: Vec<(usize, S)> = Vec::new();
        for &old in &reordering.perm {
            row.clear();
            for k in row_ptr[old]..row_ptr[old + 1] {
                if let Some(j) = cols[k] {
                    row.push((reordering.inv[j], values[k]));
                }
            }
            row.sort_by_key(|e| e.0);
            col_ind.extend(row.iter().map(|e| e.0));
            new_vals.extend(row.iter().map(|e| e.1));
            new_ptr.push(col_ind.len());
        }
        Ok(Self {
            reordering,
            row_ptr: new_ptr,
            col_ind,
            values: new_vals,
        })
    }

    pub fn reordering(&self) -> &Reordering {
        &self.reordering
    }

    pub fn num_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn col_ind(&self) -> &[LocalIndex] {
        &self.col_ind
    }

    pub fn values(&self) -> &[S] {
        &self.values
    }

    pub fn row(&self, i: usize) -> (&[LocalIndex], &[S]) {
        let (s, e) = (self.row_ptr[i], self.row_ptr[i + 1]);
        (&self.col_ind[s..e], &self.values[s..e])
    }

    pub fn bandwidth(&self) -> usize {
        (0..self.num_rows())
            .flat_map(|i| self.row(i).0.iter().map(move |&j| i.abs_diff(j)))
            .max()
            .unwrap_or(0)
    }

    /// `y = B x` in the permuted numbering.
    pub fn multiply(&self, x: &[S], y: &mut [S]) -> Result<(), DistError> {
        self.reordering.check_len(x.len())?;
        self.reordering.check_len(y.len())?;
        for (i, yi) in y.iter_mut().enumerate() {
            let (cols, vals) = self.row(i);
            *yi = cols
                .iter()
                .zip(vals)
                .fold(S::zero(), |acc, (&j, &v)| acc + v * x[j]);
        }
        Ok(())
    }
}
