//! Distributed compressed-row sparse matrix.
//!
//! A matrix either owns a dynamic structure (entries are inserted freely and
//! the graph is built at fill-complete) or sits on a static, already
//! fill-complete [`CrsGraph`] shared through an `Arc`, in which case only
//! existing entries can be modified.
//!
//! Apply follows the usual halo-exchange recipe:
//! `x` (domain map) is imported into a column-map vector, the local block is
//! multiplied into a row-map vector, and the result is exported onto the
//! range map with `Add` when the row and range maps differ. The intermediate
//! vectors are cached between applies.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::algs::collectives::{agree, all_reduce_with};
use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::distributor::{CombineMode, Distributor, Export, Import, TransferPlan};
use crate::graph::{CrsGraph, FillOptions};
use crate::linalg::multivector::MultiVector;
use crate::linalg::operator::{Operator, RowMatrix, TransposeMode};
use crate::linalg::scalar::Scalar;
use crate::map::{GlobalIndex, IndexMap, LocalIndex};

#[derive(Debug, Default)]
struct ApplyScratch<S: Scalar> {
    col: Option<MultiVector<S>>,
    row: Option<MultiVector<S>>,
}

fn take_or_new<S: Scalar>(
    slot: &mut Option<MultiVector<S>>,
    map: &Arc<IndexMap>,
    num_vectors: usize,
) -> MultiVector<S> {
    match slot.take() {
        Some(mv) if mv.num_vectors() == num_vectors => mv,
        _ => MultiVector::new(Arc::clone(map), num_vectors),
    }
}

type Entries<S> = Vec<(GlobalIndex, S)>;

#[derive(Debug)]
pub struct CrsMatrix<S: Scalar> {
    row_map: Arc<IndexMap>,
    fixed_col_map: Option<Arc<IndexMap>>,
    graph: Option<Arc<CrsGraph>>,
    static_graph: bool,
    /// Aligned with the graph's local column indices.
    values: Vec<S>,
    pending: Vec<Entries<S>>,
    nonlocal: BTreeMap<GlobalIndex, Entries<S>>,
    fill_complete: bool,
    scratch: Mutex<ApplyScratch<S>>,
}

impl<S: Scalar> Clone for CrsMatrix<S> {
    fn clone(&self) -> Self {
        Self {
            row_map: Arc::clone(&self.row_map),
            fixed_col_map: self.fixed_col_map.clone(),
            graph: self.graph.clone(),
            static_graph: self.static_graph,
            values: self.values.clone(),
            pending: self.pending.clone(),
            nonlocal: self.nonlocal.clone(),
            fill_complete: self.fill_complete,
            scratch: Mutex::new(ApplyScratch::default()),
        }
    }
}

fn check_pair_len(cols: usize, vals: usize) -> Result<(), DistError> {
    if cols != vals {
        return Err(DistError::LocalLengthMismatch {
            expected: cols,
            got: vals,
        });
    }
    Ok(())
}

impl<S: Scalar> CrsMatrix<S> {
    pub fn new(row_map: Arc<IndexMap>) -> Self {
        let n = row_map.num_my();
        Self {
            row_map,
            fixed_col_map: None,
            graph: None,
            static_graph: false,
            values: Vec::new(),
            pending: vec![Vec::new(); n],
            nonlocal: BTreeMap::new(),
            fill_complete: false,
            scratch: Mutex::new(ApplyScratch::default()),
        }
    }

    pub fn with_col_map(row_map: Arc<IndexMap>, col_map: Arc<IndexMap>) -> Self {
        let mut m = Self::new(row_map);
        m.fixed_col_map = Some(col_map);
        m
    }

    /// Matrix over a fixed, fill-complete structure; all values start at zero.
    pub fn from_graph(graph: Arc<CrsGraph>) -> Result<Self, DistError> {
        if !graph.is_fill_complete() {
            return Err(DistError::NotFillComplete);
        }
        let nnz = graph.num_my_nonzeros();
        Ok(Self {
            row_map: Arc::clone(graph.row_map()),
            fixed_col_map: graph.col_map().cloned(),
            graph: Some(graph),
            static_graph: true,
            values: vec![S::zero(); nnz],
            pending: Vec::new(),
            nonlocal: BTreeMap::new(),
            fill_complete: false,
            scratch: Mutex::new(ApplyScratch::default()),
        })
    }

    pub fn is_fill_complete(&self) -> bool {
        self.fill_complete
    }

    pub fn has_static_graph(&self) -> bool {
        self.static_graph
    }

    /// The structure; present for static graphs and after fill-complete.
    pub fn graph(&self) -> Option<&Arc<CrsGraph>> {
        self.graph.as_ref()
    }

    /// `(row_ptr, col_ind, values)` of the local block. Requires fill-complete.
    pub fn local_crs(&self) -> Result<(&[usize], &[LocalIndex], &[S]), DistError> {
        let (row_ptr, col_ind) = self.filled_graph()?.local_csr()?;
        Ok((row_ptr, col_ind, &self.values))
    }

    fn filled_graph(&self) -> Result<&Arc<CrsGraph>, DistError> {
        match (&self.graph, self.fill_complete) {
            (Some(g), true) => Ok(g),
            _ => Err(DistError::NotFillComplete),
        }
    }

    // --- entry access ----------------------------------------------------

    /// Position of `(lrow, lcol)` in `values`.
    fn local_position(graph: &CrsGraph, lrow: LocalIndex, lcol: LocalIndex) -> Option<usize> {
        let (row_ptr, col_ind) = graph.local_csr().ok()?;
        let start = *row_ptr.get(lrow)?;
        let end = *row_ptr.get(lrow + 1)?;
        col_ind[start..end]
            .binary_search(&lcol)
            .ok()
            .map(|k| start + k)
    }

    fn global_position(graph: &CrsGraph, lrow: LocalIndex, col: GlobalIndex) -> Option<usize> {
        let lcol = graph.col_map()?.lid(col)?;
        Self::local_position(graph, lrow, lcol)
    }

    /// Add entries to row `row`; duplicates are summed at fill-complete. Rows
    /// owned elsewhere are stashed and summed into their owner at
    /// fill-complete.
    pub fn insert_global_values(
        &mut self,
        row: GlobalIndex,
        cols: &[GlobalIndex],
        vals: &[S],
    ) -> Result<(), DistError> {
        check_pair_len(cols.len(), vals.len())?;
        if self.static_graph {
            return Err(DistError::InvalidStructure(
                "cannot insert into a matrix with a static graph".into(),
            ));
        }
        if self.fill_complete {
            return Err(DistError::AlreadyFillComplete);
        }
        let entries = cols.iter().copied().zip(vals.iter().copied());
        match self.row_map.lid(row) {
            Some(lrow) => {
                if let Some(cm) = &self.fixed_col_map {
                    if let Some(&bad) = cols.iter().find(|&&c| !cm.is_my_gid(c)) {
                        return Err(DistError::ColumnNotInColMap(bad));
                    }
                }
                self.pending[lrow].extend(entries);
            }
            None => self.nonlocal.entry(row).or_default().extend(entries),
        }
        Ok(())
    }

    /// Add to existing entries. Off-rank rows are stashed until fill-complete.
    pub fn sum_into_global_values(
        &mut self,
        row: GlobalIndex,
        cols: &[GlobalIndex],
        vals: &[S],
    ) -> Result<(), DistError> {
        self.combine_global(row, cols, vals, CombineMode::Add)
    }

    /// Overwrite existing entries of a locally owned row.
    pub fn replace_global_values(
        &mut self,
        row: GlobalIndex,
        cols: &[GlobalIndex],
        vals: &[S],
    ) -> Result<(), DistError> {
        self.combine_global(row, cols, vals, CombineMode::Replace)
    }

    pub fn sum_into_local_values(
        &mut self,
        lrow: LocalIndex,
        cols: &[LocalIndex],
        vals: &[S],
    ) -> Result<(), DistError> {
        self.combine_local(lrow, cols, vals, CombineMode::Add)
    }

    pub fn replace_local_values(
        &mut self,
        lrow: LocalIndex,
        cols: &[LocalIndex],
        vals: &[S],
    ) -> Result<(), DistError> {
        self.combine_local(lrow, cols, vals, CombineMode::Replace)
    }

    fn combine_global(
        &mut self,
        row: GlobalIndex,
        cols: &[GlobalIndex],
        vals: &[S],
        mode: CombineMode,
    ) -> Result<(), DistError> {
        check_pair_len(cols.len(), vals.len())?;
        let Some(lrow) = self.row_map.lid(row) else {
            if mode == CombineMode::Add && !self.fill_complete {
                self.nonlocal
                    .entry(row)
                    .or_default()
                    .extend(cols.iter().copied().zip(vals.iter().copied()));
                return Ok(());
            }
            return Err(DistError::GlobalIndexNotLocal(row));
        };

        if let Some(graph) = &self.graph {
            let positions = cols
                .iter()
                .map(|&col| {
                    Self::global_position(graph, lrow, col)
                        .ok_or(DistError::EntryNotInPattern { row, col })
                })
                .collect::<Result<Vec<_>, _>>()?;
            for (k, &v) in positions.into_iter().zip(vals) {
                mode.apply(&mut self.values[k], v);
            }
            return Ok(());
        }

        // open dynamic row: the entry must have been inserted already
        let entries = &mut self.pending[lrow];
        if let Some(&col) = cols.iter().find(|&&c| !entries.iter().any(|e| e.0 == c)) {
            return Err(DistError::EntryNotInPattern { row, col });
        }
        for (&c, &v) in cols.iter().zip(vals) {
            match mode {
                CombineMode::Replace => {
                    let mut first = true;
                    for e in entries.iter_mut().filter(|e| e.0 == c) {
                        e.1 = if first { v } else { S::zero() };
                        first = false;
                    }
                }
                _ => entries.push((c, v)),
            }
        }
        Ok(())
    }

    fn combine_local(
        &mut self,
        lrow: LocalIndex,
        cols: &[LocalIndex],
        vals: &[S],
        mode: CombineMode,
    ) -> Result<(), DistError> {
        check_pair_len(cols.len(), vals.len())?;
        let row = self.row_map.gid(lrow).ok_or(DistError::LocalIndexOutOfBounds {
            index: lrow,
            len: self.row_map.num_my(),
        })?;
        let col_map = match (&self.graph, &self.fixed_col_map) {
            (Some(g), _) => g.col_map().cloned(),
            (None, cm) => cm.clone(),
        }
        .ok_or(DistError::MissingColumnMap)?;

        let gids = cols
            .iter()
            .map(|&c| {
                col_map.gid(c).ok_or(DistError::LocalIndexOutOfBounds {
                    index: c,
                    len: col_map.num_my(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(graph) = &self.graph {
            let positions = cols
                .iter()
                .zip(&gids)
                .map(|(&lc, &col)| {
                    Self::local_position(graph, lrow, lc)
                        .ok_or(DistError::EntryNotInPattern { row, col })
                })
                .collect::<Result<Vec<_>, _>>()?;
            for (k, &v) in positions.into_iter().zip(vals) {
                mode.apply(&mut self.values[k], v);
            }
            return Ok(());
        }
        self.combine_global(row, &gids, vals, mode)
    }

    // --- fill-complete ---------------------------------------------------

    pub fn fill_complete<C: Communicator>(&mut self, comm: &C) -> Result<(), DistError> {
        let rm = Arc::clone(&self.row_map);
        self.fill_complete_with(Arc::clone(&rm), rm, &FillOptions::default(), comm)
    }

    /// Collective. For a static graph the maps must be the graph's own.
    pub fn fill_complete_with<C: Communicator>(
        &mut self,
        domain_map: Arc<IndexMap>,
        range_map: Arc<IndexMap>,
        options: &FillOptions,
        comm: &C,
    ) -> Result<(), DistError> {
        agree(
            comm,
            if self.fill_complete {
                Err(DistError::AlreadyFillComplete)
            } else {
                Ok(())
            },
        )?;
        self.global_assemble(comm)?;

        if let Some(graph) = &self.graph {
            let same = graph
                .domain_map()
                .is_some_and(|d| d.locally_same_as(&domain_map))
                && graph
                    .range_map()
                    .is_some_and(|r| r.locally_same_as(&range_map));
            agree(
                comm,
                if same {
                    Ok(())
                } else {
                    Err(DistError::IncompatibleMaps(
                        "domain/range maps differ from the static graph's".into(),
                    ))
                },
            )?;
        } else {
            let mut graph = match &self.fixed_col_map {
                Some(cm) => CrsGraph::with_col_map(Arc::clone(&self.row_map), Arc::clone(cm)),
                None => CrsGraph::new(Arc::clone(&self.row_map)),
            };
            let inserted: Result<(), DistError> =
                self.pending.iter().enumerate().try_for_each(|(lrow, entries)| {
                    let cols: Vec<u64> = entries.iter().map(|e| e.0).collect();
                    graph.insert_global_indices(self.row_map.my_gids()[lrow], &cols)
                });
            agree(comm, inserted)?;
            let opts = FillOptions {
                local_rows_only: true,
                ..options.clone()
            };
            graph.fill_complete_with(domain_map, range_map, &opts, comm)?;

            let mut values = vec![S::zero(); graph.num_my_nonzeros()];
            for (lrow, entries) in self.pending.iter().enumerate() {
                for &(col, v) in entries {
                    if let Some(k) = Self::global_position(&graph, lrow, col) {
                        values[k] = values[k] + v;
                    }
                }
            }
            self.values = values;
            self.graph = Some(Arc::new(graph));
            self.pending = Vec::new();
        }

        self.fill_complete = true;
        log::debug!(
            "rank {}: matrix fill-complete with {} local entries (static graph: {})",
            comm.rank(),
            self.values.len(),
            self.static_graph
        );
        Ok(())
    }

    /// Sum stashed off-rank entries into their owning rows.
    fn global_assemble<C: Communicator>(&mut self, comm: &C) -> Result<(), DistError> {
        if !self.row_map.is_distributed() {
            let first = self.nonlocal.keys().next().copied();
            return agree(
                comm,
                match first {
                    Some(g) => Err(DistError::GlobalIndexNotLocal(g)),
                    None => Ok(()),
                },
            );
        }

        let stashed = std::mem::take(&mut self.nonlocal);
        let row_gids: Vec<u64> = stashed.keys().copied().collect();
        let owners = self.row_map.remote_index_list(&row_gids, comm)?;
        let dest: Result<Vec<usize>, DistError> = row_gids
            .iter()
            .zip(&owners)
            .map(|(&g, o)| o.map(|(r, _)| r).ok_or(DistError::UnknownGlobalIndex(g)))
            .collect();
        let dest = agree(comm, dest)?;

        // parallel lists per row: [row, cols...] and [0, vals...]
        let mut idx = Vec::new();
        let mut val = Vec::new();
        let mut sizes = Vec::with_capacity(stashed.len());
        for (row, entries) in &stashed {
            idx.push(*row);
            val.push(S::zero());
            for &(c, v) in entries {
                idx.push(c);
                val.push(v);
            }
            sizes.push(entries.len() + 1);
        }
        let plan = Distributor::create_from_sends(&dest, comm)?;
        let (idx_in, sizes_in) = plan.do_posts_and_waits_var(&idx, &sizes, comm)?;
        let val_in = plan.do_posts_and_waits_known(&val, &sizes, &sizes_in, comm)?;

        let mut bad = None;
        let mut offset = 0;
        for &n in &sizes_in {
            let (rows, vals) = (&idx_in[offset..offset + n], &val_in[offset..offset + n]);
            offset += n;
            let Some((&row, cols)) = rows.split_first() else {
                continue;
            };
            let res = if self.graph.is_some() {
                self.combine_global(row, cols, &vals[1..], CombineMode::Add)
            } else {
                match self.row_map.lid(row) {
                    Some(lrow) => {
                        let stray = self
                            .fixed_col_map
                            .as_ref()
                            .and_then(|cm| cols.iter().copied().find(|&c| !cm.is_my_gid(c)));
                        match stray {
                            Some(c) => Err(DistError::ColumnNotInColMap(c)),
                            None => {
                                self.pending[lrow]
                                    .extend(cols.iter().copied().zip(vals[1..].iter().copied()));
                                Ok(())
                            }
                        }
                    }
                    None => Err(DistError::GlobalIndexNotLocal(row)),
                }
            };
            if let Err(e) = res {
                bad.get_or_insert(e);
            }
        }
        agree(comm, bad.map_or(Ok(()), Err))
    }

    // --- local kernels ---------------------------------------------------

    /// `y = alpha * A_local x + beta * y` with `x` over the column map and `y`
    /// over the row map.
    fn local_multiply(
        &self,
        graph: &CrsGraph,
        x: &MultiVector<S>,
        y: &mut MultiVector<S>,
        alpha: S,
        beta: S,
    ) -> Result<(), DistError> {
        let (row_ptr, col_ind) = graph.local_csr()?;
        let values = &self.values;
        for j in 0..x.num_vectors() {
            let xj = x.col(j);
            let row_dot = |i: usize| {
                (row_ptr[i]..row_ptr[i + 1]).fold(S::zero(), |acc, k| acc + values[k] * xj[col_ind[k]])
            };
            let update = |(i, yi): (usize, &mut S)| {
                *yi = if beta == S::zero() {
                    alpha * row_dot(i)
                } else {
                    alpha * row_dot(i) + beta * *yi
                };
            };
            #[cfg(feature = "rayon")]
            {
                use rayon::prelude::*;
                y.col_mut(j).par_iter_mut().enumerate().for_each(update);
            }
            #[cfg(not(feature = "rayon"))]
            y.col_mut(j).iter_mut().enumerate().for_each(update);
        }
        Ok(())
    }

    /// `y_col += alpha * A_local^T x_row`.
    fn local_multiply_transpose(
        &self,
        graph: &CrsGraph,
        x: &MultiVector<S>,
        y: &mut MultiVector<S>,
        alpha: S,
    ) -> Result<(), DistError> {
        let (row_ptr, col_ind) = graph.local_csr()?;
        for j in 0..x.num_vectors() {
            let xj = x.col(j);
            let yj = y.col_mut(j);
            for (i, &xi) in xj.iter().enumerate() {
                let scaled = alpha * xi;
                for k in row_ptr[i]..row_ptr[i + 1] {
                    yj[col_ind[k]] = yj[col_ind[k]] + self.values[k] * scaled;
                }
            }
        }
        Ok(())
    }

    fn check_vectors(
        x: &MultiVector<S>,
        x_len: usize,
        y: &MultiVector<S>,
        y_len: usize,
    ) -> Result<(), DistError> {
        if x.num_vectors() != y.num_vectors() {
            return Err(DistError::VectorCountMismatch {
                expected: x.num_vectors(),
                got: y.num_vectors(),
            });
        }
        if x.local_length() != x_len {
            return Err(DistError::LocalLengthMismatch {
                expected: x_len,
                got: x.local_length(),
            });
        }
        if y.local_length() != y_len {
            return Err(DistError::LocalLengthMismatch {
                expected: y_len,
                got: y.local_length(),
            });
        }
        Ok(())
    }

    // --- row-matrix queries ----------------------------------------------

    /// Global column indices and values of a locally owned row.
    pub fn extract_global_row_copy(
        &self,
        row: GlobalIndex,
    ) -> Result<(Vec<GlobalIndex>, Vec<S>), DistError> {
        let lrow = self.row_map.lid(row).ok_or(DistError::GlobalIndexNotLocal(row))?;
        let (cols, vals) = self.extract_my_row_copy(lrow)?;
        let cm = self.filled_graph()?.col_map().ok_or(DistError::MissingColumnMap)?;
        Ok((cols.into_iter().map(|c| cm.my_gids()[c]).collect(), vals))
    }

    /// Rows stored on several ranks are summed on the range map first.
    pub fn norm_frobenius<C: Communicator>(&self, comm: &C) -> Result<S, DistError> {
        let local = match self.filled_graph()?.exporter() {
            Some(exp) => self
                .rows_on_range(exp, comm)?
                .iter()
                .flatten()
                .fold(S::zero(), |acc, &(_, v)| acc + v * v),
            None => self.values.iter().fold(S::zero(), |acc, &v| acc + v * v),
        };
        Ok(all_reduce_with(comm, local, |a, b| a + b)?.sqrt())
    }

    pub fn scale(&mut self, alpha: S) {
        for v in &mut self.values {
            *v = *v * alpha;
        }
    }

    /// `A(i, :) *= x[i]` with `x` laid over the row map.
    pub fn left_scale(&mut self, x: &MultiVector<S>) -> Result<(), DistError> {
        let graph = Arc::clone(self.filled_graph()?);
        if x.local_length() != self.row_map.num_my() {
            return Err(DistError::LocalLengthMismatch {
                expected: self.row_map.num_my(),
                got: x.local_length(),
            });
        }
        let (row_ptr, _) = graph.local_csr()?;
        for (i, &s) in x.col(0).iter().enumerate() {
            for v in &mut self.values[row_ptr[i]..row_ptr[i + 1]] {
                *v = *v * s;
            }
        }
        Ok(())
    }

    /// `A(:, j) *= x[j]` with `x` laid over the domain map. Collective.
    pub fn right_scale<C: Communicator>(
        &mut self,
        x: &MultiVector<S>,
        comm: &C,
    ) -> Result<(), DistError> {
        let graph = Arc::clone(self.filled_graph()?);
        let expected = self.domain_map()?.num_my();
        agree(
            comm,
            if x.local_length() == expected {
                Ok(())
            } else {
                Err(DistError::LocalLengthMismatch {
                    expected,
                    got: x.local_length(),
                })
            },
        )?;
        let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
        let x_col = match graph.importer() {
            Some(imp) => {
                let mut xc = MultiVector::vector(Arc::clone(col_map));
                xc.import(x, imp, CombineMode::Insert, comm)?;
                xc
            }
            None => x.clone(),
        };
        let (_, col_ind) = graph.local_csr()?;
        let s = x_col.col(0);
        for (v, &c) in self.values.iter_mut().zip(col_ind) {
            *v = *v * s[c];
        }
        Ok(())
    }

    /// Rows summed onto their range-map owners, one entry per column.
    /// Collective.
    fn rows_on_range<C: Communicator>(
        &self,
        exporter: &Export,
        comm: &C,
    ) -> Result<Vec<Entries<S>>, DistError> {
        let owned = Self::export_from(self, exporter, CombineMode::Add, comm)?;
        Ok(owned.pending.into_iter().map(sum_duplicates).collect())
    }

    /// `max_j sum_i |A(i, j)|` with partial rows summed first. Collective.
    fn column_sums_on_domain<C: Communicator>(
        &self,
        exporter: &Export,
        comm: &C,
    ) -> Result<S, DistError> {
        let mut sums: BTreeMap<GlobalIndex, S> = BTreeMap::new();
        for (c, v) in self.rows_on_range(exporter, comm)?.into_iter().flatten() {
            let s = sums.entry(c).or_insert(S::zero());
            *s = *s + v.abs();
        }
        let domain = self.domain_map()?;
        let gids: Vec<GlobalIndex> = sums.keys().copied().collect();
        let touched = Arc::new(IndexMap::from_gids(None, &gids, domain.index_base(), comm)?);
        let to_domain = Export::new(Arc::clone(&touched), Arc::clone(domain), comm)?;
        let partial = MultiVector::from_columns(touched, vec![sums.into_values().collect()])?;
        let mut on_domain = MultiVector::vector(Arc::clone(domain));
        on_domain.export(&partial, &to_domain, CombineMode::Add, comm)?;
        Ok(on_domain.norm_inf(comm)?[0])
    }

    // --- redistribution --------------------------------------------------

    /// Rows and values of `source` moved to the importer's target map; the
    /// result is open. Collective.
    pub fn import_from<C: Communicator>(
        source: &CrsMatrix<S>,
        importer: &Import,
        mode: CombineMode,
        comm: &C,
    ) -> Result<CrsMatrix<S>, DistError> {
        Self::redistribute(source, importer, mode, comm)
    }

    /// Rows and values of `source` pushed to the exporter's target map; the
    /// result is open. Collective.
    pub fn export_from<C: Communicator>(
        source: &CrsMatrix<S>,
        exporter: &Export,
        mode: CombineMode,
        comm: &C,
    ) -> Result<CrsMatrix<S>, DistError> {
        Self::redistribute(source, exporter, mode, comm)
    }

    fn redistribute<C: Communicator>(
        source: &CrsMatrix<S>,
        plan: &TransferPlan,
        mode: CombineMode,
        comm: &C,
    ) -> Result<CrsMatrix<S>, DistError> {
        let check = match source.filled_graph() {
            Err(e) => Err(e),
            Ok(_) if !source.row_map.locally_same_as(plan.source_map()) => {
                Err(DistError::IncompatibleMaps(
                    "transfer source map is not the matrix row map".into(),
                ))
            }
            Ok(g) => g.col_map().map(|_| ()).ok_or(DistError::MissingColumnMap),
        };
        agree(comm, check)?;
        let graph = source.filled_graph()?;
        let (row_ptr, col_ind) = graph.local_csr()?;
        let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;

        let contributions = plan.transfer_ragged_pair(
            |lid, cols: &mut Vec<u64>, vals: &mut Vec<S>| {
                let (s, e) = (row_ptr[lid], row_ptr[lid + 1]);
                cols.extend(col_ind[s..e].iter().map(|&c| col_map.my_gids()[c]));
                vals.extend_from_slice(&source.values[s..e]);
            },
            comm,
        )?;

        let mut target = CrsMatrix::new(Arc::clone(plan.target_map()));
        for (lid, cols, vals) in contributions {
            merge_row(&mut target.pending[lid], &cols, &vals, mode);
        }
        Ok(target)
    }
}

/// Sort a row by column and add up repeated columns.
fn sum_duplicates<S: Scalar>(mut row: Entries<S>) -> Entries<S> {
    row.sort_by_key(|e| e.0);
    let mut out: Entries<S> = Vec::with_capacity(row.len());
    for (c, v) in row {
        match out.last_mut() {
            Some(last) if last.0 == c => last.1 = last.1 + v,
            _ => out.push((c, v)),
        }
    }
    out
}

/// Merge incoming entries into an open row according to `mode`.
/// `Replace` and `AbsMax` act on the summed value of a column already in the
/// row and append the column when it is absent.
fn merge_row<S: Scalar>(row: &mut Entries<S>, cols: &[GlobalIndex], vals: &[S], mode: CombineMode) {
    for (&c, &v) in cols.iter().zip(vals) {
        match mode {
            CombineMode::Insert | CombineMode::Add => row.push((c, v)),
            CombineMode::Zero => row.push((c, S::zero())),
            CombineMode::Replace | CombineMode::AbsMax => {
                let existing = row
                    .iter()
                    .filter(|e| e.0 == c)
                    .fold(None, |acc: Option<S>, e| Some(acc.unwrap_or(S::zero()) + e.1));
                row.retain(|e| e.0 != c);
                let merged = match existing {
                    Some(cur) => {
                        let mut t = cur;
                        mode.apply(&mut t, v);
                        t
                    }
                    None => v,
                };
                row.push((c, merged));
            }
        }
    }
}

impl<S: Scalar> Operator<S> for CrsMatrix<S> {
    fn domain_map(&self) -> Result<&Arc<IndexMap>, DistError> {
        self.graph
            .as_ref()
            .and_then(|g| g.domain_map())
            .ok_or(DistError::NotFillComplete)
    }

    fn range_map(&self) -> Result<&Arc<IndexMap>, DistError> {
        self.graph
            .as_ref()
            .and_then(|g| g.range_map())
            .ok_or(DistError::NotFillComplete)
    }

    fn apply<C: Communicator>(
        &self,
        x: &MultiVector<S>,
        y: &mut MultiVector<S>,
        mode: TransposeMode,
        alpha: S,
        beta: S,
        comm: &C,
    ) -> Result<(), DistError> {
        let graph = self.filled_graph()?;
        let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
        let domain = self.domain_map()?;
        let range = self.range_map()?;
        let nv = x.num_vectors();
        let zero = S::zero();
        let mut scratch = self.scratch.lock();

        match mode {
            TransposeMode::NoTranspose => {
                Self::check_vectors(x, domain.num_my(), y, range.num_my())?;
                let x_col_buf = match graph.importer() {
                    Some(imp) => {
                        let mut xc = take_or_new(&mut scratch.col, col_map, nv);
                        xc.import(x, imp, CombineMode::Insert, comm)?;
                        Some(xc)
                    }
                    None => None,
                };
                let x_col = x_col_buf.as_ref().unwrap_or(x);

                match graph.exporter() {
                    Some(exp) => {
                        let mut y_row = take_or_new(&mut scratch.row, &self.row_map, nv);
                        self.local_multiply(graph, x_col, &mut y_row, alpha, zero)?;
                        if beta == zero {
                            y.put_scalar(zero);
                        } else {
                            y.scale(beta);
                        }
                        y.export(&y_row, exp, CombineMode::Add, comm)?;
                        scratch.row = Some(y_row);
                    }
                    None => self.local_multiply(graph, x_col, y, alpha, beta)?,
                }
                if let Some(xc) = x_col_buf {
                    scratch.col = Some(xc);
                }
            }
            TransposeMode::Transpose => {
                Self::check_vectors(x, range.num_my(), y, domain.num_my())?;
                let x_row_buf = match graph.exporter() {
                    Some(exp) => {
                        let mut xr = take_or_new(&mut scratch.row, &self.row_map, nv);
                        xr.put_scalar(zero);
                        xr.export_reverse(x, exp, CombineMode::Insert, comm)?;
                        Some(xr)
                    }
                    None => None,
                };
                let x_row = x_row_buf.as_ref().unwrap_or(x);

                let mut y_col = take_or_new(&mut scratch.col, col_map, nv);
                y_col.put_scalar(zero);
                self.local_multiply_transpose(graph, x_row, &mut y_col, alpha)?;
                match graph.importer() {
                    Some(imp) => {
                        if beta == zero {
                            y.put_scalar(zero);
                        } else {
                            y.scale(beta);
                        }
                        y.import_reverse(&y_col, imp, CombineMode::Add, comm)?;
                    }
                    None => y.update(S::one(), &y_col, beta)?,
                }
                scratch.col = Some(y_col);
                if let Some(xr) = x_row_buf {
                    scratch.row = Some(xr);
                }
            }
        }
        Ok(())
    }
}

impl<S: Scalar> RowMatrix<S> for CrsMatrix<S> {
    fn row_map(&self) -> &Arc<IndexMap> {
        &self.row_map
    }

    fn col_map(&self) -> Result<&Arc<IndexMap>, DistError> {
        self.graph
            .as_ref()
            .and_then(|g| g.col_map())
            .or(self.fixed_col_map.as_ref())
            .ok_or(DistError::MissingColumnMap)
    }

    fn num_my_rows(&self) -> usize {
        self.row_map.num_my()
    }

    fn num_global_nonzeros(&self) -> u64 {
        self.graph.as_ref().map_or(0, |g| g.num_global_nonzeros())
    }

    fn max_num_entries(&self) -> usize {
        match &self.graph {
            Some(g) => g.max_num_row_entries(),
            None => self.pending.iter().map(Vec::len).max().unwrap_or(0),
        }
    }

    fn extract_my_row_copy(&self, lrow: LocalIndex) -> Result<(Vec<LocalIndex>, Vec<S>), DistError> {
        let graph = self.graph.as_ref().ok_or(DistError::NotFillComplete)?;
        let (row_ptr, _) = graph.local_csr()?;
        let cols = graph.local_row(lrow)?.to_vec();
        let vals = self.values[row_ptr[lrow]..row_ptr[lrow + 1]].to_vec();
        Ok((cols, vals))
    }

    fn extract_diagonal_copy(&self) -> Result<MultiVector<S>, DistError> {
        let graph = self.filled_graph()?;
        let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
        let mut diag = MultiVector::vector(Arc::clone(&self.row_map));
        let d = diag.col_mut(0);
        for (lrow, &gid) in self.row_map.my_gids().iter().enumerate() {
            let pos = col_map
                .lid(gid)
                .and_then(|lc| Self::local_position(graph, lrow, lc));
            if let Some(k) = pos {
                d[lrow] = self.values[k];
            }
        }
        Ok(diag)
    }

    fn norm_inf<C: Communicator>(&self, comm: &C) -> Result<S, DistError> {
        let graph = self.filled_graph()?;
        let abs_sum = |acc: S, v: &S| acc + v.abs();
        let local = match graph.exporter() {
            Some(exp) => self
                .rows_on_range(exp, comm)?
                .iter()
                .map(|row| row.iter().map(|e| e.1).fold(S::zero(), |acc, v| abs_sum(acc, &v)))
                .fold(S::zero(), |a, b| a.max(b)),
            None => {
                let (row_ptr, _) = graph.local_csr()?;
                row_ptr
                    .windows(2)
                    .map(|w| self.values[w[0]..w[1]].iter().fold(S::zero(), abs_sum))
                    .fold(S::zero(), |a, b| a.max(b))
            }
        };
        all_reduce_with(comm, local, |a, b| a.max(b))
    }

    fn norm_one<C: Communicator>(&self, comm: &C) -> Result<S, DistError> {
        let graph = self.filled_graph()?;
        if let Some(exp) = graph.exporter() {
            return self.column_sums_on_domain(exp, comm);
        }
        let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
        let (_, col_ind) = graph.local_csr()?;
        let mut col_sums = MultiVector::vector(Arc::clone(col_map));
        {
            let s = col_sums.col_mut(0);
            for (v, &c) in self.values.iter().zip(col_ind) {
                s[c] = s[c] + v.abs();
            }
        }
        let sums = match graph.importer() {
            Some(imp) => {
                let mut on_domain = MultiVector::vector(Arc::clone(imp.source_map()));
                on_domain.import_reverse(&col_sums, imp, CombineMode::Add, comm)?;
                on_domain
            }
            None => col_sums,
        };
        Ok(sums.norm_inf(comm)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn laplace(n: u64) -> CrsMatrix<f64> {
        let map = Arc::new(IndexMap::uniform(n, 0, &NoComm).unwrap());
        let mut a = CrsMatrix::new(map);
        for i in 0..n {
            let mut cols = vec![i];
            let mut vals = vec![2.0];
            if i > 0 {
                cols.push(i - 1);
                vals.push(-1.0);
            }
            if i + 1 < n {
                cols.push(i + 1);
                vals.push(-1.0);
            }
            a.insert_global_values(i, &cols, &vals).unwrap();
        }
        a.fill_complete(&NoComm).unwrap();
        a
    }

    #[test]
    fn serial_apply_and_transpose() {
        let a = laplace(4);
        let map = Arc::clone(a.row_map());
        let x = MultiVector::from_columns(Arc::clone(&map), vec![vec![1.0, 2.0, 3.0, 4.0]]).unwrap();
        let mut y = MultiVector::from_columns(Arc::clone(&map), vec![vec![f64::NAN; 4]]).unwrap();
        a.apply(&x, &mut y, TransposeMode::NoTranspose, 1.0, 0.0, &NoComm)
            .unwrap();
        assert_eq!(y.col(0), &[0.0, 0.0, 0.0, 5.0]);

        let mut yt = MultiVector::from_columns(map, vec![vec![1.0; 4]]).unwrap();
        a.apply(&x, &mut yt, TransposeMode::Transpose, 2.0, 1.0, &NoComm)
            .unwrap();
        assert_eq!(yt.col(0), &[1.0, 1.0, 1.0, 11.0]);
    }

    #[test]
    fn duplicates_are_summed_and_diagonal_extracted() {
        let map = Arc::new(IndexMap::uniform(2, 0, &NoComm).unwrap());
        let mut a = CrsMatrix::<f64>::new(map);
        a.insert_global_values(0, &[0, 1, 0], &[1.0, 2.0, 3.0]).unwrap();
        a.insert_global_values(1, &[1], &[-5.0]).unwrap();
        a.sum_into_global_values(1, &[1], &[1.0]).unwrap();
        assert!(a.sum_into_global_values(1, &[0], &[1.0]).is_err());
        a.fill_complete(&NoComm).unwrap();

        assert_eq!(a.extract_my_row_copy(0).unwrap(), (vec![0, 1], vec![4.0, 2.0]));
        assert_eq!(a.extract_diagonal_copy().unwrap().col(0), &[4.0, -4.0]);
        assert_eq!(a.norm_inf(&NoComm).unwrap(), 6.0);
        assert_eq!(a.norm_one(&NoComm).unwrap(), 6.0);
        assert_eq!(a.norm_frobenius(&NoComm).unwrap(), 6.0);
    }

    #[test]
    fn static_graph_only_touches_existing_entries() {
        let a = laplace(3);
        let graph = Arc::clone(a.graph().unwrap());
        let mut b = CrsMatrix::<f64>::from_graph(graph).unwrap();
        assert!(b.has_static_graph());
        assert!(b.insert_global_values(0, &[0], &[1.0]).is_err());
        b.sum_into_global_values(0, &[0, 1], &[1.0, 1.0]).unwrap();
        b.replace_local_values(2, &[2], &[7.0]).unwrap();
        assert_eq!(
            b.sum_into_global_values(0, &[2], &[1.0]),
            Err(DistError::EntryNotInPattern { row: 0, col: 2 })
        );
        b.fill_complete(&NoComm).unwrap();
        assert_eq!(b.extract_global_row_copy(0).unwrap(), (vec![0, 1], vec![1.0, 1.0]));
        assert_eq!(b.extract_diagonal_copy().unwrap().col(0), &[1.0, 0.0, 7.0]);
    }

    #[test]
    fn scaling() {
        let mut a = laplace(2);
        let map = Arc::clone(a.row_map());
        a.scale(2.0);
        let s = MultiVector::from_columns(Arc::clone(&map), vec![vec![1.0, 0.5]]).unwrap();
        a.left_scale(&s).unwrap();
        a.right_scale(&s, &NoComm).unwrap();
        // [[4, -2], [-2, 4]] -> rows scaled by [1, .5] -> cols scaled by [1, .5]
        assert_eq!(a.extract_my_row_copy(0).unwrap().1, vec![4.0, -1.0]);
        assert_eq!(a.extract_my_row_copy(1).unwrap().1, vec![-1.0, 1.0]);
    }

    #[test]
    fn merged_rows_follow_the_combine_mode() {
        let mut row: Entries<f64> = vec![(1, 2.0)];
        merge_row(&mut row, &[1, 4], &[5.0, 3.0], CombineMode::Replace);
        assert_eq!(row, vec![(1, 5.0), (4, 3.0)]);
        merge_row(&mut row, &[4], &[-7.0], CombineMode::AbsMax);
        merge_row(&mut row, &[1, 6], &[1.0, 0.5], CombineMode::Add);
        merge_row(&mut row, &[6], &[9.0], CombineMode::Zero);
        assert_eq!(
            sum_duplicates(row),
            vec![(1, 6.0), (4, 7.0), (6, 0.5)]
        );
    }

    #[test]
    fn right_scale_rejects_a_short_vector() {
        let mut a = laplace(4);
        let short = MultiVector::vector(Arc::new(IndexMap::uniform(2, 0, &NoComm).unwrap()));
        assert_eq!(
            a.right_scale(&short, &NoComm),
            Err(DistError::LocalLengthMismatch { expected: 4, got: 2 })
        );
        assert_eq!(
            a.left_scale(&short),
            Err(DistError::LocalLengthMismatch { expected: 4, got: 2 })
        );
        assert_eq!(a.norm_inf(&NoComm).unwrap(), 4.0);
    }

    #[test]
    fn apply_before_fill_fails() {
        let map = Arc::new(IndexMap::uniform(2, 0, &NoComm).unwrap());
        let a = CrsMatrix::<f64>::new(Arc::clone(&map));
        let x = MultiVector::vector(Arc::clone(&map));
        let mut y = MultiVector::vector(map);
        assert_eq!(
            a.apply(&x, &mut y, TransposeMode::NoTranspose, 1.0, 0.0, &NoComm),
            Err(DistError::NotFillComplete)
        );
    }
}
