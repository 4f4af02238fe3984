//! Distributed compressed-row sparsity graph.
//!
//! A graph is *open* while indices are inserted, and *fill-complete* once
//! [`CrsGraph::fill_complete_with`] has run:
//!
//! 1. rows inserted on a rank that does not own them are shipped to their
//!    owners (global assembly),
//! 2. the column map is built (owned domain indices first, in domain order,
//!    then remote indices grouped by owning rank) unless one was given,
//! 3. every row is converted to local column indices, sorted and
//!    de-duplicated into CSR arrays,
//! 4. an importer (domain → column map) and an exporter (row → range map) are
//!    built when the maps differ.
//!
//! After fill-complete the structure, the column map and the import pattern
//! are frozen and shared by every apply.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algs::collectives::{agree, all_reduce_sum_u64};
use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use crate::distributor::{Distributor, Export, Import, TransferPlan};
use crate::map::{GlobalIndex, IndexMap, LocalIndex};

/// Order of the remote (ghost) part of a generated column map.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ColumnOrdering {
    /// Grouped by owning rank, ascending gid within a rank.
    #[default]
    ByOwnerThenGid,
    /// Ascending gid.
    ByGid,
}

/// Knobs of [`CrsGraph::fill_complete_with`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FillOptions {
    pub column_ordering: ColumnOrdering,
    /// Skip the global assembly of stashed off-rank rows; inserting a row this
    /// rank does not own is then an error.
    pub local_rows_only: bool,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            column_ordering: ColumnOrdering::ByOwnerThenGid,
            local_rows_only: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrsGraph {
    row_map: Arc<IndexMap>,
    col_map: Option<Arc<IndexMap>>,
    domain_map: Option<Arc<IndexMap>>,
    range_map: Option<Arc<IndexMap>>,

    // open state: global column indices per owned row, plus stashed rows
    rows: Vec<Vec<GlobalIndex>>,
    nonlocal: BTreeMap<GlobalIndex, Vec<GlobalIndex>>,

    // fill-complete state
    row_ptr: Vec<usize>,
    col_ind: Vec<LocalIndex>,
    importer: Option<Arc<Import>>,
    exporter: Option<Arc<Export>>,
    fill_complete: bool,
    num_global_nonzeros: u64,
}

impl CrsGraph {
    pub fn new(row_map: Arc<IndexMap>) -> Self {
        let n = row_map.num_my();
        Self {
            row_map,
            col_map: None,
            domain_map: None,
            range_map: None,
            rows: vec![Vec::new(); n],
            nonlocal: BTreeMap::new(),
            row_ptr: Vec::new(),
            col_ind: Vec::new(),
            importer: None,
            exporter: None,
            fill_complete: false,
            num_global_nonzeros: 0,
        }
    }

    /// Graph with a fixed column map; columns outside it are rejected.
    pub fn with_col_map(row_map: Arc<IndexMap>, col_map: Arc<IndexMap>) -> Self {
        let mut g = Self::new(row_map);
        g.col_map = Some(col_map);
        g
    }

    // --- insertion -------------------------------------------------------

    /// Add column indices to row `row`. Rows owned by another rank are stashed
    /// and shipped to their owner at fill-complete.
    pub fn insert_global_indices(
        &mut self,
        row: GlobalIndex,
        cols: &[GlobalIndex],
    ) -> Result<(), DistError> {
        if self.fill_complete {
            return Err(DistError::AlreadyFillComplete);
        }
        match self.row_map.lid(row) {
            Some(lrow) => {
                if let Some(cm) = &self.col_map {
                    if let Some(&bad) = cols.iter().find(|&&c| !cm.is_my_gid(c)) {
                        return Err(DistError::ColumnNotInColMap(bad));
                    }
                }
                self.rows[lrow].extend_from_slice(cols);
            }
            None => {
                self.nonlocal.entry(row).or_default().extend_from_slice(cols);
            }
        }
        Ok(())
    }

    /// Add local column indices to local row `lrow`. Requires a column map.
    pub fn insert_local_indices(
        &mut self,
        lrow: LocalIndex,
        cols: &[LocalIndex],
    ) -> Result<(), DistError> {
        if self.fill_complete {
            return Err(DistError::AlreadyFillComplete);
        }
        let cm = self.col_map.as_ref().ok_or(DistError::MissingColumnMap)?;
        let n = self.rows.len();
        let row = self
            .rows
            .get_mut(lrow)
            .ok_or(DistError::LocalIndexOutOfBounds { index: lrow, len: n })?;
        for &c in cols {
            let gid = cm.gid(c).ok_or(DistError::LocalIndexOutOfBounds {
                index: c,
                len: cm.num_my(),
            })?;
            row.push(gid);
        }
        Ok(())
    }

    /// Number of rows stashed for other ranks.
    pub fn num_nonlocal_rows(&self) -> usize {
        self.nonlocal.len()
    }

    // --- fill-complete ---------------------------------------------------

    /// Fill-complete with domain and range equal to the row map.
    pub fn fill_complete<C: Communicator>(&mut self, comm: &C) -> Result<(), DistError> {
        let rm = Arc::clone(&self.row_map);
        self.fill_complete_with(Arc::clone(&rm), rm, &FillOptions::default(), comm)
    }

    /// Collective. Every rank must call it with equivalent options.
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

        self.global_assemble(options, comm)?;

        let col_map = match &self.col_map {
            Some(cm) => Arc::clone(cm),
            None => Arc::new(self.make_col_map(&domain_map, options, comm)?),
        };

        // local CSR: sort and de-duplicate every row
        let mut row_ptr = Vec::with_capacity(self.rows.len() + 1);
        let mut col_ind = Vec::new();
        row_ptr.push(0);
        let mut missing = None;
        for row in &self.rows {
            let start = col_ind.len();
            for &g in row {
                match col_map.lid(g) {
                    Some(l) => col_ind.push(l),
                    None => {
                        missing.get_or_insert(g);
                    }
                }
            }
            col_ind[start..].sort_unstable();
            let mut keep = start;
            for k in start..col_ind.len() {
                if keep == start || col_ind[keep - 1] != col_ind[k] {
                    col_ind[keep] = col_ind[k];
                    keep += 1;
                }
            }
            col_ind.truncate(keep);
            row_ptr.push(col_ind.len());
        }
        agree(
            comm,
            match missing {
                Some(g) => Err(DistError::ColumnNotInColMap(g)),
                None => Ok(()),
            },
        )?;

        let importer = if domain_map.same_as(&col_map, comm)? {
            None
        } else {
            Some(Arc::new(Import::new(
                Arc::clone(&domain_map),
                Arc::clone(&col_map),
                comm,
            )?))
        };
        let exporter = if self.row_map.same_as(&range_map, comm)? {
            None
        } else {
            Some(Arc::new(Export::new(
                Arc::clone(&self.row_map),
                Arc::clone(&range_map),
                comm,
            )?))
        };

        self.num_global_nonzeros = all_reduce_sum_u64(comm, col_ind.len() as u64)?;
        self.row_ptr = row_ptr;
        self.col_ind = col_ind;
        self.rows = Vec::new();
        self.col_map = Some(col_map);
        self.domain_map = Some(domain_map);
        self.range_map = Some(range_map);
        self.importer = importer;
        self.exporter = exporter;
        self.fill_complete = true;

        log::debug!(
            "rank {}: graph fill-complete: {} rows, {} local nonzeros, {} columns, importer={}, exporter={}",
            comm.rank(),
            self.num_my_rows(),
            self.num_my_nonzeros(),
            self.col_map.as_ref().map_or(0, |c| c.num_my()),
            self.importer.is_some(),
            self.exporter.is_some()
        );
        crate::debug_invariants!(self.validate_invariants(), "CrsGraph::fill_complete");
        Ok(())
    }

    /// Ship stashed rows to their owners and merge the rows received.
    fn global_assemble<C: Communicator>(
        &mut self,
        options: &FillOptions,
        comm: &C,
    ) -> Result<(), DistError> {
        if options.local_rows_only || !self.row_map.is_distributed() {
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

        // each entry is [row gid, cols...]
        let mut buf = Vec::new();
        let mut sizes = Vec::with_capacity(stashed.len());
        for (row, cols) in &stashed {
            buf.push(*row);
            buf.extend_from_slice(cols);
            sizes.push(cols.len() + 1);
        }
        let plan = Distributor::create_from_sends(&dest, comm)?;
        let (incoming, incoming_sizes) = plan.do_posts_and_waits_var(&buf, &sizes, comm)?;

        let mut bad = None;
        let mut offset = 0;
        for &n in &incoming_sizes {
            let entry = &incoming[offset..offset + n];
            offset += n;
            let Some((&row, cols)) = entry.split_first() else {
                continue;
            };
            match self.row_map.lid(row) {
                Some(lrow) => {
                    if let Some(cm) = &self.col_map {
                        if let Some(&c) = cols.iter().find(|&&c| !cm.is_my_gid(c)) {
                            bad.get_or_insert(DistError::ColumnNotInColMap(c));
                            continue;
                        }
                    }
                    self.rows[lrow].extend_from_slice(cols);
                }
                None => {
                    bad.get_or_insert(DistError::GlobalIndexNotLocal(row));
                }
            }
        }
        log::debug!(
            "rank {}: global assembly sent {} rows, received {}",
            comm.rank(),
            stashed.len(),
            incoming_sizes.len()
        );
        agree(comm, bad.map_or(Ok(()), Err))
    }

    fn make_col_map<C: Communicator>(
        &self,
        domain_map: &IndexMap,
        options: &FillOptions,
        comm: &C,
    ) -> Result<IndexMap, DistError> {
        let mut used_local = vec![false; domain_map.num_my()];
        let mut remote = Vec::new();
        for row in &self.rows {
            for &g in row {
                match domain_map.lid(g) {
                    Some(l) => used_local[l] = true,
                    None => remote.push(g),
                }
            }
        }
        remote.sort_unstable();
        remote.dedup();

        let owners = domain_map.remote_index_list(&remote, comm)?;
        let keyed: Result<Vec<(usize, u64)>, DistError> = remote
            .iter()
            .zip(&owners)
            .map(|(&g, o)| match o {
                Some((r, _)) => Ok((*r, g)),
                None => Err(DistError::UnknownGlobalIndex(g)),
            })
            .collect();
        let mut keyed = agree(comm, keyed)?;
        if options.column_ordering == ColumnOrdering::ByOwnerThenGid {
            // remote is gid-sorted already; a stable sort by owner keeps that
            keyed.sort_by_key(|&(r, _)| r);
        }

        let mut gids: Vec<u64> = domain_map
            .my_gids()
            .iter()
            .zip(&used_local)
            .filter(|(_, used)| **used)
            .map(|(&g, _)| g)
            .collect();
        gids.extend(keyed.into_iter().map(|(_, g)| g));
        IndexMap::from_gids(None, &gids, domain_map.index_base(), comm)
    }

    // --- queries ---------------------------------------------------------

    pub fn is_fill_complete(&self) -> bool {
        self.fill_complete
    }

    pub fn row_map(&self) -> &Arc<IndexMap> {
        &self.row_map
    }

    pub fn col_map(&self) -> Option<&Arc<IndexMap>> {
        self.col_map.as_ref()
    }

    pub fn domain_map(&self) -> Option<&Arc<IndexMap>> {
        self.domain_map.as_ref()
    }

    pub fn range_map(&self) -> Option<&Arc<IndexMap>> {
        self.range_map.as_ref()
    }

    /// Domain → column map importer; `None` when the maps are the same.
    pub fn importer(&self) -> Option<&Arc<Import>> {
        self.importer.as_ref()
    }

    /// Row → range map exporter; `None` when the maps are the same.
    pub fn exporter(&self) -> Option<&Arc<Export>> {
        self.exporter.as_ref()
    }

    pub fn num_my_rows(&self) -> usize {
        self.row_map.num_my()
    }

    pub fn num_my_nonzeros(&self) -> usize {
        if self.fill_complete {
            self.col_ind.len()
        } else {
            self.rows.iter().map(Vec::len).sum()
        }
    }

    /// Valid after fill-complete.
    pub fn num_global_nonzeros(&self) -> u64 {
        self.num_global_nonzeros
    }

    pub fn max_num_row_entries(&self) -> usize {
        if self.fill_complete {
            self.row_ptr.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0)
        } else {
            self.rows.iter().map(Vec::len).max().unwrap_or(0)
        }
    }

    pub fn num_row_entries(&self, lrow: LocalIndex) -> Option<usize> {
        if self.fill_complete {
            (lrow < self.num_my_rows()).then(|| self.row_ptr[lrow + 1] - self.row_ptr[lrow])
        } else {
            self.rows.get(lrow).map(Vec::len)
        }
    }

    /// Sorted local column indices of a row. Requires fill-complete.
    pub fn local_row(&self, lrow: LocalIndex) -> Result<&[LocalIndex], DistError> {
        if !self.fill_complete {
            return Err(DistError::NotFillComplete);
        }
        if lrow >= self.num_my_rows() {
            return Err(DistError::LocalIndexOutOfBounds {
                index: lrow,
                len: self.num_my_rows(),
            });
        }
        Ok(&self.col_ind[self.row_ptr[lrow]..self.row_ptr[lrow + 1]])
    }

    /// Global column indices of a row, in storage order.
    pub fn global_row(&self, lrow: LocalIndex) -> Result<Vec<GlobalIndex>, DistError> {
        if !self.fill_complete {
            return self
                .rows
                .get(lrow)
                .cloned()
                .ok_or(DistError::LocalIndexOutOfBounds {
                    index: lrow,
                    len: self.rows.len(),
                });
        }
        let cm = self.col_map.as_ref().ok_or(DistError::MissingColumnMap)?;
        Ok(self
            .local_row(lrow)?
            .iter()
            .map(|&l| cm.my_gids()[l])
            .collect())
    }

    /// `(row_ptr, col_ind)` of the local block. Requires fill-complete.
    pub fn local_csr(&self) -> Result<(&[usize], &[LocalIndex]), DistError> {
        if !self.fill_complete {
            return Err(DistError::NotFillComplete);
        }
        Ok((&self.row_ptr, &self.col_ind))
    }

    // --- redistribution --------------------------------------------------

    /// Rows of `source` moved to the importer's target map. The result is
    /// open. Collective.
    pub fn import_from<C: Communicator>(
        source: &CrsGraph,
        importer: &Import,
        comm: &C,
    ) -> Result<CrsGraph, DistError> {
        Self::redistribute(source, importer, comm)
    }

    /// Rows of `source` pushed to the exporter's target map; rows arriving
    /// from several ranks are merged. The result is open. Collective.
    pub fn export_from<C: Communicator>(
        source: &CrsGraph,
        exporter: &Export,
        comm: &C,
    ) -> Result<CrsGraph, DistError> {
        Self::redistribute(source, exporter, comm)
    }

    fn redistribute<C: Communicator>(
        source: &CrsGraph,
        plan: &TransferPlan,
        comm: &C,
    ) -> Result<CrsGraph, DistError> {
        let check = if !source.fill_complete {
            Err(DistError::NotFillComplete)
        } else if !source.row_map.locally_same_as(plan.source_map()) {
            Err(DistError::IncompatibleMaps(
                "transfer source map is not the graph's row map".into(),
            ))
        } else {
            Ok(())
        };
        agree(comm, check)?;

        let cm = source.col_map.as_ref().ok_or(DistError::MissingColumnMap)?;
        let contributions = plan.transfer_ragged(
            |lid, buf: &mut Vec<u64>| {
                let (s, e) = (source.row_ptr[lid], source.row_ptr[lid + 1]);
                buf.extend(source.col_ind[s..e].iter().map(|&l| cm.my_gids()[l]));
            },
            comm,
        )?;

        let mut target = CrsGraph::new(Arc::clone(plan.target_map()));
        for (lid, cols) in contributions {
            target.rows[lid].extend_from_slice(&cols);
        }
        Ok(target)
    }
}

impl DebugInvariants for CrsGraph {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CrsGraph");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        if !self.fill_complete {
            if self.rows.len() != self.row_map.num_my() {
                return Err(DistError::LocalLengthMismatch {
                    expected: self.row_map.num_my(),
                    got: self.rows.len(),
                });
            }
            return Ok(());
        }
        if self.row_ptr.len() != self.row_map.num_my() + 1 {
            return Err(DistError::LocalLengthMismatch {
                expected: self.row_map.num_my() + 1,
                got: self.row_ptr.len(),
            });
        }
        let ncols = self.col_map.as_ref().map_or(0, |c| c.num_my());
        for w in self.row_ptr.windows(2) {
            let row = &self.col_ind[w[0]..w[1]];
            if row.windows(2).any(|p| p[0] >= p[1]) {
                return Err(DistError::InvalidStructure(
                    "row is not strictly sorted".into(),
                ));
            }
            if let Some(&c) = row.iter().find(|&&c| c >= ncols) {
                return Err(DistError::LocalIndexOutOfBounds { index: c, len: ncols });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn tridiag(n: u64) -> CrsGraph {
        let map = Arc::new(IndexMap::uniform(n, 0, &NoComm).unwrap());
        let mut g = CrsGraph::new(map);
        for i in 0..n {
            let mut cols = vec![i];
            if i > 0 {
                cols.push(i - 1);
            }
            if i + 1 < n {
                cols.push(i + 1);
            }
            g.insert_global_indices(i, &cols).unwrap();
        }
        g
    }

    #[test]
    fn serial_fill_complete_sorts_and_dedups() {
        let mut g = tridiag(4);
        g.insert_global_indices(0, &[1, 0]).unwrap();
        g.fill_complete(&NoComm).unwrap();
        assert!(g.is_fill_complete());
        assert_eq!(g.local_row(0).unwrap(), &[0, 1]);
        assert_eq!(g.local_row(2).unwrap(), &[1, 2, 3]);
        assert_eq!(g.num_my_nonzeros(), 10);
        assert_eq!(g.num_global_nonzeros(), 10);
        assert_eq!(g.max_num_row_entries(), 3);
        assert!(g.importer().is_none());
        assert!(g.exporter().is_none());
        assert!(g.validate_invariants().is_ok());
    }

    #[test]
    fn inserting_after_fill_fails() {
        let mut g = tridiag(2);
        g.fill_complete(&NoComm).unwrap();
        assert_eq!(
            g.insert_global_indices(0, &[1]),
            Err(DistError::AlreadyFillComplete)
        );
        assert_eq!(g.fill_complete(&NoComm), Err(DistError::AlreadyFillComplete));
    }

    #[test]
    fn fixed_column_map_is_enforced() {
        let rows = Arc::new(IndexMap::uniform(2, 0, &NoComm).unwrap());
        let cols = Arc::new(IndexMap::from_gids(None, &[1, 0], 0, &NoComm).unwrap());
        let mut g = CrsGraph::with_col_map(rows, cols);
        assert_eq!(
            g.insert_global_indices(0, &[5]),
            Err(DistError::ColumnNotInColMap(5))
        );
        g.insert_local_indices(1, &[0, 1]).unwrap();
        g.fill_complete(&NoComm).unwrap();
        assert_eq!(g.global_row(1).unwrap(), vec![1, 0]);
        // column map differs from the domain map, so an importer exists
        assert!(g.importer().is_some());
    }

    #[test]
    fn local_indices_need_a_column_map() {
        let mut g = tridiag(2);
        assert_eq!(g.insert_local_indices(0, &[0]), Err(DistError::MissingColumnMap));
    }

    #[test]
    fn unknown_rows_fail_in_serial() {
        let mut g = tridiag(2);
        g.insert_global_indices(9, &[0]).unwrap();
        assert_eq!(g.num_nonlocal_rows(), 1);
        assert_eq!(g.fill_complete(&NoComm), Err(DistError::GlobalIndexNotLocal(9)));
    }

    #[test]
    fn fill_options_from_json() {
        let opts: FillOptions = serde_json::from_str(r#"{"column_ordering":"ByGid"}"#).unwrap();
        assert_eq!(opts.column_ordering, ColumnOrdering::ByGid);
        assert!(!opts.local_rows_only);
    }
}
