//! Overlapping (ghost-row) extension of a fill-complete graph.
//!
//! Level `k + 1` owns every row that level `k` references through its
//! column map. Rows are always imported from the original graph, so the
//! structure of a ghost row is the full original row.

use std::sync::Arc;

use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::distributor::Import;
use crate::graph::crs_graph::{CrsGraph, FillOptions};
use crate::map::IndexMap;

#[derive(Clone, Debug)]
pub struct OverlapGraph {
    graph: CrsGraph,
    importer: Arc<Import>,
    levels: usize,
}

impl OverlapGraph {
    /// The fill-complete overlapping graph.
    pub fn graph(&self) -> &CrsGraph {
        &self.graph
    }

    pub fn into_graph(self) -> CrsGraph {
        self.graph
    }

    /// Owned rows followed by the ghost rows.
    pub fn row_map(&self) -> &Arc<IndexMap> {
        self.graph.row_map()
    }

    /// Original row map → overlapping row map.
    pub fn importer(&self) -> &Arc<Import> {
        &self.importer
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Rows of the overlapping map this rank does not own in the original.
    pub fn num_ghost_rows(&self) -> usize {
        self.importer.num_remote()
    }
}

/// Extend `graph` by `levels` layers of ghost rows. Collective.
///
/// `levels == 0` yields a copy of `graph`. The original domain and range maps
/// are kept, so the overlapping graph exports back onto the range map.
pub fn overlap_graph<C: Communicator>(
    graph: &CrsGraph,
    levels: usize,
    comm: &C,
) -> Result<OverlapGraph, DistError> {
    if !graph.is_fill_complete() {
        return Err(DistError::NotFillComplete);
    }
    let (domain, range) = match (graph.domain_map(), graph.range_map()) {
        (Some(d), Some(r)) => (Arc::clone(d), Arc::clone(r)),
        _ => return Err(DistError::NotFillComplete),
    };

    let mut current = graph.clone();
    let mut importer = Arc::new(Import::new(
        Arc::clone(graph.row_map()),
        Arc::clone(graph.row_map()),
        comm,
    )?);

    for level in 1..=levels {
        let next_rows = match current.col_map() {
            Some(cm) => Arc::clone(cm),
            None => return Err(DistError::MissingColumnMap),
        };
        let imp = Import::new(Arc::clone(graph.row_map()), next_rows, comm)?;
        let mut next = CrsGraph::import_from(graph, &imp, comm)?;
        next.fill_complete_with(
            Arc::clone(&domain),
            Arc::clone(&range),
            &FillOptions::default(),
            comm,
        )?;
        log::debug!(
            "rank {}: overlap level {level}: {} rows ({} ghost)",
            comm.rank(),
            next.num_my_rows(),
            imp.num_remote()
        );
        current = next;
        importer = Arc::new(imp);
    }

    Ok(OverlapGraph {
        graph: current,
        importer,
        levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn serial_overlap_is_a_copy() {
        let map = Arc::new(IndexMap::uniform(3, 0, &NoComm).unwrap());
        let mut g = CrsGraph::new(map);
        for i in 0..3u64 {
            g.insert_global_indices(i, &[i, (i + 1) % 3]).unwrap();
        }
        g.fill_complete(&NoComm).unwrap();

        let ov = overlap_graph(&g, 2, &NoComm).unwrap();
        assert_eq!(ov.levels(), 2);
        assert_eq!(ov.num_ghost_rows(), 0);
        assert_eq!(ov.graph().num_global_nonzeros(), 6);
        assert_eq!(ov.row_map().num_my(), 3);
    }

    #[test]
    fn open_graph_is_rejected() {
        let map = Arc::new(IndexMap::uniform(2, 0, &NoComm).unwrap());
        let g = CrsGraph::new(map);
        assert_eq!(
            overlap_graph(&g, 1, &NoComm).unwrap_err(),
            DistError::NotFillComplete
        );
    }
}
