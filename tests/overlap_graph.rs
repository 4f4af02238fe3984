mod util;
use util::*;

use std::sync::Arc;

use sparse_halo::algs::communicator::Communicator;
use sparse_halo::graph::{CrsGraph, overlap_graph};
use sparse_halo::map::IndexMap;

fn tridiagonal<C: Communicator>(map: &Arc<IndexMap>, comm: &C) -> CrsGraph {
    let n = map.num_global();
    let mut g = CrsGraph::new(Arc::clone(map));
    for &i in map.my_gids() {
        let cols: Vec<u64> = [i.checked_sub(1), Some(i), (i + 1 < n).then_some(i + 1)]
            .into_iter()
            .flatten()
            .collect();
        g.insert_global_indices(i, &cols).unwrap();
    }
    g.fill_complete(comm).unwrap();
    g
}

#[test]
fn one_level_adds_the_neighbor_rows() {
    let out = run_ranks(3, |comm| {
        let map = uniform(9, comm);
        let g = tridiagonal(&map, comm);
        let ov = overlap_graph(&g, 1, comm).unwrap();
        let rows = ov.row_map().my_gids().to_vec();
        let ghost_structure: Vec<Vec<u64>> = rows
            .iter()
            .filter(|&&r| !map.is_my_gid(r))
            .map(|&r| {
                let lrow = ov.row_map().lid(r).unwrap();
                ov.graph().global_row(lrow).unwrap()
            })
            .collect();
        (
            rows,
            ov.num_ghost_rows(),
            ghost_structure,
            ov.graph().exporter().is_some(),
        )
    });
    assert_eq!(out[0].0, vec![0, 1, 2, 3]);
    assert_eq!(out[1].0, vec![3, 4, 5, 2, 6]);
    assert_eq!(out[2].0, vec![6, 7, 8, 5]);
    assert_eq!(out[0].1, 1);
    assert_eq!(out[1].1, 2);
    assert_eq!(out[1].2, vec![vec![1, 2, 3], vec![5, 6, 7]]);
    assert!(out.iter().all(|o| o.3));
}

#[test]
fn levels_grow_the_halo() {
    let out = run_ranks(3, |comm| {
        let map = uniform(9, comm);
        let g = tridiagonal(&map, comm);
        (0..=3)
            .map(|k| {
                let ov = overlap_graph(&g, k, comm).unwrap();
                assert_eq!(ov.levels(), k);
                let mut rows = ov.row_map().my_gids().to_vec();
                rows.sort_unstable();
                rows
            })
            .collect::<Vec<_>>()
    });
    assert_eq!(out[1][0], vec![3, 4, 5]);
    assert_eq!(out[1][1], vec![2, 3, 4, 5, 6]);
    assert_eq!(out[1][2], vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(out[1][3], (0..9).collect::<Vec<_>>());
    assert_eq!(out[0][2], vec![0, 1, 2, 3, 4]);
    assert_eq!(out[2][3], vec![3, 4, 5, 6, 7, 8]);
}

#[test]
fn overlap_is_deterministic() {
    let first = run_ranks(2, |comm| {
        let map = uniform(8, comm);
        let g = tridiagonal(&map, comm);
        let ov = overlap_graph(&g, 2, comm).unwrap();
        ov.row_map().my_gids().to_vec()
    });
    for _ in 0..3 {
        let again = run_ranks(2, |comm| {
            let map = uniform(8, comm);
            let g = tridiagonal(&map, comm);
            let ov = overlap_graph(&g, 2, comm).unwrap();
            ov.row_map().my_gids().to_vec()
        });
        assert_eq!(again, first);
    }
}

#[test]
fn ghost_rows_match_the_importer() {
    let out = run_ranks(2, |comm| {
        let map = uniform(6, comm);
        let g = tridiagonal(&map, comm);
        let ov = overlap_graph(&g, 1, comm).unwrap();
        let imp = ov.importer();
        let remote: Vec<u64> = imp
            .remote_lids()
            .iter()
            .map(|&l| ov.row_map().my_gids()[l])
            .collect();
        (remote, imp.num_same())
    });
    assert_eq!(out[0], (vec![3], 3));
    assert_eq!(out[1], (vec![2], 3));
}
