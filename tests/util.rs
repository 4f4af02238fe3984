#![allow(dead_code)]
use std::sync::Arc;

use sparse_halo::algs::communicator::{Communicator, RayonComm};
use sparse_halo::linalg::{CrsMatrix, MultiVector};
use sparse_halo::map::IndexMap;

/// Run `f` once per rank of a fresh `n`-rank world, each on its own thread.
/// Results are returned in rank order.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    let world = RayonComm::world(n);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

pub fn uniform<C: Communicator>(n: u64, comm: &C) -> Arc<IndexMap> {
    Arc::new(IndexMap::uniform(n, 0, comm).unwrap())
}

/// 1-D Laplacian `tridiag(-1, 2, -1)` of global size `map.num_global()`,
/// every rank inserting its own rows.
pub fn laplace_1d<C: Communicator>(map: &Arc<IndexMap>, comm: &C) -> CrsMatrix<f64> {
    let n = map.num_global();
    let mut a = CrsMatrix::new(Arc::clone(map));
    for &i in map.my_gids() {
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
    a.fill_complete(comm).unwrap();
    a
}

/// Single vector with entry `f(gid)` at every local index.
pub fn vector_from(map: &Arc<IndexMap>, f: impl Fn(u64) -> f64) -> MultiVector<f64> {
    let vals = map.my_gids().iter().map(|&g| f(g)).collect();
    MultiVector::from_columns(Arc::clone(map), vec![vals]).unwrap()
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
