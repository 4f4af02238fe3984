mod util;
use util::*;

use std::sync::Arc;

use sparse_halo::algs::communicator::Communicator;
use sparse_halo::dist_error::DistError;
use sparse_halo::distributor::{CombineMode, Export, Import, TransferKind};
use sparse_halo::linalg::MultiVector;
use sparse_halo::map::IndexMap;

/// Rank `r` of three owns `3r..3r+3` plus one ghost on each side (periodic).
fn ghosted_map<C: Communicator>(comm: &C) -> Arc<IndexMap> {
    let r = comm.rank() as u64;
    let gids = [3 * r, 3 * r + 1, 3 * r + 2, (3 * r + 3) % 9, (3 * r + 8) % 9];
    Arc::new(IndexMap::from_gids(None, &gids, 0, comm).unwrap())
}

#[test]
fn import_fills_ghosts() {
    let out = run_ranks(3, |comm| {
        let owned = uniform(9, comm);
        let ghosted = ghosted_map(comm);
        let imp = Import::new(Arc::clone(&owned), Arc::clone(&ghosted), comm).unwrap();
        let x = vector_from(&owned, |g| g as f64 * 1.5);
        let mut y = MultiVector::vector(Arc::clone(&ghosted));
        y.import(&x, &imp, CombineMode::Insert, comm).unwrap();
        (
            imp.kind(),
            imp.num_same(),
            imp.num_permute(),
            imp.remote_lids().to_vec(),
            ghosted.my_gids().to_vec(),
            y.col(0).to_vec(),
        )
    });
    for (kind, same, permute, remote, gids, values) in out {
        assert_eq!(kind, TransferKind::Import);
        assert_eq!((same, permute), (3, 0));
        assert_permutation(&remote, &[3, 4]);
        let expected: Vec<f64> = gids.iter().map(|&g| g as f64 * 1.5).collect();
        assert_eq!(values, expected);
    }
}

#[test]
fn remotes_are_grouped_by_owner() {
    let out = run_ranks(3, |comm| {
        let imp = Import::new(uniform(9, comm), ghosted_map(comm), comm).unwrap();
        let ranks: Vec<usize> = imp
            .remote_lids()
            .iter()
            .map(|&l| (imp.target_map().my_gids()[l] / 3) as usize)
            .collect();
        ranks
    });
    for ranks in out {
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{ranks:?}");
    }
}

#[test]
fn export_add_sums_shared_contributions() {
    let out = run_ranks(3, |comm| {
        let owned = uniform(9, comm);
        let ghosted = ghosted_map(comm);
        let exp = Export::new(Arc::clone(&ghosted), Arc::clone(&owned), comm).unwrap();
        let mut ones = MultiVector::vector(Arc::clone(&ghosted));
        ones.put_scalar(1.0);
        let mut y = MultiVector::vector(Arc::clone(&owned));
        y.export(&ones, &exp, CombineMode::Add, comm).unwrap();
        (exp.kind(), y.col(0).to_vec())
    });
    for (kind, values) in out {
        assert_eq!(kind, TransferKind::Export);
        assert_eq!(values, vec![2.0, 1.0, 2.0]);
    }
}

#[test]
fn export_abs_max_and_zero() {
    let out = run_ranks(3, |comm| {
        let owned = uniform(9, comm);
        let ghosted = ghosted_map(comm);
        let exp = Export::new(Arc::clone(&ghosted), Arc::clone(&owned), comm).unwrap();
        // owned entries carry 0.5, ghosts carry -(rank + 1)
        let r = comm.rank() as f64;
        let src = MultiVector::from_columns(
            Arc::clone(&ghosted),
            vec![vec![0.5, 0.5, 0.5, -(r + 1.0), -(r + 1.0)]],
        )
        .unwrap();
        let mut y = MultiVector::vector(Arc::clone(&owned));
        y.export(&src, &exp, CombineMode::AbsMax, comm).unwrap();
        let abs_max = y.col(0).to_vec();

        let mut z = MultiVector::vector(Arc::clone(&owned));
        z.put_scalar(3.0);
        z.export(&src, &exp, CombineMode::Zero, comm).unwrap();
        (abs_max, z.col(0).to_vec())
    });
    // first entry of rank r is ghosted by rank r-1, last by rank r+1
    assert_eq!(out[0].0, vec![3.0, 0.5, 2.0]);
    assert_eq!(out[1].0, vec![1.0, 0.5, 3.0]);
    assert_eq!(out[2].0, vec![2.0, 0.5, 1.0]);
    for (_, zeros) in &out {
        assert_eq!(zeros, &vec![0.0; 3]);
    }
}

#[test]
fn reverse_import_accumulates_ghost_contributions() {
    let out = run_ranks(3, |comm| {
        let owned = uniform(9, comm);
        let ghosted = ghosted_map(comm);
        let imp = Import::new(Arc::clone(&owned), Arc::clone(&ghosted), comm).unwrap();
        let mut g = MultiVector::vector(Arc::clone(&ghosted));
        g.put_scalar(1.0);
        let mut y = MultiVector::vector(owned);
        y.import_reverse(&g, &imp, CombineMode::Add, comm).unwrap();
        y.col(0).to_vec()
    });
    for values in out {
        assert_eq!(values, vec![2.0, 1.0, 2.0]);
    }
}

#[test]
fn permuted_target_is_served_locally() {
    let out = run_ranks(2, |comm| {
        let owned = uniform(4, comm);
        let reversed: Vec<u64> = owned.my_gids().iter().rev().copied().collect();
        let target = Arc::new(IndexMap::from_gids(None, &reversed, 0, comm).unwrap());
        let imp = Import::new(Arc::clone(&owned), Arc::clone(&target), comm).unwrap();
        let x = vector_from(&owned, |g| g as f64);
        let mut y = MultiVector::vector(target);
        y.import(&x, &imp, CombineMode::Insert, comm).unwrap();
        (imp.num_same(), imp.num_permute(), imp.num_remote(), y.col(0).to_vec())
    });
    assert_eq!(out[0], (0, 2, 0, vec![1.0, 0.0]));
    assert_eq!(out[1], (0, 2, 0, vec![3.0, 2.0]));
}

#[test]
fn unknown_target_index_fails_everywhere() {
    let out = run_ranks(2, |comm| {
        let owned = uniform(4, comm);
        let gids: &[u64] = if comm.rank() == 0 { &[0, 99] } else { &[2] };
        let target = Arc::new(IndexMap::from_gids(None, gids, 0, comm).unwrap());
        Import::new(owned, target, comm).map(|_| ())
    });
    assert_eq!(out[0], Err(DistError::UnknownGlobalIndex(99)));
    assert_eq!(out[1], Err(DistError::RemoteFailure { rank: 0 }));
}

#[test]
fn multivector_columns_move_together() {
    let out = run_ranks(3, |comm| {
        let owned = uniform(9, comm);
        let ghosted = ghosted_map(comm);
        let imp = Import::new(Arc::clone(&owned), Arc::clone(&ghosted), comm).unwrap();
        let cols: Vec<Vec<f64>> = (0..3)
            .map(|j| owned.my_gids().iter().map(|&g| (10 * j) as f64 + g as f64).collect())
            .collect();
        let x = MultiVector::from_columns(Arc::clone(&owned), cols).unwrap();
        let mut y = MultiVector::new(Arc::clone(&ghosted), 3);
        y.import(&x, &imp, CombineMode::Insert, comm).unwrap();
        (ghosted.my_gids().to_vec(), (0..3).map(|j| y.col(j).to_vec()).collect::<Vec<_>>())
    });
    for (gids, cols) in out {
        for (j, col) in cols.iter().enumerate() {
            let expected: Vec<f64> = gids.iter().map(|&g| (10 * j) as f64 + g as f64).collect();
            assert_eq!(col, &expected);
        }
    }
}
