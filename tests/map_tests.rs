mod util;
use util::*;

use proptest::prelude::*;
use sparse_halo::algs::communicator::{Communicator, NoComm};
use sparse_halo::dist_error::DistError;
use sparse_halo::map::IndexMap;

#[test]
fn uniform_map_over_three_ranks() {
    let out = run_ranks(3, |comm| {
        let m = IndexMap::uniform(10, 0, comm).unwrap();
        let owners = m.remote_index_list(&[0, 5, 9, 10], comm).unwrap();
        (m.my_gids().to_vec(), m.is_distributed(), owners)
    });
    assert_eq!(out[0].0, vec![0, 1, 2, 3]);
    assert_eq!(out[1].0, vec![4, 5, 6]);
    assert_eq!(out[2].0, vec![7, 8, 9]);
    for (_, distributed, owners) in &out {
        assert!(*distributed);
        assert_eq!(owners, &vec![Some((0, 0)), Some((1, 1)), Some((2, 2)), None]);
    }
}

#[test]
fn strided_map_resolves_through_directory() {
    let out = run_ranks(3, |comm| {
        let r = comm.rank() as u64;
        let gids = [r, r + 3, r + 6];
        let m = IndexMap::from_gids(Some(9), &gids, 0, comm).unwrap();
        let owners = m.remote_index_list(&[8, 0, 4, 42], comm).unwrap();
        (m.is_contiguous(), m.is_one_to_one(comm).unwrap(), owners)
    });
    for (contiguous, one_to_one, owners) in out {
        assert!(!contiguous);
        assert!(one_to_one);
        assert_eq!(owners, vec![Some((2, 2)), Some((0, 0)), Some((1, 1)), None]);
    }
}

#[test]
fn overlapping_map_lowest_rank_owns_shared_indices() {
    let out = run_ranks(2, |comm| {
        let gids: &[u64] = if comm.rank() == 0 { &[0, 1, 2] } else { &[2, 3] };
        let m = IndexMap::from_gids(None, gids, 0, comm).unwrap();
        let owner = m.remote_index_list(&[2], comm).unwrap();
        let one_to_one = m.is_one_to_one(comm).unwrap();
        let unique = m.create_one_to_one(comm).unwrap();
        (m.num_global(), owner, one_to_one, unique.my_gids().to_vec())
    });
    assert_eq!(out[0].0, 5);
    assert_eq!(out[0].1, vec![Some((0, 2))]);
    assert!(!out[0].2 && !out[1].2);
    assert_eq!(out[0].3, vec![0, 1, 2]);
    assert_eq!(out[1].3, vec![3]);
}

#[test]
fn tiling_gid_lists_become_contiguous() {
    let out = run_ranks(2, |comm| {
        let gids: &[u64] = if comm.rank() == 0 { &[5, 6] } else { &[7, 8, 9] };
        let m = IndexMap::from_gids(None, gids, 5, comm).unwrap();
        (m.is_contiguous(), m.starts().map(<[u64]>::to_vec))
    });
    for (contiguous, starts) in out {
        assert!(contiguous);
        assert_eq!(starts, Some(vec![5, 7, 10]));
    }
}

#[test]
fn global_count_mismatch_is_reported_everywhere() {
    let out = run_ranks(2, |comm| IndexMap::contiguous(Some(7), 3, 0, comm).map(|_| ()));
    for r in out {
        assert_eq!(
            r,
            Err(DistError::GlobalCountMismatch {
                expected: 7,
                got: 6
            })
        );
    }
}

#[test]
fn duplicate_on_one_rank_fails_collectively() {
    let out = run_ranks(2, |comm| {
        let gids: &[u64] = if comm.rank() == 0 { &[1, 1] } else { &[2] };
        IndexMap::from_gids(None, gids, 0, comm).map(|_| ())
    });
    assert_eq!(out[0], Err(DistError::DuplicateGlobalIndex(1)));
    assert_eq!(out[1], Err(DistError::RemoteFailure { rank: 0 }));
}

#[test]
fn same_as_compares_every_rank() {
    let out = run_ranks(2, |comm| {
        let a = IndexMap::uniform(6, 0, comm).unwrap();
        let b = IndexMap::contiguous(None, 3, 0, comm).unwrap();
        let c = IndexMap::contiguous(None, if comm.rank() == 0 { 2 } else { 4 }, 0, comm).unwrap();
        (
            a.same_as(&b, comm).unwrap(),
            a.same_as(&c, comm).unwrap(),
            a.point_same_as(&c, comm).unwrap(),
        )
    });
    for r in out {
        assert_eq!(r, (true, false, false));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lid_gid_round_trip(gids in proptest::collection::hash_set(0u64..10_000, 0..200)) {
        let gids: Vec<u64> = gids.into_iter().collect();
        let m = IndexMap::from_gids(None, &gids, 0, &NoComm).unwrap();
        prop_assert_eq!(m.num_my(), gids.len());
        for (lid, &g) in gids.iter().enumerate() {
            prop_assert_eq!(m.lid(g), Some(lid));
            prop_assert_eq!(m.gid(lid), Some(g));
        }
        prop_assert_eq!(m.min_my_gid(), gids.iter().copied().min());
        prop_assert_eq!(m.max_my_gid(), gids.iter().copied().max());
    }

    #[test]
    fn uniform_partition_covers_everything(n in 0u64..500, p in 1usize..5) {
        let maps = run_ranks(p, |comm| IndexMap::uniform(n, 1, comm).unwrap());
        let mut all = Vec::new();
        for m in &maps {
            let sizes: Vec<usize> = maps.iter().map(|m| m.num_my()).collect();
            prop_assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
            all.extend_from_slice(m.my_gids());
        }
        prop_assert_eq!(all, (1..=n).collect::<Vec<_>>());
    }
}
