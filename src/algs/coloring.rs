//! Distributed distance-1 coloring of a sparse graph (Jones–Plassmann).
//!
//! Every row gets a pseudo-random priority derived from its global index and
//! a seed, so all ranks agree on it without communication. In each round an
//! uncolored row whose priority beats all of its uncolored neighbors takes
//! the smallest color not used by a colored neighbor. Colors of remote
//! neighbors are refreshed through the graph's importer between rounds.
//!
//! The graph must be fill-complete, structurally symmetric, and have its
//! domain map equal to its row map.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algs::collectives::{agree, all_reduce_all, all_reduce_any, all_reduce_max_u64};
use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::distributor::CombineMode;
use crate::graph::CrsGraph;
use crate::map::{Color, GlobalIndex, MapColoring};

const UNCOLORED: Color = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColoringConfig {
    pub rng_seed: u64,
    pub max_rounds: usize,
}

impl Default for ColoringConfig {
    fn default() -> Self {
        Self {
            rng_seed: 42,
            max_rounds: 1000,
        }
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Total order on rows; ties in the hash fall back to the gid.
#[inline]
fn priority(gid: GlobalIndex, seed: u64) -> (u64, GlobalIndex) {
    (splitmix64(gid ^ splitmix64(seed)), gid)
}

/// Colors of the column map, refreshed from the row colors. Collective.
fn halo_colors<C: Communicator>(
    graph: &CrsGraph,
    colors: &[Color],
    comm: &C,
) -> Result<Vec<Color>, DistError> {
    let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
    match graph.importer() {
        Some(imp) => {
            let mut out = vec![UNCOLORED; col_map.num_my()];
            imp.transfer(colors, &mut out, 1, CombineMode::Insert, comm)?;
            Ok(out)
        }
        None => Ok(colors.to_vec()),
    }
}

fn check_input<C: Communicator>(graph: &CrsGraph, comm: &C) -> Result<(), DistError> {
    let check = if !graph.is_fill_complete() {
        Err(DistError::NotFillComplete)
    } else if !graph
        .domain_map()
        .is_some_and(|d| d.locally_same_as(graph.row_map()))
    {
        Err(DistError::IncompatibleMaps(
            "coloring needs the domain map to equal the row map".into(),
        ))
    } else {
        Ok(())
    };
    agree(comm, check)
}

/// Color the rows of `graph` so that no two adjacent rows share a color.
/// Colors are numbered from 0. Collective.
pub fn color_graph<C: Communicator>(
    graph: &CrsGraph,
    config: &ColoringConfig,
    comm: &C,
) -> Result<MapColoring, DistError> {
    check_input(graph, comm)?;
    let row_map = graph.row_map();
    let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
    let seed = config.rng_seed;
    let n = row_map.num_my();
    let mut colors = vec![UNCOLORED; n];

    let mut rounds = 0;
    loop {
        let pending = colors.contains(&UNCOLORED);
        if !all_reduce_any(comm, pending)? {
            break;
        }
        if rounds == config.max_rounds {
            return Err(DistError::ColoringIncomplete { rounds });
        }
        rounds += 1;

        let snapshot = halo_colors(graph, &colors, comm)?;
        let mut used = Vec::new();
        for lrow in 0..n {
            if colors[lrow] != UNCOLORED {
                continue;
            }
            let gid = row_map.my_gids()[lrow];
            let mine = priority(gid, seed);
            used.clear();
            let mut is_max = true;
            for &c in graph.local_row(lrow)? {
                let ngid = col_map.my_gids()[c];
                if ngid == gid {
                    continue;
                }
                match snapshot[c] {
                    UNCOLORED => {
                        if priority(ngid, seed) > mine {
                            is_max = false;
                            break;
                        }
                    }
                    k => used.push(k),
                }
            }
            if is_max {
                used.sort_unstable();
                used.dedup();
                let mut pick = 0;
                for &k in &used {
                    if k == pick {
                        pick += 1;
                    } else if k > pick {
                        break;
                    }
                }
                colors[lrow] = pick;
            }
        }
        log::trace!(
            "rank {}: coloring round {} leaves {} rows uncolored",
            comm.rank(),
            rounds,
            colors.iter().filter(|&&c| c == UNCOLORED).count()
        );
    }

    let max_color = colors.iter().copied().max().map_or(0, |c| c as u64 + 1);
    let num_colors = all_reduce_max_u64(comm, max_color)?;
    log::debug!(
        "rank {}: colored {} rows with {} colors in {} rounds",
        comm.rank(),
        n,
        num_colors,
        rounds
    );
    MapColoring::from_colors(Arc::clone(row_map), colors, UNCOLORED)
}

/// True when every row is colored and no two adjacent rows share a color.
/// Collective.
pub fn is_valid_coloring<C: Communicator>(
    graph: &CrsGraph,
    coloring: &MapColoring,
    comm: &C,
) -> Result<bool, DistError> {
    check_input(graph, comm)?;
    let row_map = graph.row_map();
    let colors = coloring.element_colors();
    agree(
        comm,
        if colors.len() == row_map.num_my() {
            Ok(())
        } else {
            Err(DistError::LocalLengthMismatch {
                expected: row_map.num_my(),
                got: colors.len(),
            })
        },
    )?;
    let col_map = graph.col_map().ok_or(DistError::MissingColumnMap)?;
    let halo = halo_colors(graph, colors, comm)?;

    let mut ok = colors.iter().all(|&c| c >= 0);
    for (lrow, &gid) in row_map.my_gids().iter().enumerate() {
        if !ok {
            break;
        }
        ok = graph
            .local_row(lrow)?
            .iter()
            .all(|&c| col_map.my_gids()[c] == gid || halo[c] != colors[lrow]);
    }
    all_reduce_all(comm, ok)
}
