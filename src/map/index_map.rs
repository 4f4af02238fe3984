//! IndexMap: bijection between a rank's local indices `0..num_my()` and the
//! global indices it owns.
//!
//! Maps are built collectively and are immutable afterwards; share them with
//! `Arc<IndexMap>`. A map is *contiguous* when rank `r` owns the consecutive
//! range `starts[r]..starts[r + 1]`, in which case owner lookups are answered
//! without communication. Other maps resolve owners through a [`Directory`]
//! that is built on the first lookup and cached.
//!
//! Overlapping maps (an index owned by more than one rank) are allowed; owner
//! lookups resolve such an index to its lowest owning rank.

use bytemuck::{Pod, Zeroable};
use once_cell::sync::OnceCell;

use crate::algs::collectives::{agree, all_gather, all_gather_u64, all_reduce_all};
use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;
use crate::map::{Directory, FastMap};

pub type GlobalIndex = u64;
pub type LocalIndex = usize;

#[derive(Clone, Debug)]
enum LidLookup {
    /// `my_gids` is `first, first + 1, ...`
    Range { first: u64 },
    Table(FastMap<u64, usize>),
}

#[derive(Clone, Debug)]
pub struct IndexMap {
    rank: usize,
    num_ranks: usize,
    num_global: u64,
    index_base: u64,
    my_gids: Vec<GlobalIndex>,
    lookup: LidLookup,
    /// First gid of every rank plus one past the end; contiguous maps only.
    starts: Option<Vec<u64>>,
    my_range: Option<(u64, u64)>,
    all_range: Option<(u64, u64)>,
    distributed: bool,
    directory: OnceCell<Directory>,
}

/// Per-rank summary gathered while building a map from explicit gids.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct RankSummary {
    count: u64,
    first: u64,
    min: u64,
    max: u64,
    consecutive: u64,
}

impl IndexMap {
    /// Linear distribution of `num_global` indices starting at `index_base`;
    /// the first `num_global % size` ranks own one extra index.
    pub fn uniform<C: Communicator>(
        num_global: u64,
        index_base: u64,
        comm: &C,
    ) -> Result<Self, DistError> {
        let p = comm.size() as u64;
        let per = num_global / p;
        let rem = num_global % p;
        let starts: Vec<u64> = (0..=p)
            .map(|r| index_base + r * per + r.min(rem))
            .collect();
        Ok(Self::from_starts(starts, index_base, comm))
    }

    /// Contiguous map with user-chosen local sizes. Collective.
    ///
    /// When `num_global` is given it must equal the sum of `num_my` over ranks.
    pub fn contiguous<C: Communicator>(
        num_global: Option<u64>,
        num_my: usize,
        index_base: u64,
        comm: &C,
    ) -> Result<Self, DistError> {
        let counts = all_gather_u64(comm, num_my as u64)?;
        let total: u64 = counts.iter().sum();
        if let Some(expected) = num_global {
            if expected != total {
                return Err(DistError::GlobalCountMismatch {
                    expected,
                    got: total,
                });
            }
        }
        let mut starts = Vec::with_capacity(counts.len() + 1);
        let mut acc = index_base;
        starts.push(acc);
        for c in counts {
            acc += c;
            starts.push(acc);
        }
        Ok(Self::from_starts(starts, index_base, comm))
    }

    /// Map owning exactly `gids` (in that local order) on this rank. Collective.
    ///
    /// Lists may overlap across ranks but not contain duplicates on one rank.
    /// When `num_global` is given it must equal the sum of the list lengths.
    pub fn from_gids<C: Communicator>(
        num_global: Option<u64>,
        gids: &[GlobalIndex],
        index_base: u64,
        comm: &C,
    ) -> Result<Self, DistError> {
        let local = Self::check_gid_list(gids, index_base);
        let table = agree(comm, local)?;

        let consecutive = gids.windows(2).all(|w| w[1] == w[0] + 1);
        let summary = RankSummary {
            count: (gids.len() as u64).to_le(),
            first: gids.first().copied().unwrap_or(0).to_le(),
            min: gids.iter().copied().min().unwrap_or(u64::MAX).to_le(),
            max: gids.iter().copied().max().unwrap_or(0).to_le(),
            consecutive: (consecutive as u64).to_le(),
        };
        let all = all_gather(comm, summary)?;

        let counts: Vec<u64> = all.iter().map(|s| u64::from_le(s.count)).collect();
        let total: u64 = counts.iter().sum();
        if let Some(expected) = num_global {
            if expected != total {
                return Err(DistError::GlobalCountMismatch {
                    expected,
                    got: total,
                });
            }
        }

        // contiguous when the ranks tile [index_base, index_base + total) in order
        let mut expected_first = index_base;
        let mut tiles = true;
        for s in &all {
            let count = u64::from_le(s.count);
            if count == 0 {
                continue;
            }
            if u64::from_le(s.consecutive) == 0 || u64::from_le(s.first) != expected_first {
                tiles = false;
                break;
            }
            expected_first += count;
        }
        if tiles {
            let mut starts = Vec::with_capacity(counts.len() + 1);
            let mut acc = index_base;
            starts.push(acc);
            for c in &counts {
                acc += c;
                starts.push(acc);
            }
            return Ok(Self::from_starts(starts, index_base, comm));
        }

        let all_range = all
            .iter()
            .filter(|s| u64::from_le(s.count) > 0)
            .fold(None, |acc: Option<(u64, u64)>, s| {
                let (lo, hi) = (u64::from_le(s.min), u64::from_le(s.max));
                Some(match acc {
                    Some((a, b)) => (a.min(lo), b.max(hi)),
                    None => (lo, hi),
                })
            });
        let distributed = comm.size() > 1 && counts.iter().any(|&c| c != total);
        let lookup = match (consecutive, gids.first()) {
            (true, Some(&first)) => LidLookup::Range { first },
            _ => LidLookup::Table(table),
        };
        let map = IndexMap {
            rank: comm.rank(),
            num_ranks: comm.size(),
            num_global: total,
            index_base,
            my_range: gids
                .iter()
                .copied()
                .min()
                .zip(gids.iter().copied().max()),
            my_gids: gids.to_vec(),
            lookup,
            starts: None,
            all_range,
            distributed,
            directory: OnceCell::new(),
        };
        crate::debug_invariants!(map.validate_invariants(), "IndexMap::from_gids");
        Ok(map)
    }

    /// Every rank owns all `num` indices; the map is not distributed.
    pub fn local_replicated<C: Communicator>(
        num: u64,
        index_base: u64,
        comm: &C,
    ) -> Result<Self, DistError> {
        let my_gids: Vec<u64> = (index_base..index_base + num).collect();
        let range = (num > 0).then(|| (index_base, index_base + num - 1));
        Ok(IndexMap {
            rank: comm.rank(),
            num_ranks: comm.size(),
            num_global: num,
            index_base,
            my_gids,
            lookup: LidLookup::Range { first: index_base },
            starts: (comm.size() == 1).then(|| vec![index_base, index_base + num]),
            my_range: range,
            all_range: range,
            distributed: false,
            directory: OnceCell::new(),
        })
    }

    fn from_starts<C: Communicator>(starts: Vec<u64>, index_base: u64, comm: &C) -> Self {
        let me = comm.rank();
        let (lo, hi) = (starts[me], starts[me + 1]);
        let num_global = starts[starts.len() - 1] - starts[0];
        let distributed = starts.windows(2).any(|w| w[1] - w[0] != num_global);
        IndexMap {
            rank: me,
            num_ranks: comm.size(),
            num_global,
            index_base,
            my_gids: (lo..hi).collect(),
            lookup: LidLookup::Range { first: lo },
            my_range: (hi > lo).then(|| (lo, hi - 1)),
            all_range: (num_global > 0).then(|| (index_base, index_base + num_global - 1)),
            starts: Some(starts),
            distributed,
            directory: OnceCell::new(),
        }
    }

    fn check_gid_list(gids: &[u64], index_base: u64) -> Result<FastMap<u64, usize>, DistError> {
        let mut table = FastMap::default();
        table.reserve(gids.len());
        for (lid, &gid) in gids.iter().enumerate() {
            if gid < index_base {
                return Err(DistError::BelowIndexBase { gid, index_base });
            }
            if table.insert(gid, lid).is_some() {
                return Err(DistError::DuplicateGlobalIndex(gid));
            }
        }
        Ok(table)
    }

    // --- local queries ---------------------------------------------------

    pub fn lid(&self, gid: GlobalIndex) -> Option<LocalIndex> {
        match &self.lookup {
            LidLookup::Range { first } => {
                let off = gid.checked_sub(*first)?;
                (off < self.my_gids.len() as u64).then_some(off as usize)
            }
            LidLookup::Table(t) => t.get(&gid).copied(),
        }
    }

    pub fn gid(&self, lid: LocalIndex) -> Option<GlobalIndex> {
        self.my_gids.get(lid).copied()
    }

    pub fn is_my_gid(&self, gid: GlobalIndex) -> bool {
        self.lid(gid).is_some()
    }

    pub fn is_my_lid(&self, lid: LocalIndex) -> bool {
        lid < self.my_gids.len()
    }

    pub fn num_my(&self) -> usize {
        self.my_gids.len()
    }

    /// Sum of the local counts; overlapping indices count once per owner.
    pub fn num_global(&self) -> u64 {
        self.num_global
    }

    pub fn my_gids(&self) -> &[GlobalIndex] {
        &self.my_gids
    }

    pub fn min_my_gid(&self) -> Option<GlobalIndex> {
        self.my_range.map(|r| r.0)
    }

    pub fn max_my_gid(&self) -> Option<GlobalIndex> {
        self.my_range.map(|r| r.1)
    }

    /// Smallest index owned anywhere; the index base for an empty map.
    pub fn min_all_gid(&self) -> GlobalIndex {
        self.all_range.map_or(self.index_base, |r| r.0)
    }

    /// Largest index owned anywhere; the index base for an empty map.
    pub fn max_all_gid(&self) -> GlobalIndex {
        self.all_range.map_or(self.index_base, |r| r.1)
    }

    pub fn index_base(&self) -> u64 {
        self.index_base
    }

    pub fn is_contiguous(&self) -> bool {
        self.starts.is_some()
    }

    /// False when every rank owns every index (or there is one rank).
    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Per-rank starting indices of a contiguous map.
    pub fn starts(&self) -> Option<&[u64]> {
        self.starts.as_deref()
    }

    // --- comparisons -----------------------------------------------------

    /// Same global layout and the same local gid list on this rank.
    pub fn locally_same_as(&self, other: &IndexMap) -> bool {
        std::ptr::eq(self, other)
            || (self.num_global == other.num_global
                && self.index_base == other.index_base
                && self.my_gids == other.my_gids)
    }

    /// Identical ownership on every rank. Collective.
    pub fn same_as<C: Communicator>(&self, other: &IndexMap, comm: &C) -> Result<bool, DistError> {
        all_reduce_all(comm, self.locally_same_as(other))
    }

    /// Same number of local indices on every rank. Collective.
    pub fn point_same_as<C: Communicator>(
        &self,
        other: &IndexMap,
        comm: &C,
    ) -> Result<bool, DistError> {
        let local = self.num_global == other.num_global && self.num_my() == other.num_my();
        all_reduce_all(comm, local)
    }

    // --- ownership -------------------------------------------------------

    /// Owning rank and owner-local index of every gid, `None` for indices no
    /// rank owns. Collective.
    pub fn remote_index_list<C: Communicator>(
        &self,
        gids: &[GlobalIndex],
        comm: &C,
    ) -> Result<Vec<Option<(usize, LocalIndex)>>, DistError> {
        if let Some(starts) = &self.starts {
            return Ok(gids
                .iter()
                .map(|&g| {
                    if g < starts[0] || g >= starts[starts.len() - 1] {
                        return None;
                    }
                    let r = starts.partition_point(|&s| s <= g) - 1;
                    Some((r, (g - starts[r]) as usize))
                })
                .collect());
        }
        let dir = self
            .directory
            .get_or_try_init(|| Directory::build(&self.my_gids, self.all_range, comm))?;
        dir.lookup(gids, comm)
    }

    /// True when no index is owned by more than one rank. Collective.
    pub fn is_one_to_one<C: Communicator>(&self, comm: &C) -> Result<bool, DistError> {
        if self.is_contiguous() {
            return Ok(true);
        }
        let owners = self.remote_index_list(&self.my_gids, comm)?;
        let me = self.rank;
        all_reduce_all(comm, owners.iter().all(|o| matches!(o, Some((r, _)) if *r == me)))
    }

    /// Keep every index only on its lowest owning rank. Collective.
    pub fn create_one_to_one<C: Communicator>(&self, comm: &C) -> Result<IndexMap, DistError> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let owners = self.remote_index_list(&self.my_gids, comm)?;
        let me = self.rank;
        let kept: Vec<u64> = self
            .my_gids
            .iter()
            .zip(&owners)
            .filter(|(_, o)| matches!(o, Some((r, _)) if *r == me))
            .map(|(&g, _)| g)
            .collect();
        Self::from_gids(None, &kept, self.index_base, comm)
    }
}

impl DebugInvariants for IndexMap {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "IndexMap");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        for (lid, &gid) in self.my_gids.iter().enumerate() {
            if gid < self.index_base {
                return Err(DistError::BelowIndexBase {
                    gid,
                    index_base: self.index_base,
                });
            }
            if self.lid(gid) != Some(lid) {
                return Err(DistError::InvalidStructure(format!(
                    "gid {gid} at lid {lid} does not round-trip"
                )));
            }
        }
        if self.my_gids.len() as u64 > self.num_global {
            return Err(DistError::GlobalCountMismatch {
                expected: self.num_global,
                got: self.my_gids.len() as u64,
            });
        }
        if let Some(starts) = &self.starts {
            if starts.len() != self.num_ranks + 1 || starts.windows(2).any(|w| w[0] > w[1]) {
                return Err(DistError::InvalidStructure(
                    "contiguous starts must be non-decreasing with one entry per rank".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use static_assertions::assert_eq_size;

    assert_eq_size!(GlobalIndex, u64);
    assert_eq_size!(Option<std::sync::Arc<IndexMap>>, usize);

    #[test]
    fn uniform_serial() {
        let m = IndexMap::uniform(5, 1, &NoComm).unwrap();
        assert_eq!(m.my_gids(), &[1, 2, 3, 4, 5]);
        assert_eq!(m.lid(3), Some(2));
        assert_eq!(m.lid(0), None);
        assert_eq!(m.gid(4), Some(5));
        assert!(m.is_contiguous());
        assert!(!m.is_distributed());
        assert_eq!((m.min_all_gid(), m.max_all_gid()), (1, 5));
    }

    #[test]
    fn from_gids_rejects_duplicates_and_small_indices() {
        let err = IndexMap::from_gids(None, &[4, 2, 4], 0, &NoComm).unwrap_err();
        assert_eq!(err, DistError::DuplicateGlobalIndex(4));
        let err = IndexMap::from_gids(None, &[4, 0], 1, &NoComm).unwrap_err();
        assert_eq!(
            err,
            DistError::BelowIndexBase {
                gid: 0,
                index_base: 1
            }
        );
    }

    #[test]
    fn scattered_gids_use_a_table() {
        let m = IndexMap::from_gids(None, &[7, 3, 11], 0, &NoComm).unwrap();
        assert!(!m.is_contiguous());
        assert_eq!(m.lid(11), Some(2));
        assert_eq!(m.min_my_gid(), Some(3));
        assert_eq!(m.max_all_gid(), 11);
        let owners = m.remote_index_list(&[3, 4], &NoComm).unwrap();
        assert_eq!(owners, vec![Some((0, 1)), None]);
        assert!(m.validate_invariants().is_ok());
    }

    #[test]
    fn global_count_is_checked() {
        let err = IndexMap::contiguous(Some(4), 3, 0, &NoComm).unwrap_err();
        assert_eq!(
            err,
            DistError::GlobalCountMismatch {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn consecutive_list_is_contiguous() {
        let m = IndexMap::from_gids(Some(3), &[0, 1, 2], 0, &NoComm).unwrap();
        assert!(m.is_contiguous());
        assert!(m.locally_same_as(&IndexMap::uniform(3, 0, &NoComm).unwrap()));
    }

    #[test]
    fn empty_map() {
        let m = IndexMap::uniform(0, 0, &NoComm).unwrap();
        assert_eq!(m.num_my(), 0);
        assert_eq!(m.min_my_gid(), None);
        assert_eq!(m.remote_index_list(&[0], &NoComm).unwrap(), vec![None]);
    }
}
