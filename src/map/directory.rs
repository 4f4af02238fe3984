//! Distributed directory answering "who owns global index `g`, at which lid".
//!
//! The global range `[min_all_gid, max_all_gid]` is block distributed over the
//! ranks. Every owner registers its indices with the directory rank of each
//! index; lookups are routed to the directory rank and the answers come back
//! through the reverse of the lookup plan.

use crate::algs::collectives::agree;
use crate::algs::communicator::Communicator;
use crate::algs::wire::{WireDirEntry, WireGid, WireOwner};
use crate::dist_error::DistError;
use crate::distributor::Distributor;
use crate::map::FastMap;

#[derive(Clone, Debug)]
pub struct Directory {
    min_gid: u64,
    /// Number of indices in the directory range; 0 for an empty map.
    span: u64,
    num_ranks: usize,
    /// Entries this rank is directory for: gid -> (owner rank, owner lid).
    /// Overlapping maps keep the lowest owning rank.
    entries: FastMap<u64, (usize, usize)>,
}

impl Directory {
    /// Collective. `my_gids[lid]` are the indices this rank owns; `range` is
    /// the global `(min, max)` over all ranks, `None` for an empty map.
    pub fn build<C: Communicator>(
        my_gids: &[u64],
        range: Option<(u64, u64)>,
        comm: &C,
    ) -> Result<Self, DistError> {
        let (min_gid, span) = match range {
            Some((lo, hi)) if hi >= lo => (lo, hi - lo + 1),
            _ => (0, 0),
        };
        let mut dir = Directory {
            min_gid,
            span,
            num_ranks: comm.size(),
            entries: FastMap::default(),
        };

        let me = comm.rank();
        let dest: Result<Vec<usize>, DistError> = my_gids
            .iter()
            .map(|&gid| dir.directory_rank(gid).ok_or(DistError::UnknownGlobalIndex(gid)))
            .collect();
        let dest = agree(comm, dest)?;
        let records: Vec<WireDirEntry> = my_gids
            .iter()
            .enumerate()
            .map(|(lid, &gid)| WireDirEntry::new(gid, me, lid))
            .collect();

        let plan = Distributor::create_from_sends(&dest, comm)?;
        let registered = plan.do_posts_and_waits(&records, 1, comm)?;
        for rec in &registered {
            let (gid, rank, lid) = rec.decode();
            dir.entries
                .entry(gid)
                .and_modify(|cur| {
                    if rank < cur.0 {
                        *cur = (rank, lid);
                    }
                })
                .or_insert((rank, lid));
        }
        log::debug!(
            "rank {me}: directory holds {} of {} indices",
            dir.entries.len(),
            dir.span
        );
        Ok(dir)
    }

    /// Rank that holds the directory entry of `gid`, if `gid` is in range.
    pub fn directory_rank(&self, gid: u64) -> Option<usize> {
        if gid < self.min_gid || gid - self.min_gid >= self.span {
            return None;
        }
        let offset = gid - self.min_gid;
        let p = self.num_ranks as u64;
        let per = self.span / p;
        let rem = self.span % p;
        // the first `rem` ranks hold `per + 1` entries
        let big = rem * (per + 1);
        let r = if offset < big {
            offset / (per + 1)
        } else {
            rem + (offset - big) / per.max(1)
        };
        Some(r as usize)
    }

    /// Owner rank and owner lid of every gid, `None` for unknown ones.
    /// Collective.
    pub fn lookup<C: Communicator>(
        &self,
        gids: &[u64],
        comm: &C,
    ) -> Result<Vec<Option<(usize, usize)>>, DistError> {
        // out-of-range gids are answered locally, the rest by their directory rank
        let mut routed = Vec::with_capacity(gids.len());
        let mut dest = Vec::with_capacity(gids.len());
        let mut queries = Vec::with_capacity(gids.len());
        for (i, &gid) in gids.iter().enumerate() {
            if let Some(d) = self.directory_rank(gid) {
                routed.push(i);
                dest.push(d);
                queries.push(WireGid::of(gid));
            }
        }

        let plan = Distributor::create_from_sends(&dest, comm)?;
        let incoming = plan.do_posts_and_waits(&queries, 1, comm)?;
        let answers: Vec<WireOwner> = incoming
            .iter()
            .map(|q| match self.entries.get(&q.get()) {
                Some(&(rank, lid)) => WireOwner::found(rank, lid),
                None => WireOwner::missing(),
            })
            .collect();
        let replies = plan.do_reverse_posts_and_waits(&answers, 1, comm)?;

        let mut out = vec![None; gids.len()];
        for (&i, reply) in routed.iter().zip(&replies) {
            out[i] = reply.get();
        }
        Ok(out)
    }

    pub fn num_local_entries(&self) -> usize {
        self.entries.len()
    }
}
