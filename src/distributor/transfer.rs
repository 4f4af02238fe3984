//! Import and Export: source-map → target-map transfer plans.
//!
//! Both split the target's indices into three groups:
//! * `num_same`: the leading indices that are identical in both maps,
//! * permutes: indices present locally in both maps at different positions,
//! * remotes: indices that travel through a [`Distributor`].
//!
//! An [`Import`] is driven by the target: every target index must be owned by
//! some rank of the source. An [`Export`] is driven by the source: source
//! indices the target does not own anywhere are dropped.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytemuck::Pod;

use crate::algs::collectives::agree;
use crate::algs::communicator::Communicator;
use crate::algs::wire::WireGid;
use crate::dist_error::DistError;
use crate::distributor::combine::{Combinable, CombineMode};
use crate::distributor::plan::Distributor;
use crate::map::{IndexMap, LocalIndex};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    Import,
    Export,
}

/// The precomputed pattern shared by [`Import`] and [`Export`].
#[derive(Clone, Debug)]
pub struct TransferPlan {
    kind: TransferKind,
    source: Arc<IndexMap>,
    target: Arc<IndexMap>,
    num_same: usize,
    permute_from: Vec<LocalIndex>,
    permute_to: Vec<LocalIndex>,
    /// Target lids filled from other ranks, in receive order.
    remote_lids: Vec<LocalIndex>,
    /// Source lids sent to other ranks, in send order.
    export_lids: Vec<LocalIndex>,
    export_ranks: Vec<usize>,
    distributor: Distributor,
}

fn count_same(source: &IndexMap, target: &IndexMap) -> usize {
    source
        .my_gids()
        .iter()
        .zip(target.my_gids())
        .take_while(|(a, b)| a == b)
        .count()
}

impl TransferPlan {
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn source_map(&self) -> &Arc<IndexMap> {
        &self.source
    }

    pub fn target_map(&self) -> &Arc<IndexMap> {
        &self.target
    }

    pub fn num_same(&self) -> usize {
        self.num_same
    }

    pub fn num_permute(&self) -> usize {
        self.permute_from.len()
    }

    pub fn permute_from_lids(&self) -> &[LocalIndex] {
        &self.permute_from
    }

    pub fn permute_to_lids(&self) -> &[LocalIndex] {
        &self.permute_to
    }

    pub fn num_remote(&self) -> usize {
        self.remote_lids.len()
    }

    pub fn remote_lids(&self) -> &[LocalIndex] {
        &self.remote_lids
    }

    pub fn num_export(&self) -> usize {
        self.export_lids.len()
    }

    pub fn export_lids(&self) -> &[LocalIndex] {
        &self.export_lids
    }

    pub fn export_ranks(&self) -> &[usize] {
        &self.export_ranks
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    /// Move `packets` values per index from `src` (laid over the source map)
    /// into `dst` (laid over the target map), merging with `mode`. Collective.
    pub fn transfer<T: Combinable, C: Communicator>(
        &self,
        src: &[T],
        dst: &mut [T],
        packets: usize,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        check_len(src.len(), self.source.num_my() * packets)?;
        check_len(dst.len(), self.target.num_my() * packets)?;
        let p = packets;

        let same = self.num_same * p;
        mode.apply_slice(&mut dst[..same], &src[..same]);
        for (&from, &to) in self.permute_from.iter().zip(&self.permute_to) {
            mode.apply_slice(&mut dst[to * p..(to + 1) * p], &src[from * p..(from + 1) * p]);
        }

        let mut exports = Vec::with_capacity(self.export_lids.len() * p);
        for &lid in &self.export_lids {
            exports.extend_from_slice(&src[lid * p..(lid + 1) * p]);
        }
        let imports = self.distributor.do_posts_and_waits(&exports, p, comm)?;
        for (k, &lid) in self.remote_lids.iter().enumerate() {
            mode.apply_slice(&mut dst[lid * p..(lid + 1) * p], &imports[k * p..(k + 1) * p]);
        }
        Ok(())
    }

    /// The transpose of [`transfer`](Self::transfer): `src` is laid over the
    /// target map, `dst` over the source map. Collective.
    pub fn reverse_transfer<T: Combinable, C: Communicator>(
        &self,
        src: &[T],
        dst: &mut [T],
        packets: usize,
        mode: CombineMode,
        comm: &C,
    ) -> Result<(), DistError> {
        check_len(src.len(), self.target.num_my() * packets)?;
        check_len(dst.len(), self.source.num_my() * packets)?;
        let p = packets;

        let same = self.num_same * p;
        mode.apply_slice(&mut dst[..same], &src[..same]);
        for (&from, &to) in self.permute_from.iter().zip(&self.permute_to) {
            mode.apply_slice(&mut dst[from * p..(from + 1) * p], &src[to * p..(to + 1) * p]);
        }

        let mut exports = Vec::with_capacity(self.remote_lids.len() * p);
        for &lid in &self.remote_lids {
            exports.extend_from_slice(&src[lid * p..(lid + 1) * p]);
        }
        let imports = self.distributor.do_reverse_posts_and_waits(&exports, p, comm)?;
        for (k, &lid) in self.export_lids.iter().enumerate() {
            mode.apply_slice(&mut dst[lid * p..(lid + 1) * p], &imports[k * p..(k + 1) * p]);
        }
        Ok(())
    }
}

/// Contributions of a ragged transfer: target lid and the incoming list.
pub type RaggedContribution<T> = (LocalIndex, Vec<T>);

impl TransferPlan {
    /// Forward transfer of one variable-length list per index.
    ///
    /// `pack(source_lid, buf)` appends the list of a source index to `buf`.
    /// Returns every contribution for the target (same and permuted indices
    /// first, then remote ones in receive order); several contributions may
    /// name the same target lid. Collective.
    pub fn transfer_ragged<T, C, F>(
        &self,
        pack: F,
        comm: &C,
    ) -> Result<Vec<RaggedContribution<T>>, DistError>
    where
        T: Pod,
        C: Communicator,
        F: Fn(LocalIndex, &mut Vec<T>),
    {
        let mut out = self.local_ragged(|lid| {
            let mut v = Vec::new();
            pack(lid, &mut v);
            v
        });

        let mut buf = Vec::new();
        let mut sizes = Vec::with_capacity(self.export_lids.len());
        for &lid in &self.export_lids {
            let before = buf.len();
            pack(lid, &mut buf);
            sizes.push(buf.len() - before);
        }
        let (imports, import_sizes) = self.distributor.do_posts_and_waits_var(&buf, &sizes, comm)?;
        let mut offset = 0;
        for (&lid, &n) in self.remote_lids.iter().zip(&import_sizes) {
            out.push((lid, imports[offset..offset + n].to_vec()));
            offset += n;
        }
        Ok(out)
    }

    /// Like [`transfer_ragged`](Self::transfer_ragged) with two parallel lists
    /// per index (for instance column indices and values). The second list
    /// travels with the sizes learned for the first. Collective.
    pub fn transfer_ragged_pair<A, B, C, F>(
        &self,
        pack: F,
        comm: &C,
    ) -> Result<Vec<(LocalIndex, Vec<A>, Vec<B>)>, DistError>
    where
        A: Pod,
        B: Pod,
        C: Communicator,
        F: Fn(LocalIndex, &mut Vec<A>, &mut Vec<B>),
    {
        let mut out: Vec<(LocalIndex, Vec<A>, Vec<B>)> = self
            .local_ragged(|lid| {
                let (mut a, mut b) = (Vec::new(), Vec::new());
                pack(lid, &mut a, &mut b);
                (a, b)
            })
            .into_iter()
            .map(|(lid, (a, b))| (lid, a, b))
            .collect();

        let (mut a_buf, mut b_buf) = (Vec::new(), Vec::new());
        let mut sizes = Vec::with_capacity(self.export_lids.len());
        let mut ragged = false;
        for &lid in &self.export_lids {
            let (a0, b0) = (a_buf.len(), b_buf.len());
            pack(lid, &mut a_buf, &mut b_buf);
            let n = a_buf.len() - a0;
            ragged |= b_buf.len() - b0 != n;
            sizes.push(n);
        }
        agree(
            comm,
            if ragged {
                Err(DistError::InvalidStructure(
                    "paired lists of one index differ in length".into(),
                ))
            } else {
                Ok(())
            },
        )?;

        let (a_imp, import_sizes) = self.distributor.do_posts_and_waits_var(&a_buf, &sizes, comm)?;
        let b_imp = self
            .distributor
            .do_posts_and_waits_known(&b_buf, &sizes, &import_sizes, comm)?;
        let mut offset = 0;
        for (&lid, &n) in self.remote_lids.iter().zip(&import_sizes) {
            out.push((
                lid,
                a_imp[offset..offset + n].to_vec(),
                b_imp[offset..offset + n].to_vec(),
            ));
            offset += n;
        }
        Ok(out)
    }

    fn local_ragged<V>(&self, mut take: impl FnMut(LocalIndex) -> V) -> Vec<(LocalIndex, V)> {
        let mut out = Vec::with_capacity(self.num_same + self.permute_from.len());
        for lid in 0..self.num_same {
            out.push((lid, take(lid)));
        }
        for (&from, &to) in self.permute_from.iter().zip(&self.permute_to) {
            out.push((to, take(from)));
        }
        out
    }
}

fn check_len(got: usize, expected: usize) -> Result<(), DistError> {
    if got != expected {
        return Err(DistError::LocalLengthMismatch { expected, got });
    }
    Ok(())
}

/// Pull target indices from their source owners.
#[derive(Clone, Debug)]
pub struct Import {
    plan: TransferPlan,
}

impl Import {
    /// Collective. Fails on every rank if some target index has no owner in
    /// the source map.
    pub fn new<C: Communicator>(
        source: Arc<IndexMap>,
        target: Arc<IndexMap>,
        comm: &C,
    ) -> Result<Self, DistError> {
        let num_same = count_same(&source, &target);

        let mut permute_from = Vec::new();
        let mut permute_to = Vec::new();
        let mut remote_gids = Vec::new();
        let mut remote_lids = Vec::new();
        for (tlid, &gid) in target.my_gids().iter().enumerate().skip(num_same) {
            match source.lid(gid) {
                Some(slid) => {
                    permute_from.push(slid);
                    permute_to.push(tlid);
                }
                None => {
                    remote_gids.push(gid);
                    remote_lids.push(tlid);
                }
            }
        }

        let owners = if source.is_distributed() {
            source.remote_index_list(&remote_gids, comm)?
        } else {
            vec![None; remote_gids.len()]
        };
        let remote_ranks: Result<Vec<usize>, DistError> = remote_gids
            .iter()
            .zip(&owners)
            .map(|(&g, o)| o.map(|(r, _)| r).ok_or(DistError::UnknownGlobalIndex(g)))
            .collect();
        let remote_ranks = agree(comm, remote_ranks)?;

        // group remotes by owning rank, keeping target order within a rank
        let mut order: Vec<usize> = (0..remote_gids.len()).collect();
        order.sort_by_key(|&k| remote_ranks[k]);
        let remote_gids: Vec<u64> = order.iter().map(|&k| remote_gids[k]).collect();
        let remote_lids: Vec<usize> = order.iter().map(|&k| remote_lids[k]).collect();
        let remote_ranks: Vec<usize> = order.iter().map(|&k| remote_ranks[k]).collect();

        let (distributor, export_gids, export_ranks) =
            Distributor::create_from_recvs(&remote_gids, &remote_ranks, comm)?;
        let export_lids: Result<Vec<usize>, DistError> = export_gids
            .iter()
            .map(|&g| source.lid(g).ok_or(DistError::GlobalIndexNotLocal(g)))
            .collect();
        let export_lids = agree(comm, export_lids)?;

        log::debug!(
            "rank {}: import same={} permute={} remote={} export={}",
            comm.rank(),
            num_same,
            permute_from.len(),
            remote_lids.len(),
            export_lids.len()
        );
        Ok(Import {
            plan: TransferPlan {
                kind: TransferKind::Import,
                source,
                target,
                num_same,
                permute_from,
                permute_to,
                remote_lids,
                export_lids,
                export_ranks,
                distributor,
            },
        })
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }
}

impl Deref for Import {
    type Target = TransferPlan;

    fn deref(&self) -> &TransferPlan {
        &self.plan
    }
}

/// Push source indices to their target owners.
#[derive(Clone, Debug)]
pub struct Export {
    plan: TransferPlan,
}

impl Export {
    /// Collective. Source indices owned by no rank of the target are dropped.
    pub fn new<C: Communicator>(
        source: Arc<IndexMap>,
        target: Arc<IndexMap>,
        comm: &C,
    ) -> Result<Self, DistError> {
        let num_same = count_same(&source, &target);

        let mut permute_from = Vec::new();
        let mut permute_to = Vec::new();
        let mut candidate_gids = Vec::new();
        let mut candidate_lids = Vec::new();
        for (slid, &gid) in source.my_gids().iter().enumerate().skip(num_same) {
            match target.lid(gid) {
                Some(tlid) => {
                    permute_from.push(slid);
                    permute_to.push(tlid);
                }
                None => {
                    candidate_gids.push(gid);
                    candidate_lids.push(slid);
                }
            }
        }

        let owners = if target.is_distributed() {
            target.remote_index_list(&candidate_gids, comm)?
        } else {
            vec![None; candidate_gids.len()]
        };

        let mut exports: Vec<(usize, u64, usize)> = Vec::with_capacity(candidate_gids.len());
        let mut dropped = 0usize;
        for ((&gid, &slid), owner) in candidate_gids.iter().zip(&candidate_lids).zip(&owners) {
            match owner {
                Some((rank, _)) => exports.push((*rank, gid, slid)),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log::warn!(
                "rank {}: export drops {dropped} source indices not owned by the target map",
                comm.rank()
            );
        }
        exports.sort_by_key(|e| e.0);
        let export_ranks: Vec<usize> = exports.iter().map(|e| e.0).collect();
        let export_gids: Vec<WireGid> = exports.iter().map(|e| WireGid::of(e.1)).collect();
        let export_lids: Vec<usize> = exports.iter().map(|e| e.2).collect();

        let distributor = Distributor::create_from_sends(&export_ranks, comm)?;
        let incoming = distributor.do_posts_and_waits(&export_gids, 1, comm)?;
        let remote_lids: Result<Vec<usize>, DistError> = incoming
            .iter()
            .map(|w| target.lid(w.get()).ok_or(DistError::GlobalIndexNotLocal(w.get())))
            .collect();
        let remote_lids = agree(comm, remote_lids)?;

        log::debug!(
            "rank {}: export same={} permute={} remote={} export={}",
            comm.rank(),
            num_same,
            permute_from.len(),
            remote_lids.len(),
            export_lids.len()
        );
        Ok(Export {
            plan: TransferPlan {
                kind: TransferKind::Export,
                source,
                target,
                num_same,
                permute_from,
                permute_to,
                remote_lids,
                export_lids,
                export_ranks,
                distributor,
            },
        })
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }
}

impl Deref for Export {
    type Target = TransferPlan;

    fn deref(&self) -> &TransferPlan {
        &self.plan
    }
}

impl fmt::Display for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} on rank {}", self.kind, self.source.rank())?;
        writeln!(f, " numSame: {}", self.num_same)?;
        writeln!(f, " permuteFrom: {:?}", self.permute_from)?;
        writeln!(f, " permuteTo: {:?}", self.permute_to)?;
        writeln!(f, " remoteLIDs: {:?}", self.remote_lids)?;
        writeln!(f, " exportLIDs: {:?}", self.export_lids)?;
        write!(f, " exportRanks: {:?}", self.export_ranks)
    }
}
