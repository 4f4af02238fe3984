//! Distributor: the gather/scatter plan of one exchange pattern.
//!
//! A plan is built once from the list of destination ranks of this rank's
//! exports (`create_from_sends`) or from the owners of the indices it needs
//! (`create_from_recvs`), and is then executed any number of times.
//!
//! Send side, one entry per destination rank (ascending, self included):
//! `images_to`, `starts_to` (offset of the block in the export buffer, or in the
//! packed send buffer when `indices_to` is set), `lengths_to`. When exports are
//! not grouped by destination, `indices_to[j]` names the export that goes in
//! slot `j` of the packed send buffer.
//!
//! Receive side, one entry per source rank (ascending, self included):
//! `images_from`, `starts_from`, `lengths_from`. Imports land grouped by
//! source rank. When `indices_from` is set (reverse plans of ungrouped
//! forward plans) received slot `j` is scattered to position `indices_from[j]`.
//!
//! The plan is symmetric: rank `a` sends `n` entries to rank `b` exactly when
//! rank `b` expects `n` entries from rank `a`.

use std::borrow::Cow;
use std::fmt;

use bytemuck::Pod;
use itertools::Itertools;
use once_cell::sync::OnceCell;

use crate::algs::collectives::{agree, all_gather_slice};
use crate::algs::communicator::{CommTag, Communicator, DISTRIBUTOR_TAG, PlanTags, Wait};
use crate::algs::wire::{WireCount, WireGidRank, cast_slice, decode_vec};
use crate::debug_invariants::DebugInvariants;
use crate::dist_error::DistError;

#[derive(Clone, Debug)]
pub struct Distributor {
    rank: usize,
    size: usize,
    tags: PlanTags,
    num_exports: usize,
    self_message: bool,

    images_to: Vec<usize>,
    starts_to: Vec<usize>,
    lengths_to: Vec<usize>,
    indices_to: Option<Vec<usize>>,
    max_send_length: usize,

    images_from: Vec<usize>,
    starts_from: Vec<usize>,
    lengths_from: Vec<usize>,
    indices_from: Option<Vec<usize>>,
    total_receive_length: usize,

    reverse: OnceCell<Box<Distributor>>,
}

impl Distributor {
    /// Build a plan from the destination rank of each export.
    ///
    /// Collective. If any rank names an invalid destination, every rank
    /// returns an error.
    pub fn create_from_sends<C: Communicator>(
        export_ranks: &[usize],
        comm: &C,
    ) -> Result<Self, DistError> {
        Self::create_from_sends_with_tags(export_ranks, comm, PlanTags::from_base(DISTRIBUTOR_TAG))
    }

    pub fn create_from_sends_with_tags<C: Communicator>(
        export_ranks: &[usize],
        comm: &C,
        tags: PlanTags,
    ) -> Result<Self, DistError> {
        let me = comm.rank();
        let size = comm.size();

        let bad = export_ranks.iter().copied().find(|&r| r >= size);
        agree(
            comm,
            match bad {
                Some(rank) => Err(DistError::InvalidRank { rank, size }),
                None => Ok(()),
            },
        )?;

        // counts[r] = number of exports to rank r; detect whether exports are
        // grouped by destination without gaps
        let mut counts = vec![0usize; size];
        let mut needs_send_buffer = false;
        for (i, &r) in export_ranks.iter().enumerate() {
            counts[r] += 1;
            if !needs_send_buffer && counts[r] > 1 && export_ranks[i - 1] != r {
                needs_send_buffer = true;
            }
        }
        let self_message = counts[me] != 0;

        let mut images_to = Vec::new();
        let mut starts_to = Vec::new();
        let mut lengths_to = Vec::new();
        let indices_to = if !needs_send_buffer {
            // grouped: each destination's block is contiguous in the exports
            let mut start = 0;
            let mut blocks: Vec<(usize, usize, usize)> = export_ranks
                .iter()
                .dedup_with_count()
                .map(|(n, &r)| {
                    let block = (r, start, n);
                    start += n;
                    block
                })
                .collect();
            blocks.sort_unstable();
            for (r, s, n) in blocks {
                images_to.push(r);
                starts_to.push(s);
                lengths_to.push(n);
            }
            None
        } else {
            // ungrouped: pack into a send buffer ordered by destination
            let mut offsets = vec![0usize; size + 1];
            for r in 0..size {
                offsets[r + 1] = offsets[r] + counts[r];
            }
            for r in (0..size).filter(|&r| counts[r] > 0) {
                images_to.push(r);
                starts_to.push(offsets[r]);
                lengths_to.push(counts[r]);
            }
            let mut cursor = offsets;
            let mut indices = vec![0usize; export_ranks.len()];
            for (i, &r) in export_ranks.iter().enumerate() {
                indices[cursor[r]] = i;
                cursor[r] += 1;
            }
            Some(indices)
        };

        let max_send_length = images_to
            .iter()
            .zip(&lengths_to)
            .filter(|&(&r, _)| r != me)
            .map(|(_, &len)| len)
            .max()
            .unwrap_or(0);

        let mut plan = Distributor {
            rank: me,
            size,
            tags,
            num_exports: export_ranks.len(),
            self_message,
            images_to,
            starts_to,
            lengths_to,
            indices_to,
            max_send_length,
            images_from: Vec::new(),
            starts_from: Vec::new(),
            lengths_from: Vec::new(),
            indices_from: None,
            total_receive_length: 0,
            reverse: OnceCell::new(),
        };
        plan.compute_receives(&counts, comm)?;

        log::debug!(
            "rank {me}: distributor with {} sends ({} exports, grouped={}) and {} receives ({} imports)",
            plan.num_sends(),
            plan.num_exports,
            plan.indices_to.is_none(),
            plan.num_receives(),
            plan.total_receive_length
        );
        crate::debug_invariants!(plan.validate_invariants(), "Distributor::create_from_sends");
        Ok(plan)
    }

    /// Build a plan from the indices this rank needs and their owners.
    ///
    /// Returns the plan together with `(export_gids, export_ranks)`: the
    /// indices *this* rank must send and to whom, in the order the plan
    /// expects them. Remote entries should be grouped by owner so that the
    /// imports arrive in the caller's order.
    pub fn create_from_recvs<C: Communicator>(
        remote_gids: &[u64],
        remote_ranks: &[usize],
        comm: &C,
    ) -> Result<(Self, Vec<u64>, Vec<usize>), DistError> {
        agree(
            comm,
            if remote_gids.len() == remote_ranks.len() {
                Ok(())
            } else {
                Err(DistError::LocalLengthMismatch {
                    expected: remote_gids.len(),
                    got: remote_ranks.len(),
                })
            },
        )?;

        let me = comm.rank();
        let requests: Vec<WireGidRank> = remote_gids
            .iter()
            .map(|&g| WireGidRank::new(g, me))
            .collect();
        let temp = Self::create_from_sends(remote_ranks, comm)?;
        let received = temp.do_posts_and_waits(&requests, 1, comm)?;

        let export_gids: Vec<u64> = received.iter().map(|w| w.gid()).collect();
        let export_ranks: Vec<usize> = received.iter().map(|w| w.rank()).collect();
        let plan = Self::create_from_sends(&export_ranks, comm)?;
        Ok((plan, export_gids, export_ranks))
    }

    fn compute_receives<C: Communicator>(
        &mut self,
        counts: &[usize],
        comm: &C,
    ) -> Result<(), DistError> {
        let me = self.rank;
        let size = self.size;
        let local: Vec<u64> = counts.iter().map(|&c| (c as u64).to_le()).collect();
        let matrix = all_gather_slice(comm, &local)?;

        let mut start = 0usize;
        for src in 0..size {
            let len = u64::from_le(matrix[src * size + me]) as usize;
            if len > 0 {
                self.images_from.push(src);
                self.starts_from.push(start);
                self.lengths_from.push(len);
                start += len;
            }
        }
        self.total_receive_length = start;
        Ok(())
    }

    // --- queries ---------------------------------------------------------

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of export entries the plan was built from.
    pub fn num_exports(&self) -> usize {
        self.num_exports
    }

    /// Number of messages sent to other ranks (self excluded).
    pub fn num_sends(&self) -> usize {
        self.images_to.len() - self.self_message as usize
    }

    /// Number of messages received from other ranks (self excluded).
    pub fn num_receives(&self) -> usize {
        self.images_from.len() - self.self_message as usize
    }

    pub fn has_self_message(&self) -> bool {
        self.self_message
    }

    /// Total number of imported entries (self included).
    pub fn total_receive_length(&self) -> usize {
        self.total_receive_length
    }

    /// Largest message sent to another rank.
    pub fn max_send_length(&self) -> usize {
        self.max_send_length
    }

    pub fn images_to(&self) -> &[usize] {
        &self.images_to
    }

    pub fn lengths_to(&self) -> &[usize] {
        &self.lengths_to
    }

    pub fn starts_to(&self) -> &[usize] {
        &self.starts_to
    }

    pub fn indices_to(&self) -> Option<&[usize]> {
        self.indices_to.as_deref()
    }

    pub fn images_from(&self) -> &[usize] {
        &self.images_from
    }

    pub fn lengths_from(&self) -> &[usize] {
        &self.lengths_from
    }

    pub fn starts_from(&self) -> &[usize] {
        &self.starts_from
    }

    /// The reverse plan (sends and receives swapped), built on first use.
    pub fn reverse(&self) -> &Distributor {
        self.reverse.get_or_init(|| Box::new(self.make_reverse()))
    }

    fn make_reverse(&self) -> Distributor {
        // a packed send slot j of this plan is received back into export
        // position indices_to[j]; scatter lists swap sides
        let max_receive_length = self
            .images_from
            .iter()
            .zip(&self.lengths_from)
            .filter(|&(&r, _)| r != self.rank)
            .map(|(_, &len)| len)
            .max()
            .unwrap_or(0);

        Distributor {
            rank: self.rank,
            size: self.size,
            tags: self.tags.reversed(),
            num_exports: self.total_receive_length,
            self_message: self.self_message,
            images_to: self.images_from.clone(),
            starts_to: self.starts_from.clone(),
            lengths_to: self.lengths_from.clone(),
            indices_to: self.indices_from.clone(),
            max_send_length: max_receive_length,
            images_from: self.images_to.clone(),
            starts_from: self.starts_to.clone(),
            lengths_from: self.lengths_to.clone(),
            indices_from: self.indices_to.clone(),
            total_receive_length: self.num_exports,
            reverse: OnceCell::new(),
        }
    }

    // --- execution -------------------------------------------------------

    /// Send `num_packets` consecutive `T`s per export and return the imports,
    /// grouped by source rank.
    pub fn do_posts_and_waits<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        num_packets: usize,
        comm: &C,
    ) -> Result<Vec<T>, DistError> {
        self.exchange_fixed(exports, num_packets, comm, self.tags.data)
    }

    /// Same as [`do_posts_and_waits`](Self::do_posts_and_waits) through the
    /// reverse plan.
    pub fn do_reverse_posts_and_waits<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        num_packets: usize,
        comm: &C,
    ) -> Result<Vec<T>, DistError> {
        self.reverse().do_posts_and_waits(exports, num_packets, comm)
    }

    /// Variable-size exchange: export `i` consists of `export_sizes[i]`
    /// consecutive `T`s. Sizes travel first, then the data.
    ///
    /// Returns the imports and the size of each imported entry.
    pub fn do_posts_and_waits_var<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        export_sizes: &[usize],
        comm: &C,
    ) -> Result<(Vec<T>, Vec<usize>), DistError> {
        let wire_sizes: Vec<WireCount> = export_sizes.iter().map(|&n| WireCount::new(n)).collect();
        let import_sizes: Vec<usize> = self
            .exchange_fixed(&wire_sizes, 1, comm, self.tags.sizes)?
            .iter()
            .map(WireCount::get)
            .collect();
        let imports = self.do_posts_and_waits_known(exports, export_sizes, &import_sizes, comm)?;
        Ok((imports, import_sizes))
    }

    /// Reverse-plan counterpart of [`do_posts_and_waits_var`](Self::do_posts_and_waits_var).
    pub fn do_reverse_posts_and_waits_var<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        export_sizes: &[usize],
        comm: &C,
    ) -> Result<(Vec<T>, Vec<usize>), DistError> {
        self.reverse().do_posts_and_waits_var(exports, export_sizes, comm)
    }

    /// Variable-size exchange when the import sizes are already known (for
    /// instance a second payload with the same shape as a previous one).
    pub fn do_posts_and_waits_known<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        export_sizes: &[usize],
        import_sizes: &[usize],
        comm: &C,
    ) -> Result<Vec<T>, DistError> {
        if export_sizes.len() != self.num_exports {
            return Err(DistError::LocalLengthMismatch {
                expected: self.num_exports,
                got: export_sizes.len(),
            });
        }
        let export_offsets = prefix_sum(export_sizes);
        if exports.len() != export_offsets[export_sizes.len()] {
            return Err(DistError::LocalLengthMismatch {
                expected: export_offsets[export_sizes.len()],
                got: exports.len(),
            });
        }
        if import_sizes.len() != self.total_receive_length {
            return Err(DistError::LocalLengthMismatch {
                expected: self.total_receive_length,
                got: import_sizes.len(),
            });
        }

        // sizes in the order entries come off the wire
        let slot_sizes: Cow<'_, [usize]> = match &self.indices_from {
            None => Cow::Borrowed(import_sizes),
            Some(idx) => Cow::Owned(idx.iter().map(|&pos| import_sizes[pos]).collect()),
        };
        let slot_offsets = prefix_sum(&slot_sizes);
        let layout: Vec<(usize, usize)> = self
            .starts_from
            .iter()
            .zip(&self.lengths_from)
            .map(|(&s, &len)| (slot_offsets[s], slot_offsets[s + len] - slot_offsets[s]))
            .collect();

        let received = self.exchange(
            comm,
            self.tags.data,
            |p| self.send_block_var(exports, &export_offsets, p),
            &layout,
            slot_offsets[slot_sizes.len()],
        )?;

        match &self.indices_from {
            None => Ok(received),
            Some(idx) => {
                let out_offsets = prefix_sum(import_sizes);
                let mut out = vec![T::zeroed(); received.len()];
                for (slot, &pos) in idx.iter().enumerate() {
                    let n = slot_sizes[slot];
                    let from = slot_offsets[slot];
                    out[out_offsets[pos]..out_offsets[pos] + n]
                        .copy_from_slice(&received[from..from + n]);
                }
                Ok(out)
            }
        }
    }

    fn exchange_fixed<T: Pod, C: Communicator>(
        &self,
        exports: &[T],
        num_packets: usize,
        comm: &C,
        tag: CommTag,
    ) -> Result<Vec<T>, DistError> {
        if exports.len() != self.num_exports * num_packets {
            return Err(DistError::LocalLengthMismatch {
                expected: self.num_exports * num_packets,
                got: exports.len(),
            });
        }
        let layout: Vec<(usize, usize)> = self
            .starts_from
            .iter()
            .zip(&self.lengths_from)
            .map(|(&s, &len)| (s * num_packets, len * num_packets))
            .collect();
        let received = self.exchange(
            comm,
            tag,
            |p| self.send_block_fixed(exports, num_packets, p),
            &layout,
            self.total_receive_length * num_packets,
        )?;

        match &self.indices_from {
            None => Ok(received),
            Some(idx) => {
                let mut out = vec![T::zeroed(); received.len()];
                for (slot, &pos) in idx.iter().enumerate() {
                    out[pos * num_packets..(pos + 1) * num_packets]
                        .copy_from_slice(&received[slot * num_packets..(slot + 1) * num_packets]);
                }
                Ok(out)
            }
        }
    }

    fn send_block_fixed<'a, T: Pod>(&self, exports: &'a [T], np: usize, p: usize) -> Cow<'a, [T]> {
        let start = self.starts_to[p];
        let len = self.lengths_to[p];
        match &self.indices_to {
            None => Cow::Borrowed(&exports[start * np..(start + len) * np]),
            Some(idx) => {
                let mut buf = Vec::with_capacity(len * np);
                for &i in &idx[start..start + len] {
                    buf.extend_from_slice(&exports[i * np..(i + 1) * np]);
                }
                Cow::Owned(buf)
            }
        }
    }

    fn send_block_var<'a, T: Pod>(
        &self,
        exports: &'a [T],
        offsets: &[usize],
        p: usize,
    ) -> Cow<'a, [T]> {
        let start = self.starts_to[p];
        let len = self.lengths_to[p];
        match &self.indices_to {
            None => Cow::Borrowed(&exports[offsets[start]..offsets[start + len]]),
            Some(idx) => {
                let mut buf = Vec::new();
                for &i in &idx[start..start + len] {
                    buf.extend_from_slice(&exports[offsets[i]..offsets[i + 1]]);
                }
                Cow::Owned(buf)
            }
        }
    }

    /// Post all receives, send every block, copy the self block, then wait.
    ///
    /// `layout[q]` is the `(offset, count)` of source `q`'s block in the
    /// returned buffer. Every handle is drained before an error is reported.
    fn exchange<'a, T, C, F>(
        &self,
        comm: &C,
        tag: CommTag,
        send_block: F,
        layout: &[(usize, usize)],
        total: usize,
    ) -> Result<Vec<T>, DistError>
    where
        T: Pod,
        C: Communicator,
        F: Fn(usize) -> Cow<'a, [T]>,
    {
        let me = self.rank;
        let elem = std::mem::size_of::<T>();
        let mut imports = vec![T::zeroed(); total];

        // 1) post receives from every other source
        let mut pending_recvs = Vec::with_capacity(self.images_from.len());
        for (q, &src) in self.images_from.iter().enumerate() {
            if src == me {
                continue;
            }
            let mut scratch = vec![0u8; layout[q].1 * elem];
            pending_recvs.push((q, src, comm.irecv(src, tag.as_u16(), &mut scratch)));
        }

        // 2) send, starting with the first destination above this rank to
        //    spread message traffic
        let n_to = self.images_to.len();
        let first = self.images_to.iter().position(|&r| r > me).unwrap_or(0);
        let mut pending_sends = Vec::with_capacity(n_to);
        let mut self_block = None;
        for k in 0..n_to {
            let p = (first + k) % n_to;
            let dst = self.images_to[p];
            let block = send_block(p);
            if dst == me {
                self_block = Some(block);
            } else {
                log::trace!(
                    "rank {me}: send {} entries ({} values) to rank {dst}",
                    self.lengths_to[p],
                    block.len()
                );
                pending_sends.push(comm.isend(dst, tag.as_u16(), cast_slice(&block)));
            }
        }

        // 3) self message is a local copy
        let mut maybe_err = None;
        if let Some(block) = self_block {
            match self.images_from.iter().position(|&r| r == me) {
                Some(q) if layout[q].1 == block.len() => {
                    let start = layout[q].0;
                    imports[start..start + block.len()].copy_from_slice(&block);
                }
                _ => {
                    maybe_err = Some(DistError::BufferSizeMismatch {
                        neighbor: me,
                        expected: block.len() * elem,
                        got: self
                            .images_from
                            .iter()
                            .position(|&r| r == me)
                            .map_or(0, |q| layout[q].1 * elem),
                    });
                }
            }
        }

        // 4) wait for all receives, keep the first error
        for (q, src, h) in pending_recvs {
            let (offset, count) = layout[q];
            let expected = count * elem;
            match h.wait() {
                Some(raw) if raw.len() == expected => {
                    if let Some(vals) = decode_vec::<T>(&raw) {
                        imports[offset..offset + count].copy_from_slice(&vals);
                    }
                }
                Some(raw) => {
                    maybe_err.get_or_insert(DistError::BufferSizeMismatch {
                        neighbor: src,
                        expected,
                        got: raw.len(),
                    });
                }
                None => {
                    maybe_err.get_or_insert(DistError::CommError {
                        neighbor: src,
                        message: format!("no data received (tag {:#x})", tag.as_u16()),
                    });
                }
            }
        }

        // 5) always drain all send handles before returning
        for send in pending_sends {
            let _ = send.wait();
        }

        match maybe_err {
            Some(err) => Err(err),
            None => Ok(imports),
        }
    }
}

fn prefix_sum(sizes: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0usize;
    out.push(acc);
    for &n in sizes {
        acc += n;
        out.push(acc);
    }
    out
}

impl DebugInvariants for Distributor {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Distributor");
    }

    fn validate_invariants(&self) -> Result<(), DistError> {
        let bad = |msg: String| Err(DistError::InvalidStructure(msg));
        if self.images_to.windows(2).any(|w| w[0] >= w[1]) {
            return bad("images_to must be strictly ascending".into());
        }
        if self.images_from.windows(2).any(|w| w[0] >= w[1]) {
            return bad("images_from must be strictly ascending".into());
        }
        if self.lengths_to.iter().sum::<usize>() != self.num_exports {
            return bad("send lengths do not add up to the number of exports".into());
        }
        if self.lengths_from.iter().sum::<usize>() != self.total_receive_length {
            return bad("receive lengths do not add up to the total receive length".into());
        }
        if self.images_to.contains(&self.rank) != self.self_message
            || self.images_from.contains(&self.rank) != self.self_message
        {
            return bad("self message flag disagrees with the send/receive lists".into());
        }
        for idx in [&self.indices_to, &self.indices_from].into_iter().flatten() {
            let mut seen = vec![false; idx.len()];
            for &i in idx {
                if i >= seen.len() || std::mem::replace(&mut seen[i], true) {
                    return bad("index list is not a permutation".into());
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Distributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[rank {} of {}]", self.rank, self.size)?;
        writeln!(f, " selfMessage: {}", self.self_message)?;
        writeln!(f, " numSends: {}", self.num_sends())?;
        writeln!(f, " imagesTo: {:?}", self.images_to)?;
        writeln!(f, " lengthsTo: {:?}", self.lengths_to)?;
        writeln!(f, " maxSendLength: {}", self.max_send_length)?;
        writeln!(f, " numReceives: {}", self.num_receives())?;
        writeln!(f, " totalReceiveLength: {}", self.total_receive_length)?;
        writeln!(f, " imagesFrom: {:?}", self.images_from)?;
        write!(f, " lengthsFrom: {:?}", self.lengths_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    fn on_world<T: Send>(n: usize, f: impl Fn(&RayonComm) -> T + Sync) -> Vec<T> {
        let world = RayonComm::world(n);
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn serial_self_messages_are_copied() {
        let plan = Distributor::create_from_sends(&[0, 0, 0], &NoComm).unwrap();
        assert!(plan.has_self_message());
        assert_eq!(plan.num_sends(), 0);
        assert_eq!(plan.num_receives(), 0);
        let out = plan.do_posts_and_waits(&[1u32, 2, 3], 1, &NoComm).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn invalid_rank_is_reported() {
        let err = Distributor::create_from_sends(&[1], &NoComm).unwrap_err();
        assert_eq!(err, DistError::InvalidRank { rank: 1, size: 1 });
    }

    #[test]
    fn ungrouped_exports_use_send_buffer() {
        let out = on_world(2, |c| {
            // each rank sends its values alternately to 0 and 1
            let ranks = [0usize, 1, 0, 1];
            let plan = Distributor::create_from_sends(&ranks, c).unwrap();
            assert!(plan.indices_to().is_some());
            let base = c.rank() as u32 * 10;
            let exports = [base, base + 1, base + 2, base + 3];
            plan.do_posts_and_waits(&exports, 1, c).unwrap()
        });
        // rank 0 receives entries 0 and 2 from both ranks, grouped by source
        assert_eq!(out[0], vec![0, 2, 10, 12]);
        assert_eq!(out[1], vec![1, 3, 11, 13]);
    }

    #[test]
    fn reverse_plan_returns_to_export_positions() {
        let out = on_world(2, |c| {
            let ranks = [1usize, 0, 1];
            let plan = Distributor::create_from_sends(&ranks, c).unwrap();
            let exports: Vec<u64> = (0..3).map(|i| (c.rank() * 100 + i) as u64).collect();
            let imports = plan.do_posts_and_waits(&exports, 1, c).unwrap();
            // bounce the imports back unchanged
            plan.do_reverse_posts_and_waits(&imports, 1, c).unwrap()
        });
        assert_eq!(out[0], vec![0, 1, 2]);
        assert_eq!(out[1], vec![100, 101, 102]);
    }

    #[test]
    fn variable_sized_entries() {
        let out = on_world(2, |c| {
            let other = 1 - c.rank();
            let plan = Distributor::create_from_sends(&[other, other], c).unwrap();
            let r = c.rank() as u16;
            let exports = [r, r + 10, r + 20];
            let (imports, sizes) = plan.do_posts_and_waits_var(&exports, &[1, 2], c).unwrap();
            (imports, sizes)
        });
        assert_eq!(out[0], (vec![1, 11, 21], vec![1, 2]));
        assert_eq!(out[1], (vec![0, 10, 20], vec![1, 2]));
    }

    #[test]
    fn create_from_recvs_tells_owners_what_to_send() {
        let out = on_world(3, |c| {
            // every rank wants gid 100 + r from each other rank r
            let (gids, ranks): (Vec<u64>, Vec<usize>) = (0..3)
                .filter(|&r| r != c.rank())
                .map(|r| (100 + r as u64, r))
                .unzip();
            let (plan, export_gids, export_ranks) =
                Distributor::create_from_recvs(&gids, &ranks, c).unwrap();
            assert_eq!(plan.num_exports(), 2);
            (export_gids, export_ranks)
        });
        let me_gid = |r: u64| vec![100 + r, 100 + r];
        assert_eq!(out[0].0, me_gid(0));
        assert_eq!(out[0].1, vec![1, 2]);
        assert_eq!(out[2].1, vec![0, 1]);
    }
}
