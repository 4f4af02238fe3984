//! Typed collectives built on [`Communicator::allgather`].
//!
//! Every helper here is collective: all ranks of the communicator must call it
//! in the same order.

use bytemuck::{Pod, Zeroable};

use crate::algs::communicator::Communicator;
use crate::algs::wire::{cast_slice, cast_slice_mut};
use crate::dist_error::DistError;

/// Gather one `T` per rank, ordered by rank.
pub fn all_gather<T: Pod, C: Communicator>(comm: &C, local: T) -> Result<Vec<T>, DistError> {
    all_gather_slice(comm, std::slice::from_ref(&local))
}

/// Gather an equally sized slice from every rank, concatenated in rank order.
pub fn all_gather_slice<T: Pod, C: Communicator>(
    comm: &C,
    local: &[T],
) -> Result<Vec<T>, DistError> {
    let mut out = vec![T::zeroed(); local.len() * comm.size()];
    comm.allgather(cast_slice(local), cast_slice_mut(&mut out))?;
    Ok(out)
}

pub fn all_gather_u64<C: Communicator>(comm: &C, local: u64) -> Result<Vec<u64>, DistError> {
    Ok(all_gather(comm, local.to_le())?
        .into_iter()
        .map(u64::from_le)
        .collect())
}

/// Fold one value per rank with `op`; every rank gets the same result.
pub fn all_reduce_with<T, C, F>(comm: &C, local: T, op: F) -> Result<T, DistError>
where
    T: Pod,
    C: Communicator,
    F: Fn(T, T) -> T,
{
    let all = all_gather(comm, local)?;
    let mut it = all.into_iter();
    let first = it.next().unwrap_or(local);
    Ok(it.fold(first, op))
}

/// Element-wise fold of equally sized slices across ranks.
pub fn all_reduce_slice_with<T, C, F>(comm: &C, local: &[T], op: F) -> Result<Vec<T>, DistError>
where
    T: Pod,
    C: Communicator,
    F: Fn(T, T) -> T,
{
    let n = local.len();
    let all = all_gather_slice(comm, local)?;
    let mut out = local.to_vec();
    if n == 0 {
        return Ok(out);
    }
    out.copy_from_slice(&all[..n]);
    for chunk in all.chunks_exact(n).skip(1) {
        for (acc, &v) in out.iter_mut().zip(chunk) {
            *acc = op(*acc, v);
        }
    }
    Ok(out)
}

pub fn all_reduce_sum_u64<C: Communicator>(comm: &C, local: u64) -> Result<u64, DistError> {
    Ok(all_gather_u64(comm, local)?.into_iter().sum())
}

pub fn all_reduce_max_u64<C: Communicator>(comm: &C, local: u64) -> Result<u64, DistError> {
    Ok(all_gather_u64(comm, local)?.into_iter().max().unwrap_or(local))
}

pub fn all_reduce_min_u64<C: Communicator>(comm: &C, local: u64) -> Result<u64, DistError> {
    Ok(all_gather_u64(comm, local)?.into_iter().min().unwrap_or(local))
}

/// Logical OR across ranks.
pub fn all_reduce_any<C: Communicator>(comm: &C, local: bool) -> Result<bool, DistError> {
    Ok(all_reduce_max_u64(comm, local as u64)? != 0)
}

/// Logical AND across ranks.
pub fn all_reduce_all<C: Communicator>(comm: &C, local: bool) -> Result<bool, DistError> {
    Ok(all_reduce_min_u64(comm, local as u64)? != 0)
}

/// Exclusive prefix sum of `local` over ranks, plus the global total.
pub fn exclusive_scan_u64<C: Communicator>(comm: &C, local: u64) -> Result<(u64, u64), DistError> {
    let all = all_gather_u64(comm, local)?;
    let before = all.iter().take(comm.rank()).sum();
    let total = all.iter().sum();
    Ok((before, total))
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct FailureFlag {
    failed_le: u32,
    rank_le: u32,
}

/// Collective error agreement.
///
/// Call after a purely local step that may fail, before the next collective.
/// If any rank failed, every rank returns an error: the failing ranks their own,
/// the others [`DistError::RemoteFailure`] naming the lowest failing rank. This
/// keeps healthy ranks from blocking in a collective that the failed rank will
/// never enter.
pub fn agree<T, C: Communicator>(comm: &C, local: Result<T, DistError>) -> Result<T, DistError> {
    let flag = FailureFlag {
        failed_le: (local.is_err() as u32).to_le(),
        rank_le: (comm.rank() as u32).to_le(),
    };
    let flags = all_gather(comm, flag)?;
    let first_failed = flags
        .iter()
        .find(|f| u32::from_le(f.failed_le) != 0)
        .map(|f| u32::from_le(f.rank_le) as usize);
    match (local, first_failed) {
        (Err(e), _) => Err(e),
        (Ok(_), Some(rank)) => Err(DistError::RemoteFailure { rank }),
        (Ok(v), None) => Ok(v),
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
    fn serial_reductions_are_identity() {
        assert_eq!(all_reduce_sum_u64(&NoComm, 7).unwrap(), 7);
        assert_eq!(exclusive_scan_u64(&NoComm, 7).unwrap(), (0, 7));
    }

    #[test]
    fn scan_and_sum_on_three_ranks() {
        let out = on_world(3, |c| {
            let local = (c.rank() as u64 + 1) * 10;
            (
                exclusive_scan_u64(c, local).unwrap(),
                all_reduce_sum_u64(c, local).unwrap(),
            )
        });
        assert_eq!(out[0], ((0, 60), 60));
        assert_eq!(out[1], ((10, 60), 60));
        assert_eq!(out[2], ((30, 60), 60));
    }

    #[test]
    fn elementwise_slice_reduction() {
        let out = on_world(2, |c| {
            let local = [c.rank() as u64, 5];
            all_reduce_slice_with(c, &local, |a, b| a + b).unwrap()
        });
        assert_eq!(out[0], vec![1, 10]);
        assert_eq!(out[1], vec![1, 10]);
    }

    #[test]
    fn agree_propagates_failures() {
        let out = on_world(3, |c| {
            let local: Result<(), DistError> = if c.rank() == 1 {
                Err(DistError::UnknownGlobalIndex(9))
            } else {
                Ok(())
            };
            agree(c, local)
        });
        assert_eq!(out[0], Err(DistError::RemoteFailure { rank: 1 }));
        assert_eq!(out[1], Err(DistError::UnknownGlobalIndex(9)));
        assert_eq!(out[2], Err(DistError::RemoteFailure { rank: 1 }));
    }
}
