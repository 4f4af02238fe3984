//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: the distributor calls
//! `.wait()` before it trusts that a buffer is ready.
//!
//! Messages sent on one `(source, destination, tag)` triple are delivered in
//! send order, mirroring MPI's non-overtaking rule. Plans rely on this when
//! they reuse the same tags for every apply.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dist_error::DistError;

/// Typed message tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `self + k`, wrapping on overflow.
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// Tags used by one two-phase ("sizes then data") exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl PlanTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }

    /// Tags for the reverse direction of the same plan.
    pub const fn reversed(self) -> Self {
        Self {
            sizes: self.sizes.offset(2),
            data: self.data.offset(2),
        }
    }
}

/// Default tag base for distributor exchanges.
pub const DISTRIBUTOR_TAG: CommTag = CommTag::new(0xD150);
/// Reserved for the default `allgather` implementation.
pub const ALLGATHER_TAG: CommTag = CommTag::new(0xFFF0);

/// Non-blocking point-to-point communication between the ranks of a world.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive. `buf.len()` is the expected message size; the payload is
    /// returned by [`Wait::wait`].
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// True for the single-rank serial communicator.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Gather `send` (same length on every rank) from every rank into `recv`,
    /// ordered by rank.
    fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), DistError> {
        let n = send.len();
        let size = self.size();
        let me = self.rank();
        if recv.len() != n * size {
            return Err(DistError::BufferSizeMismatch {
                neighbor: me,
                expected: n * size,
                got: recv.len(),
            });
        }
        recv[me * n..(me + 1) * n].copy_from_slice(send);
        if size == 1 {
            return Ok(());
        }

        let tag = ALLGATHER_TAG.as_u16();
        let mut pending_recvs = Vec::with_capacity(size - 1);
        for peer in (0..size).filter(|&p| p != me) {
            let mut scratch = vec![0u8; n];
            pending_recvs.push((peer, self.irecv(peer, tag, &mut scratch)));
        }
        let pending_sends: Vec<_> = (0..size)
            .filter(|&p| p != me)
            .map(|peer| self.isend(peer, tag, send))
            .collect();

        // drain every handle before reporting the first failure
        let mut maybe_err = None;
        for (peer, h) in pending_recvs {
            match h.wait() {
                Some(data) if data.len() == n => {
                    recv[peer * n..(peer + 1) * n].copy_from_slice(&data);
                }
                Some(data) => {
                    maybe_err.get_or_insert(DistError::BufferSizeMismatch {
                        neighbor: peer,
                        expected: n,
                        got: data.len(),
                    });
                }
                None => {
                    maybe_err.get_or_insert(DistError::CommError {
                        neighbor: peer,
                        message: "allgather receive failed".into(),
                    });
                }
            }
        }
        for send in pending_sends {
            let _ = send.wait();
        }
        maybe_err.map_or(Ok(()), Err)
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<(), DistError> {
        let mut sink = vec![0u8; self.size()];
        self.allgather(&[1u8], &mut sink)
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-rank communicator for serial runs and unit tests.
///
/// Distributor plans copy self messages locally, so no message ever reaches
/// `isend`/`irecv` here.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- RayonComm: intra-process / multi-thread ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Debug, Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    /// Receives on a key that timed out; that many later arrivals are late
    /// replies to them and get discarded.
    stale: DashMap<Key, usize>,
}

impl Mailbox {
    /// Next live message on `key`. Empty queues are removed.
    fn pop(&self, key: &Key) -> Option<Bytes> {
        loop {
            let bytes = {
                let mut queue = self.slots.get_mut(key)?;
                queue.pop_front()?
            };
            self.slots.remove_if(key, |_, q| q.is_empty());
            let late = match self.stale.get_mut(key) {
                Some(mut n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            self.stale.remove_if(key, |_, n| *n == 0);
            if !late {
                return Some(bytes);
            }
            log::debug!(
                "discarding late message from rank {} (tag {:#x}) on rank {}",
                key.0,
                key.2,
                key.1
            );
        }
    }

    fn mark_timed_out(&self, key: Key) {
        *self.stale.entry(key).or_insert(0) += 1;
    }
}

/// Settings for in-process worlds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RayonCommConfig {
    /// How long a receive waits before it reports failure.
    pub recv_timeout_ms: u64,
}

impl Default for RayonCommConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 30_000,
        }
    }
}

/// One rank of an in-process world. Every rank runs on its own thread; ranks
/// of the same world share a mailbox, distinct worlds never see each other.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    timeout: Duration,
}

impl RayonComm {
    /// Create all `size` ranks of a fresh world.
    pub fn world(size: usize) -> Vec<RayonComm> {
        Self::world_with_config(size, &RayonCommConfig::default())
    }

    pub fn world_with_config(size: usize, config: &RayonCommConfig) -> Vec<RayonComm> {
        let mailbox = Arc::new(Mailbox::default());
        let timeout = Duration::from_millis(config.recv_timeout_ms);
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                timeout,
            })
            .collect()
    }
}

pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    timeout: Duration,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(bytes) = self.mailbox.pop(&self.key) {
                return Some(bytes.to_vec());
            }
            if Instant::now() >= deadline {
                self.mailbox.mark_timed_out(self.key);
                log::warn!(
                    "receive from rank {} (tag {:#x}) on rank {} timed out",
                    self.key.0,
                    self.key.2,
                    self.key.1
                );
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.mailbox
            .slots
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            timeout: self.timeout,
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use mpi::Threading;

    struct MpiWorld {
        comm: SimpleCommunicator,
        _universe: Universe,
    }

    // SAFETY: MPI is initialized with `Threading::Multiple`, so the world
    // communicator may be used from any thread.
    unsafe impl Send for MpiWorld {}
    unsafe impl Sync for MpiWorld {}

    #[derive(Clone)]
    pub struct MpiComm {
        world: Arc<MpiWorld>,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, DistError> {
            let (universe, level) = mpi::initialize_with_threading(Threading::Multiple)
                .ok_or_else(|| DistError::CommError {
                    neighbor: 0,
                    message: "MPI already initialized".into(),
                })?;
            if level < Threading::Multiple {
                log::warn!("MPI provides thread level {level:?}; use one thread per rank");
            }
            let comm = universe.world();
            let rank = comm.rank() as usize;
            let size = comm.size() as usize;
            Ok(Self {
                world: Arc::new(MpiWorld {
                    comm,
                    _universe: universe,
                }),
                rank,
                size,
            })
        }
    }

    /// Outstanding send; the payload is owned by the handle until completion.
    pub struct MpiSendHandle {
        request: Option<Request<'static, [u8], StaticScope>>,
        payload: *mut [u8],
    }

    // SAFETY: the payload pointer is uniquely owned by this handle.
    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.request.take() {
                req.wait();
            }
            // SAFETY: produced by `Box::leak` in `isend` and the request has completed.
            unsafe { drop(Box::from_raw(self.payload)) };
            None
        }
    }

    /// Receives complete lazily: the blocking receive runs inside `wait`, after
    /// every send of the phase has been posted.
    pub struct MpiRecvHandle {
        world: Arc<MpiWorld>,
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .comm
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let payload: *mut [u8] = leaked;
            // SAFETY: `payload` stays alive until `wait` frees it.
            let data: &'static [u8] = unsafe { &*payload };
            let req = self.world.comm.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                data,
                tag as i32,
            );
            MpiSendHandle {
                request: Some(req),
                payload,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                world: Arc::clone(&self.world),
                peer: peer as i32,
                tag: tag as i32,
            }
        }

        fn allgather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), DistError> {
            if recv.len() != send.len() * self.size {
                return Err(DistError::BufferSizeMismatch {
                    neighbor: self.rank,
                    expected: send.len() * self.size,
                    got: recv.len(),
                });
            }
            self.world.comm.all_gather_into(send, recv);
            Ok(())
        }

        fn barrier(&self) -> Result<(), DistError> {
            self.world.comm.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
