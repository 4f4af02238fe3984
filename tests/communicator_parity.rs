mod util;
use util::*;

use bytemuck::{Pod, Zeroable, cast_slice};
use sparse_halo::algs::collectives::{all_gather_u64, all_reduce_any};
use sparse_halo::algs::communicator::{
    CommTag, Communicator, NoComm, RayonComm, RayonCommConfig, Wait,
};
use serial_test::serial;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, PartialEq, Eq)]
struct WireU64 {
    x: u64,
}

#[test]
fn no_comm_is_a_single_rank() {
    let comm = NoComm;
    assert!(comm.is_no_comm());
    assert_eq!((comm.rank(), comm.size()), (0, 1));
    let mut buf = [0u8; 8];
    assert!(comm.irecv(0, 123, &mut buf).wait().is_none());
    assert!(comm.isend(0, 123, &[]).wait().is_none());
    assert_eq!(all_gather_u64(&comm, 7).unwrap(), vec![7]);
}

#[test]
fn tags_keep_messages_apart() {
    let world = RayonComm::world(2);
    let (c0, c1) = (&world[0], &world[1]);
    let tag_a = CommTag::new(0xA100).as_u16();
    let tag_b = CommTag::new(0xA100).offset(1).as_u16();

    let wa = [WireU64 { x: 0xDEAD_BEEF_F00D_F00D }];
    let wb = [WireU64 { x: 0x0123_4567_89AB_CDEF }];
    c0.isend(1, tag_b, cast_slice(&wb));
    c0.isend(1, tag_a, cast_slice(&wa));

    let mut buf = [0u8; 8];
    let ra = c1.irecv(0, tag_a, &mut buf).wait().unwrap();
    let rb = c1.irecv(0, tag_b, &mut buf).wait().unwrap();
    assert_eq!(&ra[..], cast_slice(&wa));
    assert_eq!(&rb[..], cast_slice(&wb));
}

#[test]
fn same_tag_is_fifo() {
    let world = RayonComm::world(2);
    let tag = CommTag::new(0x1001).as_u16();
    for i in 0..10u8 {
        world[0].isend(1, tag, &[i]);
    }
    let got: Vec<u8> = (0..10)
        .map(|_| {
            let mut b = [0u8; 1];
            world[1].irecv(0, tag, &mut b).wait().unwrap()[0]
        })
        .collect();
    assert_eq!(got, (0..10).collect::<Vec<u8>>());
}

#[test]
#[serial]
fn missing_message_times_out() {
    let world = RayonComm::world_with_config(2, &RayonCommConfig { recv_timeout_ms: 20 });
    let mut b = [0u8; 4];
    assert!(world[1].irecv(0, 9, &mut b).wait().is_none());
}

#[test]
fn ring_on_threads() {
    let out = run_ranks(4, |comm| {
        let tag = CommTag::new(0x2000).as_u16();
        let next = (comm.rank() + 1) % comm.size();
        let prev = (comm.rank() + comm.size() - 1) % comm.size();
        comm.isend(next, tag, &(comm.rank() as u64).to_le_bytes()).wait();
        let mut b = [0u8; 8];
        let got = comm.irecv(prev, tag, &mut b).wait().unwrap();
        comm.barrier().unwrap();
        u64::from_le_bytes(got.try_into().unwrap())
    });
    assert_eq!(out, vec![3, 0, 1, 2]);
}

#[test]
fn collectives_agree_across_ranks() {
    let out = run_ranks(3, |comm| {
        let counts = all_gather_u64(comm, 10 * comm.rank() as u64).unwrap();
        let any = all_reduce_any(comm, comm.rank() == 2).unwrap();
        (counts, any)
    });
    for (counts, any) in out {
        assert_eq!(counts, vec![0, 10, 20]);
        assert!(any);
    }
}
