use sparse_halo::algs::communicator::{CommTag, PlanTags};
use sparse_halo::algs::wire::{WireCount, WireGidRank, cast_slice, decode_vec};

#[test]
fn commtag_offset_wraps() {
    let t = CommTag::new(u16::MAX).offset(1);
    assert_eq!(t.as_u16(), 0);
}

#[test]
fn gid_rank_records_survive_the_byte_stream() {
    let recs = [WireGidRank::new(u64::MAX - 1, 7), WireGidRank::new(42, 0)];
    let bytes = cast_slice(&recs).to_vec();
    assert_eq!(bytes.len(), 32);
    let back: Vec<WireGidRank> = decode_vec(&bytes).unwrap();
    assert_eq!((back[0].gid(), back[0].rank()), (u64::MAX - 1, 7));
    assert_eq!((back[1].gid(), back[1].rank()), (42, 0));
}

#[test]
fn counts_decode_from_unaligned_buffers() {
    let mut bytes = vec![0u8];
    bytes.extend_from_slice(cast_slice(&[WireCount::new(3), WireCount::new(9)]));
    let counts: Vec<WireCount> = decode_vec(&bytes[1..]).unwrap();
    assert_eq!(counts.iter().map(WireCount::get).collect::<Vec<_>>(), vec![3, 9]);
    assert!(decode_vec::<WireCount>(&bytes).is_none());
}

#[test]
fn plan_tags_are_distinct() {
    let fwd = PlanTags::from_base(CommTag::new(0x4000));
    let rev = fwd.reversed();
    let all = [fwd.sizes, fwd.data, rev.sizes, rev.data].map(CommTag::as_u16);
    assert_eq!(all, [0x4000, 0x4001, 0x4002, 0x4003]);
}
