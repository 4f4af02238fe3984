//! Fixed, versioned, little-endian wire types for distributor exchanges.

use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a received byte buffer into owned records. Unlike
/// `bytemuck::cast_slice` this never fails on alignment, only on length.
pub fn decode_vec<T: Pod>(bytes: &[u8]) -> Option<Vec<T>> {
    let sz = size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return None;
    }
    let mut out = vec![T::zeroed(); bytes.len() / sz];
    cast_slice_mut(&mut out).copy_from_slice(bytes);
    Some(out)
}

// All multi-byte integers in these structs are **little-endian** on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A global index carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGid {
    pub gid_le: u64,
}
impl WireGid {
    pub fn of(gid: u64) -> Self {
        Self { gid_le: gid.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.gid_le)
    }
}

/// A global index together with the rank that asks for (or owns) it.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGidRank {
    pub gid_le: u64,
    pub rank_le: u32,
    pub _pad: u32,
}
impl WireGidRank {
    pub fn new(gid: u64, rank: usize) -> Self {
        Self {
            gid_le: gid.to_le(),
            rank_le: (rank as u32).to_le(),
            _pad: 0,
        }
    }
    pub fn gid(&self) -> u64 {
        u64::from_le(self.gid_le)
    }
    pub fn rank(&self) -> usize {
        u32::from_le(self.rank_le) as usize
    }
}

/// Directory registration: `gid` is owned by `rank` at local index `lid`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireDirEntry {
    pub gid_le: u64,
    pub lid_le: u64,
    pub rank_le: u32,
    pub _pad: u32,
}
impl WireDirEntry {
    pub fn new(gid: u64, rank: usize, lid: usize) -> Self {
        Self {
            gid_le: gid.to_le(),
            lid_le: (lid as u64).to_le(),
            rank_le: (rank as u32).to_le(),
            _pad: 0,
        }
    }
    pub fn decode(&self) -> (u64, usize, usize) {
        (
            u64::from_le(self.gid_le),
            u32::from_le(self.rank_le) as usize,
            u64::from_le(self.lid_le) as usize,
        )
    }
}

/// Directory reply: owner rank and local index, or "not found".
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireOwner {
    pub lid_le: u64,
    pub rank_le: u32,
    pub found: u32,
}
impl WireOwner {
    pub fn found(rank: usize, lid: usize) -> Self {
        Self {
            lid_le: (lid as u64).to_le(),
            rank_le: (rank as u32).to_le(),
            found: 1u32.to_le(),
        }
    }
    pub fn missing() -> Self {
        Self::zeroed()
    }
    pub fn get(&self) -> Option<(usize, usize)> {
        (u32::from_le(self.found) != 0).then(|| {
            (
                u32::from_le(self.rank_le) as usize,
                u64::from_le(self.lid_le) as usize,
            )
        })
    }
}

// ===== Compile-time sanity checks =========================================

const _: () = {
    // Pod/Zeroable ensures no padding contains uninit when cast to bytes.
    assert!(size_of::<WireCount>() == 8);
    assert!(size_of::<WireGid>() == 8);
    assert!(size_of::<WireGidRank>() == 16);
    assert!(size_of::<WireDirEntry>() == 24);
    assert!(size_of::<WireOwner>() == 16);
    assert!(align_of::<WireDirEntry>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_dir_entry() {
        let v = vec![WireDirEntry::new(10, 2, 3), WireDirEntry::new(11, 0, 7)];
        let bytes: Vec<u8> = cast_slice(&v).to_vec();
        let out: Vec<WireDirEntry> = decode_vec(&bytes).unwrap();
        assert_eq!(out[0].decode(), (10, 2, 3));
        assert_eq!(out[1].decode(), (11, 0, 7));
    }

    #[test]
    fn owner_sentinel() {
        assert_eq!(WireOwner::missing().get(), None);
        assert_eq!(WireOwner::found(3, 4).get(), Some((3, 4)));
    }

    #[test]
    fn decode_rejects_ragged_buffers() {
        assert!(decode_vec::<WireGid>(&[0u8; 12]).is_none());
        assert_eq!(decode_vec::<WireGid>(&[]).unwrap().len(), 0);
    }
}
