//! Log record codec shared by the log layout and the side-index layout.
//!
//! ```text
//! +--+--+--+--+
//! |11|11|11|11|
//! +--+--+--+--+
//!  |   |  |  +---- value length width
//!  |   |  +------- key length width, or joint-byte shift
//!  |   +---------- key prefix width (reserved)
//!  +-------------- back-pointer width
//! ```
//!
//! The head byte is followed by an optional back-pointer delta to the
//! previous record, then either one joint length byte (small pairs) or two
//! explicit length varints, then the key and value bytes.

use super::{Kv, KvStats};
use reef_types::varint;

/// Head byte plus worst-case back-pointer.
pub(crate) const MIN_OVERHEAD: u32 = 1 + 3;

/// Head byte plus worst-case back-pointer and both length varints.
pub(crate) const MAX_OVERHEAD: u32 = 1 + 3 + 3 + 3;

/// Worst-case encoded size of `kv`, used by `has_space` checks.
pub(crate) fn kv_space(kv: &Kv<'_>) -> u32 {
    MIN_OVERHEAD
        + varint::size_u32(kv.key.len() as u32) as u32
        + varint::size_u32(kv.value.len() as u32) as u32
        + kv.key.len() as u32
        + kv.value.len() as u32
}

/// Append a record at `*next`, linking back to `*kv_last`.
///
/// Updates the write cursor, the last-record offset, and the aggregates.
pub(crate) fn add(
    block: &mut [u8],
    next: &mut u32,
    kv_last: &mut u32,
    stats: &mut KvStats,
    kv: &Kv<'_>,
) {
    debug_assert!(!kv.key.is_empty());

    let klength = kv.key.len() as u32;
    let vlength = kv.value.len() as u32;
    let rhead = *next as usize;
    let mut at = rhead + 1;
    let mut head = 0u8;

    if *kv_last != 0 {
        let pprev = *next - *kv_last;
        let size = varint::size_u32(pprev);
        head |= (size as u8) << 6;
        varint::encode_into(&mut block[at..], size, pprev as u64);
        at += size;
    }

    // joint length byte when both lengths fit: klen-1 above, vlen below
    let shift = if vlength > 0 {
        reef_types::bits::align_up(32 - vlength.leading_zeros() as usize, 2)
    } else {
        0
    };
    if shift <= 6 && (klength - 1) <= (0xff >> shift) {
        head |= (shift as u8) >> 1;
        block[at] = (((klength - 1) << shift) | vlength) as u8;
        at += 1;
    } else {
        let ksize = varint::size_u32(klength);
        let vsize = varint::size_u32(vlength);
        head |= ((ksize as u8) << 2) | vsize as u8;
        varint::encode_into(&mut block[at..], ksize, klength as u64);
        at += ksize;
        varint::encode_into(&mut block[at..], vsize, vlength as u64);
        at += vsize;
    }

    block[at..at + kv.key.len()].copy_from_slice(kv.key);
    at += kv.key.len();
    block[at..at + kv.value.len()].copy_from_slice(kv.value);
    at += kv.value.len();

    block[rhead] = head;
    *kv_last = rhead as u32;
    *next = at as u32;
    stats.update(kv);
}

/// Decode the record at `at`, returning the pair and the end offset.
pub(crate) fn get(block: &[u8], at: u32) -> (Kv<'_>, u32) {
    let head = block[at as usize];
    let mut at = at as usize + 1 + (((head & 0xc0) >> 6) as usize);

    let (klength, vlength);
    if (head & 0x0c) == 0 {
        let shift = ((head & 0x3) << 1) as u32;
        let joint = block[at] as u32;
        klength = 1 + (joint >> shift);
        vlength = joint & ((1 << shift) - 1);
        at += 1;
    } else {
        let ksize = ((head & 0x0c) >> 2) as usize;
        let vsize = (head & 0x03) as usize;
        klength = varint::decode_u32(&block[at..], ksize);
        at += ksize;
        vlength = varint::decode_u32(&block[at..], vsize);
        at += vsize;
    }

    let key = &block[at..at + klength as usize];
    at += klength as usize;
    let value = &block[at..at + vlength as usize];
    at += vlength as usize;
    (Kv { key, value }, at as u32)
}

/// Offset of the record preceding the one at `at`, when linked.
pub(crate) fn prev(block: &[u8], at: u32) -> Option<u32> {
    let head = block[at as usize];
    let size = ((head & 0xc0) >> 6) as usize;
    if size == 0 {
        return None;
    }
    let pprev = varint::decode_u32(&block[at as usize + 1..], size);
    Some(at - pprev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_round_trip() {
        let mut block = alloc::vec![0u8; 4096];
        let mut next = 64u32;
        let mut kv_last = 0u32;
        let mut stats = KvStats::default();

        let pairs: [(&[u8], &[u8]); 4] = [
            (b"a", b""),
            (b"key-with-some-length", b"v"),
            (b"k", &[0xab; 300]),
            (&[0x7f; 80], &[1, 2, 3]),
        ];

        let mut offsets = alloc::vec::Vec::new();
        for (key, value) in pairs {
            offsets.push(next);
            add(&mut block, &mut next, &mut kv_last, &mut stats, &Kv::new(key, value));
        }

        for (at, (key, value)) in offsets.iter().zip(pairs) {
            let (kv, _) = get(&block, *at);
            assert_eq!(kv.key, key);
            assert_eq!(kv.value, value);
        }

        // back pointers walk the chain in reverse
        assert_eq!(prev(&block, offsets[3]), Some(offsets[2]));
        assert_eq!(prev(&block, offsets[2]), Some(offsets[1]));
        assert_eq!(prev(&block, offsets[1]), Some(offsets[0]));
        assert_eq!(prev(&block, offsets[0]), None);

        assert_eq!(stats.kv_count, 4);
        assert_eq!(stats.kmin, 1);
        assert_eq!(stats.kmax, 80);
        assert_eq!(stats.vmin, 0);
        assert_eq!(stats.vmax, 300);
    }

    #[test]
    fn joint_byte_boundaries() {
        // a pair that must not use the joint byte even though it is small:
        // klen-1 would not fit beside a 6-bit value length
        let mut block = alloc::vec![0u8; 1024];
        let (mut next, mut kv_last) = (8u32, 0u32);
        let mut stats = KvStats::default();

        let key = [0x11u8; 61];
        let value = [0x22u8; 6];
        add(&mut block, &mut next, &mut kv_last, &mut stats, &Kv::new(&key, &value));
        let (kv, _) = get(&block, 8);
        assert_eq!(kv.key, &key[..]);
        assert_eq!(kv.value, &value[..]);
    }
}
