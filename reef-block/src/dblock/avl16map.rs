//! Embedded AVL layout.
//!
//! Each record is stored inside its own tree node: the 5-byte link header
//! is followed by a packed length head and the key/value bytes. Node
//! positions advance in 8-byte units through the block. Lookups are
//! O(log n); iteration is always in key order.
//!
//! Record head byte variants:
//!
//! ```text
//! 00 00 KK VV -> key and value length varints
//! 00 1K KK VV -> key length <= 8 inline, value length varint
//! 01 KK VV VV -> key length <= 4, value length <= 15
//! 10 KK KV VV -> key length <= 8, value length <= 7
//! 11 KK KK KK -> key length <= 64, no value
//! ```

use super::{
    get_u16, get_u32, put_u16, put_u32, BlockFormat, BlockMap, BlockOpts, BlockStats, Kv, KvStats,
    MapIter, SeekPos,
};
use crate::avl16::{self, Geometry, TreeState};
use reef_types::{bits, varint};

const OFF_BLK_SIZE: usize = 4;
const OFF_BLK_AVAIL: usize = 8;
const OFF_KV_COUNT: usize = 12;
const OFF_INDEX_NEXT: usize = 16;
const OFF_ROOT: usize = 18;
const OFF_EDGE0: usize = 20;
const OFF_EDGE1: usize = 22;
const OFF_STATS: usize = 24;
const HEAD_SIZE: usize = 48;

const UNIT: usize = 8;
const GEO: Geometry = Geometry { base: 0, unit: UNIT };

/// The embedded AVL layout.
pub struct Avl16Map;

fn load_state(block: &[u8]) -> TreeState {
    TreeState {
        root: get_u16(block, OFF_ROOT),
        edge: [get_u16(block, OFF_EDGE0), get_u16(block, OFF_EDGE1)],
    }
}

fn store_state(block: &mut [u8], state: &TreeState) {
    put_u16(block, OFF_ROOT, state.root);
    put_u16(block, OFF_EDGE0, state.edge[0]);
    put_u16(block, OFF_EDGE1, state.edge[1]);
}

/// Decode the record embedded at node `pos`.
fn record_at(block: &[u8], pos: u16) -> Kv<'_> {
    let mut at = GEO.payload(pos);
    let head = block[at];
    at += 1;

    let (klength, vlength);
    match head & 0xc0 {
        0x40 => {
            klength = (1 + ((head & 0x30) >> 4)) as usize;
            vlength = (head & 0x0f) as usize;
        }
        0x80 => {
            klength = (1 + ((head & 0x38) >> 3)) as usize;
            vlength = (head & 0x07) as usize;
        }
        0xc0 => {
            klength = (1 + (head & 0x3f)) as usize;
            vlength = 0;
        }
        _ => {
            if head & 0x20 != 0 {
                klength = (1 + ((head & 0x1c) >> 2)) as usize;
                let vsize = (head & 0x03) as usize;
                vlength = varint::decode_u32(&block[at..], vsize) as usize;
                at += vsize;
            } else {
                let ksize = ((head & 0x0c) >> 2) as usize;
                let vsize = (head & 0x03) as usize;
                klength = varint::decode_u32(&block[at..], ksize) as usize;
                at += ksize;
                vlength = varint::decode_u32(&block[at..], vsize) as usize;
                at += vsize;
            }
        }
    }

    Kv {
        key: &block[at..at + klength],
        value: &block[at + klength..at + klength + vlength],
    }
}

/// Encode the record into the payload of node `pos`; returns payload bytes.
fn record_write(block: &mut [u8], pos: u16, kv: &Kv<'_>) -> usize {
    let klength = kv.key.len();
    let vlength = kv.value.len();
    let start = GEO.payload(pos);
    let mut at = start + 1;
    let head;

    if klength <= 4 && vlength <= 15 {
        head = 0x40 | (((klength - 1) as u8) << 4) | vlength as u8;
    } else if klength <= 8 && vlength <= 7 {
        head = 0x80 | (((klength - 1) as u8) << 3) | vlength as u8;
    } else if vlength == 0 && klength <= 64 {
        head = 0xc0 | (klength - 1) as u8;
    } else if klength <= 8 {
        let vsize = varint::size_u32(vlength as u32);
        head = 0x20 | (((klength - 1) as u8) << 2) | vsize as u8;
        varint::encode_into(&mut block[at..], vsize, vlength as u64);
        at += vsize;
    } else {
        let ksize = varint::size_u32(klength as u32);
        let vsize = varint::size_u32(vlength as u32);
        head = ((ksize as u8) << 2) | vsize as u8;
        varint::encode_into(&mut block[at..], ksize, klength as u64);
        at += ksize;
        varint::encode_into(&mut block[at..], vsize, vlength as u64);
        at += vsize;
    }

    block[start] = head;
    block[at..at + klength].copy_from_slice(kv.key);
    at += klength;
    block[at..at + vlength].copy_from_slice(kv.value);
    at += vlength;
    at - start
}

impl Avl16Map {
    fn kv_count(block: &[u8]) -> u32 {
        get_u32(block, OFF_KV_COUNT)
    }

    fn avail(block: &[u8]) -> u32 {
        get_u32(block, OFF_BLK_AVAIL)
    }

    /// Write the record payload and account for the consumed arena space.
    fn record_add(block: &mut [u8], pos: u16, kv: &Kv<'_>) -> u32 {
        let payload = record_write(block, pos, kv);
        let uspace = bits::align_up(avl16::NODE_HEAD + payload, UNIT) as u32;

        let avail = Self::avail(block) - uspace;
        put_u32(block, OFF_BLK_AVAIL, avail);
        put_u32(block, OFF_KV_COUNT, Self::kv_count(block) + 1);
        put_u16(
            block,
            OFF_INDEX_NEXT,
            get_u16(block, OFF_INDEX_NEXT) + (uspace as usize / UNIT) as u16,
        );

        let mut stats = KvStats::load(block, OFF_STATS);
        stats.update(kv);
        stats.store(block, OFF_STATS);
        avail
    }
}

impl BlockMap for Avl16Map {
    fn format(&self) -> BlockFormat {
        BlockFormat::Avl16
    }

    fn init(&self, block: &mut [u8], opts: &BlockOpts) {
        block[..HEAD_SIZE].fill(0);
        block[0] = BlockFormat::Avl16 as u8;
        put_u32(block, OFF_BLK_SIZE, opts.blk_size);
        put_u32(block, OFF_BLK_AVAIL, opts.blk_size - HEAD_SIZE as u32);
        put_u16(block, OFF_INDEX_NEXT, (HEAD_SIZE / UNIT) as u16 + 1);
        KvStats::default().store(block, OFF_STATS);
    }

    fn lookup<'a>(&self, block: &'a [u8], key: &[u8]) -> Option<Kv<'a>> {
        let state = load_state(block);
        let mut cmp = |block: &[u8], pos: u16| record_at(block, pos).key.cmp(key);
        avl16::lookup(&state, block, GEO, &mut cmp).map(|pos| record_at(block, pos))
    }

    fn first_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record_at(block, get_u16(block, OFF_EDGE0)))
    }

    fn last_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record_at(block, get_u16(block, OFF_EDGE1)))
    }

    fn get_iptr<'a>(&self, block: &'a [u8], iptr: u32) -> Kv<'a> {
        record_at(block, iptr as u16)
    }

    fn seek(&self, iter: &mut MapIter, block: &[u8], pos: SeekPos, key: &[u8]) -> bool {
        let state = load_state(block);
        let mut avl_iter = avl16::Iter::new();
        let mut cmp = |block: &[u8], at: u16| record_at(block, at).key.cmp(key);

        let positioned = match pos {
            SeekPos::Begin => avl_iter.seek_begin(block, GEO, state.root),
            SeekPos::End => avl_iter.seek_end(block, GEO, state.root),
            SeekPos::Le => avl_iter.seek_le(block, GEO, state.root, &mut cmp),
            SeekPos::Lt => {
                avl_iter.seek_le(block, GEO, state.root, &mut cmp)
                    && (!avl_iter.found || avl_iter.prev(block, GEO))
            }
            SeekPos::Ge => avl_iter.seek_ge(block, GEO, state.root, &mut cmp),
            SeekPos::Gt => {
                avl_iter.seek_ge(block, GEO, state.root, &mut cmp)
                    && (!avl_iter.found || avl_iter.next(block, GEO))
            }
            SeekPos::Eq => {
                avl_iter.seek_le(block, GEO, state.root, &mut cmp);
                avl_iter.found
            }
        };

        *iter = MapIter::Avl(avl_iter);
        positioned
    }

    fn seek_next(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.next(block, GEO),
            _ => false,
        }
    }

    fn seek_prev(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.prev(block, GEO),
            _ => false,
        }
    }

    fn seek_item<'a>(&self, iter: &mut MapIter, block: &'a [u8]) -> Kv<'a> {
        match iter {
            MapIter::Avl(avl_iter) => record_at(block, avl_iter.current),
            _ => unreachable!("iterator not positioned on an avl16 block"),
        }
    }

    fn seek_iptr(&self, iter: &MapIter) -> u32 {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.current as u32,
            _ => 0,
        }
    }

    fn insert(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        // route extremes through append/prepend so the edges stay exact
        if Self::kv_count(block) > 0 {
            let beyond_last = {
                let last = record_at(block, get_u16(block, OFF_EDGE1));
                kv.key > last.key
            };
            if beyond_last {
                return self.append(block, kv);
            }
            let below_first = {
                let first = record_at(block, get_u16(block, OFF_EDGE0));
                kv.key < first.key
            };
            if below_first {
                return self.prepend(block, kv);
            }
        }

        let mut state = load_state(block);
        let pos = get_u16(block, OFF_INDEX_NEXT);
        let key = kv.key;
        let mut cmp = move |block: &[u8], at: u16| record_at(block, at).key.cmp(key);
        avl16::insert(&mut state, block, GEO, pos, &mut cmp);
        store_state(block, &state);
        Self::record_add(block, pos, kv)
    }

    fn append(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        let mut state = load_state(block);
        let pos = get_u16(block, OFF_INDEX_NEXT);
        avl16::append(&mut state, block, GEO, pos);
        store_state(block, &state);
        Self::record_add(block, pos, kv)
    }

    fn prepend(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        let mut state = load_state(block);
        let pos = get_u16(block, OFF_INDEX_NEXT);
        avl16::prepend(&mut state, block, GEO, pos);
        store_state(block, &state);
        Self::record_add(block, pos, kv)
    }

    fn has_space(&self, block: &[u8], kv: &Kv<'_>) -> bool {
        let kv_size = avl16::NODE_HEAD
            + 1
            + varint::size_u32(kv.key.len() as u32)
            + varint::size_u32(kv.value.len() as u32)
            + kv.key.len()
            + kv.value.len();
        bits::align_up(kv_size, UNIT) as u32 <= Self::avail(block)
    }

    fn max_overhead(&self) -> u32 {
        (avl16::NODE_HEAD + UNIT) as u32
    }

    fn stats(&self, block: &[u8]) -> BlockStats {
        BlockStats {
            blk_size: get_u32(block, OFF_BLK_SIZE),
            blk_avail: Self::avail(block),
            is_sorted: true,
            kv_stats: KvStats::load(block, OFF_STATS),
        }
    }
}
