//! Side-index layout.
//!
//! ```text
//! +------+--------------+---------------+
//! | head |   data --->  |  <--- index   |
//! +------+--------------+---------------+
//! ```
//!
//! Log records grow forward from the head while an index of 8-byte AVL
//! nodes grows backward from the end of the block, each node carrying a
//! 3-byte offset to its record. Rewriting an index entry gives cheap
//! in-place `replace`; the superseded record becomes dead space. Removed
//! index nodes are threaded into a free list and reused.

use super::record;
use super::{
    get_u16, get_u32, put_u16, put_u32, BlockFormat, BlockMap, BlockOpts, BlockStats, Kv, KvStats,
    MapIter, SeekPos,
};
use crate::avl16::{self, Geometry, TreeState};

use reef_types::varint;

const OFF_BLK_SIZE: usize = 4;
const OFF_NEXT_DATA: usize = 8;
const OFF_INDEX_BLK: usize = 12;
const OFF_INDEX_NEXT: usize = 16;
const OFF_INDEX_USED: usize = 18;
const OFF_ROOT: usize = 20;
const OFF_EDGE0: usize = 22;
const OFF_EDGE1: usize = 24;
const OFF_FREE: usize = 26;
const OFF_KV_LAST: usize = 28;
const OFF_STATS: usize = 32;
const HEAD_SIZE: usize = 52;

const UNIT: usize = 8;

/// Index positions are 16-bit; blocks past this size offset the index
/// region so the furthest node still resolves.
const INDEX_SPAN: u32 = 1 << 19;

/// The side-index layout.
pub struct Avl16eMap;

fn geo(block: &[u8]) -> Geometry {
    Geometry {
        base: get_u32(block, OFF_INDEX_BLK) as usize,
        unit: UNIT,
    }
}

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

/// Data offset held by the index node at `pos`.
fn node_offset(block: &[u8], geo: Geometry, pos: u16) -> u32 {
    varint::decode_u32(&block[geo.payload(pos)..], 3)
}

fn set_node_offset(block: &mut [u8], geo: Geometry, pos: u16, offset: u32) {
    let at = geo.payload(pos);
    varint::encode_into(&mut block[at..], 3, offset as u64);
}

fn record_at(block: &[u8], geo: Geometry, pos: u16) -> Kv<'_> {
    record::get(block, node_offset(block, geo, pos)).0
}

impl Avl16eMap {
    fn kv_count(block: &[u8]) -> u32 {
        KvStats::load(block, OFF_STATS).kv_count
    }

    fn blk_used(block: &[u8]) -> u32 {
        get_u32(block, OFF_NEXT_DATA) + get_u16(block, OFF_INDEX_USED) as u32 * UNIT as u32
    }

    fn avail(block: &[u8]) -> u32 {
        get_u32(block, OFF_BLK_SIZE) - Self::blk_used(block)
    }

    /// Grab an index node, preferring the free list over fresh arena space.
    fn alloc_index(block: &mut [u8]) -> u16 {
        let g = geo(block);
        let mut free = get_u16(block, OFF_FREE);
        if let Some(pos) = avl16::free_pop(block, g, &mut free) {
            put_u16(block, OFF_FREE, free);
            return pos;
        }
        let pos = get_u16(block, OFF_INDEX_NEXT);
        put_u16(block, OFF_INDEX_NEXT, pos - 1);
        put_u16(block, OFF_INDEX_USED, get_u16(block, OFF_INDEX_USED) + 1);
        pos
    }

    /// Append the record bytes into the data region.
    fn record_add(block: &mut [u8], kv: &Kv<'_>) -> u32 {
        let mut next = get_u32(block, OFF_NEXT_DATA);
        let mut kv_last = get_u32(block, OFF_KV_LAST);
        let mut stats = KvStats::load(block, OFF_STATS);
        let at = next;

        record::add(block, &mut next, &mut kv_last, &mut stats, kv);

        put_u32(block, OFF_NEXT_DATA, next);
        put_u32(block, OFF_KV_LAST, kv_last);
        stats.store(block, OFF_STATS);
        at
    }
}

impl BlockMap for Avl16eMap {
    fn format(&self) -> BlockFormat {
        BlockFormat::Avl16e
    }

    fn init(&self, block: &mut [u8], opts: &BlockOpts) {
        block[..HEAD_SIZE].fill(0);
        block[0] = BlockFormat::Avl16e as u8;
        put_u32(block, OFF_BLK_SIZE, opts.blk_size);
        put_u32(block, OFF_NEXT_DATA, HEAD_SIZE as u32);
        if opts.blk_size >= INDEX_SPAN {
            put_u32(block, OFF_INDEX_BLK, opts.blk_size - INDEX_SPAN);
            put_u16(block, OFF_INDEX_NEXT, u16::MAX);
        } else {
            put_u16(block, OFF_INDEX_NEXT, (opts.blk_size as usize / UNIT) as u16);
        }
        KvStats::default().store(block, OFF_STATS);
    }

    fn lookup<'a>(&self, block: &'a [u8], key: &[u8]) -> Option<Kv<'a>> {
        let g = geo(block);
        let state = load_state(block);
        let mut cmp = |block: &[u8], pos: u16| record_at(block, g, pos).key.cmp(key);
        avl16::lookup(&state, block, g, &mut cmp).map(|pos| record_at(block, g, pos))
    }

    fn first_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record_at(block, geo(block), get_u16(block, OFF_EDGE0)))
    }

    fn last_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record_at(block, geo(block), get_u16(block, OFF_EDGE1)))
    }

    fn get_iptr<'a>(&self, block: &'a [u8], iptr: u32) -> Kv<'a> {
        record_at(block, geo(block), iptr as u16)
    }

    fn seek(&self, iter: &mut MapIter, block: &[u8], pos: SeekPos, key: &[u8]) -> bool {
        let g = geo(block);
        let state = load_state(block);
        let mut avl_iter = avl16::Iter::new();
        let mut cmp = |block: &[u8], at: u16| record_at(block, g, at).key.cmp(key);

        let positioned = match pos {
            SeekPos::Begin => avl_iter.seek_begin(block, g, state.root),
            SeekPos::End => avl_iter.seek_end(block, g, state.root),
            SeekPos::Le => avl_iter.seek_le(block, g, state.root, &mut cmp),
            SeekPos::Lt => {
                avl_iter.seek_le(block, g, state.root, &mut cmp)
                    && (!avl_iter.found || avl_iter.prev(block, g))
            }
            SeekPos::Ge => avl_iter.seek_ge(block, g, state.root, &mut cmp),
            SeekPos::Gt => {
                avl_iter.seek_ge(block, g, state.root, &mut cmp)
                    && (!avl_iter.found || avl_iter.next(block, g))
            }
            SeekPos::Eq => {
                avl_iter.seek_le(block, g, state.root, &mut cmp);
                avl_iter.found
            }
        };

        *iter = MapIter::Avl(avl_iter);
        positioned
    }

    fn seek_next(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.next(block, geo(block)),
            _ => false,
        }
    }

    fn seek_prev(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.prev(block, geo(block)),
            _ => false,
        }
    }

    fn seek_item<'a>(&self, iter: &mut MapIter, block: &'a [u8]) -> Kv<'a> {
        match iter {
            MapIter::Avl(avl_iter) => record_at(block, geo(block), avl_iter.current),
            _ => unreachable!("iterator not positioned on an avl16e block"),
        }
    }

    fn seek_iptr(&self, iter: &MapIter) -> u32 {
        match iter {
            MapIter::Avl(avl_iter) => avl_iter.current as u32,
            _ => 0,
        }
    }

    fn insert(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        if Self::kv_count(block) > 0 {
            let g = geo(block);
            let beyond_last = {
                let last = record_at(block, g, get_u16(block, OFF_EDGE1));
                kv.key > last.key
            };
            if beyond_last {
                return self.append(block, kv);
            }
            let below_first = {
                let first = record_at(block, g, get_u16(block, OFF_EDGE0));
                kv.key < first.key
            };
            if below_first {
                return self.prepend(block, kv);
            }
        }

        let dpos = Self::record_add(block, kv);
        let pos = Self::alloc_index(block);
        let g = geo(block);
        let mut state = load_state(block);
        let key = kv.key;
        let mut cmp = move |block: &[u8], at: u16| record_at(block, g, at).key.cmp(key);
        avl16::insert(&mut state, block, g, pos, &mut cmp);
        store_state(block, &state);
        set_node_offset(block, g, pos, dpos);
        Self::avail(block)
    }

    fn append(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        let dpos = Self::record_add(block, kv);
        let pos = Self::alloc_index(block);
        let g = geo(block);
        let mut state = load_state(block);
        avl16::append(&mut state, block, g, pos);
        store_state(block, &state);
        set_node_offset(block, g, pos, dpos);
        Self::avail(block)
    }

    fn prepend(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        let dpos = Self::record_add(block, kv);
        let pos = Self::alloc_index(block);
        let g = geo(block);
        let mut state = load_state(block);
        avl16::prepend(&mut state, block, g, pos);
        store_state(block, &state);
        set_node_offset(block, g, pos, dpos);
        Self::avail(block)
    }

    fn remove(&self, block: &mut [u8], key: &[u8]) -> bool {
        let g = geo(block);
        let mut state = load_state(block);
        let mut cmp = |block: &[u8], at: u16| record_at(block, g, at).key.cmp(key);
        let Some(pos) = avl16::remove(&mut state, block, g, &mut cmp) else {
            return false;
        };
        store_state(block, &state);

        let mut free = get_u16(block, OFF_FREE);
        avl16::free_push(block, g, &mut free, pos);
        put_u16(block, OFF_FREE, free);

        let mut stats = KvStats::load(block, OFF_STATS);
        stats.kv_count -= 1;
        stats.store(block, OFF_STATS);
        true
    }

    fn replace(&self, block: &mut [u8], key: &[u8], kv: &Kv<'_>) -> bool {
        let g = geo(block);
        let state = load_state(block);
        let mut cmp = |block: &[u8], at: u16| record_at(block, g, at).key.cmp(key);
        let Some(pos) = avl16::lookup(&state, block, g, &mut cmp) else {
            return false;
        };

        let dpos = Self::record_add(block, kv);
        set_node_offset(block, g, pos, dpos);

        // record_add counted the new pair; the logical count is unchanged and
        // the superseded record stays behind as dead space
        let mut stats = KvStats::load(block, OFF_STATS);
        stats.kv_count -= 1;
        stats.store(block, OFF_STATS);
        true
    }

    fn has_space(&self, block: &[u8], kv: &Kv<'_>) -> bool {
        UNIT as u32 + record::kv_space(kv) <= Self::avail(block)
    }

    fn max_overhead(&self) -> u32 {
        UNIT as u32 + record::MAX_OVERHEAD
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
