//! Append-only log layout.
//!
//! Records are written back to back after the head; lookups scan linearly.
//! The head tracks the offsets of the records holding the minimum and
//! maximum keys, so ordered writes stay cheap and `first_key`/`last_key`
//! stay O(1) even once the physical order degrades.
//!
//! ```text
//! 0   format / pad          20  blk_used
//! 4   blk_size              24  kv_last
//! 8   kv_count              28  flags (bit0 = is_sorted)
//! 12  kv_edge[2]            32  kv_stats
//! ```

use super::record;
use super::{
    get_u32, put_u32, BlockFormat, BlockMap, BlockOpts, BlockStats, Kv, KvStats, MapIter, SeekPos,
};

use core::cmp::Ordering;

const OFF_BLK_SIZE: usize = 4;
const OFF_KV_COUNT: usize = 8;
const OFF_EDGE0: usize = 12;
const OFF_EDGE1: usize = 16;
const OFF_BLK_USED: usize = 20;
const OFF_KV_LAST: usize = 24;
const OFF_FLAGS: usize = 28;
const OFF_STATS: usize = 32;
const HEAD_SIZE: usize = OFF_STATS + KvStats::ENCODED_SIZE;

const FLAG_SORTED: u32 = 1;

/// The append-only log layout.
pub struct LogMap;

impl LogMap {
    fn kv_count(block: &[u8]) -> u32 {
        get_u32(block, OFF_KV_COUNT)
    }

    fn kv_last(block: &[u8]) -> u32 {
        get_u32(block, OFF_KV_LAST)
    }

    fn avail(block: &[u8]) -> u32 {
        get_u32(block, OFF_BLK_SIZE) - get_u32(block, OFF_BLK_USED)
    }

    fn set_sorted(block: &mut [u8], sorted: bool) {
        let mut flags = get_u32(block, OFF_FLAGS);
        if sorted {
            flags |= FLAG_SORTED;
        } else {
            flags &= !FLAG_SORTED;
        }
        put_u32(block, OFF_FLAGS, flags);
    }

    /// Append the record and refresh the write-side head fields.
    fn record_add(block: &mut [u8], kv: &Kv<'_>) {
        let mut next = get_u32(block, OFF_BLK_USED);
        let mut kv_last = get_u32(block, OFF_KV_LAST);
        let mut stats = KvStats::load(block, OFF_STATS);

        record::add(block, &mut next, &mut kv_last, &mut stats, kv);

        put_u32(block, OFF_BLK_USED, next);
        put_u32(block, OFF_KV_LAST, kv_last);
        put_u32(block, OFF_KV_COUNT, stats.kv_count);
        stats.store(block, OFF_STATS);
    }

    fn set_iter(iter: &mut MapIter, prec: u32, pnext: Option<u32>) {
        *iter = MapIter::Log { prec, pnext };
    }
}

impl BlockMap for LogMap {
    fn format(&self) -> BlockFormat {
        BlockFormat::Log
    }

    fn init(&self, block: &mut [u8], opts: &BlockOpts) {
        block[..HEAD_SIZE].fill(0);
        block[0] = BlockFormat::Log as u8;
        put_u32(block, OFF_BLK_SIZE, opts.blk_size);
        put_u32(block, OFF_EDGE0, HEAD_SIZE as u32);
        put_u32(block, OFF_EDGE1, HEAD_SIZE as u32);
        put_u32(block, OFF_BLK_USED, HEAD_SIZE as u32);
        put_u32(block, OFF_FLAGS, FLAG_SORTED);
        KvStats::default().store(block, OFF_STATS);
    }

    fn lookup<'a>(&self, block: &'a [u8], key: &[u8]) -> Option<Kv<'a>> {
        let mut at = HEAD_SIZE as u32;
        for _ in 0..Self::kv_count(block) {
            let (kv, end) = record::get(block, at);
            if kv.key == key {
                return Some(kv);
            }
            at = end;
        }
        None
    }

    fn first_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record::get(block, get_u32(block, OFF_EDGE0)).0)
    }

    fn last_key<'a>(&self, block: &'a [u8]) -> Option<Kv<'a>> {
        (Self::kv_count(block) > 0).then(|| record::get(block, get_u32(block, OFF_EDGE1)).0)
    }

    fn get_iptr<'a>(&self, block: &'a [u8], iptr: u32) -> Kv<'a> {
        record::get(block, iptr).0
    }

    fn seek(&self, iter: &mut MapIter, block: &[u8], pos: SeekPos, key: &[u8]) -> bool {
        if Self::kv_count(block) == 0 {
            return false;
        }
        match pos {
            SeekPos::Begin => {
                Self::set_iter(iter, HEAD_SIZE as u32, None);
                true
            }
            SeekPos::End => {
                Self::set_iter(iter, Self::kv_last(block), None);
                true
            }
            _ => {
                let kv_last = Self::kv_last(block);
                let mut plast = HEAD_SIZE as u32;
                let mut pcur = HEAD_SIZE as u32;
                for _ in 0..Self::kv_count(block) {
                    plast = pcur;
                    let (ikv, end) = record::get(block, pcur);
                    pcur = end;

                    let cmp = ikv.key.cmp(key);
                    if cmp == Ordering::Less {
                        continue;
                    }
                    return match pos {
                        SeekPos::Le if cmp == Ordering::Equal => {
                            Self::set_iter(iter, plast, Some(pcur));
                            true
                        }
                        SeekPos::Le | SeekPos::Lt => match record::prev(block, plast) {
                            Some(pprev) => {
                                Self::set_iter(iter, pprev, Some(plast));
                                true
                            }
                            None => false,
                        },
                        SeekPos::Ge => {
                            Self::set_iter(iter, plast, Some(pcur));
                            true
                        }
                        SeekPos::Gt if cmp == Ordering::Equal => {
                            if pcur > kv_last {
                                false
                            } else {
                                Self::set_iter(iter, pcur, None);
                                true
                            }
                        }
                        SeekPos::Gt => {
                            Self::set_iter(iter, plast, Some(pcur));
                            true
                        }
                        SeekPos::Eq => {
                            if cmp == Ordering::Equal {
                                Self::set_iter(iter, plast, Some(pcur));
                                true
                            } else {
                                false
                            }
                        }
                        SeekPos::Begin | SeekPos::End => unreachable!(),
                    };
                }

                // every key is below the target
                match pos {
                    SeekPos::Le | SeekPos::Lt => {
                        Self::set_iter(iter, plast, None);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn seek_next(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        let MapIter::Log { prec, pnext } = iter else {
            return false;
        };
        let kv_last = Self::kv_last(block);
        if let Some(next) = pnext.take() {
            if next <= kv_last {
                *prec = next;
                return true;
            }
            return false;
        }
        if *prec < kv_last {
            *prec = record::get(block, *prec).1;
            return true;
        }
        false
    }

    fn seek_prev(&self, iter: &mut MapIter, block: &[u8]) -> bool {
        let MapIter::Log { prec, pnext } = iter else {
            return false;
        };
        match record::prev(block, *prec) {
            Some(at) => {
                *pnext = Some(*prec);
                *prec = at;
                true
            }
            None => false,
        }
    }

    fn seek_item<'a>(&self, iter: &mut MapIter, block: &'a [u8]) -> Kv<'a> {
        let MapIter::Log { prec, pnext } = iter else {
            unreachable!("iterator not positioned on a log block");
        };
        let (kv, end) = record::get(block, *prec);
        *pnext = Some(end);
        kv
    }

    fn seek_iptr(&self, iter: &MapIter) -> u32 {
        match iter {
            MapIter::Log { prec, .. } => *prec,
            _ => 0,
        }
    }

    fn insert(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        if Self::kv_count(block) > 0 {
            let against_last = {
                let last = record::get(block, get_u32(block, OFF_EDGE1)).0;
                kv.key.cmp(last.key)
            };
            if against_last == Ordering::Greater {
                return self.append(block, kv);
            }
            let against_first = {
                let first = record::get(block, get_u32(block, OFF_EDGE0)).0;
                kv.key.cmp(first.key)
            };
            if against_first == Ordering::Less {
                return self.prepend(block, kv);
            }

            Self::record_add(block, kv);
            Self::set_sorted(block, false);
            Self::avail(block)
        } else {
            self.append(block, kv)
        }
    }

    fn append(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        Self::record_add(block, kv);
        let kv_last = Self::kv_last(block);
        put_u32(block, OFF_EDGE1, kv_last);
        Self::avail(block)
    }

    fn prepend(&self, block: &mut [u8], kv: &Kv<'_>) -> u32 {
        Self::record_add(block, kv);
        let kv_last = Self::kv_last(block);
        put_u32(block, OFF_EDGE0, kv_last);
        Self::set_sorted(block, false);
        Self::avail(block)
    }

    fn has_space(&self, block: &[u8], kv: &Kv<'_>) -> bool {
        record::kv_space(kv) <= Self::avail(block)
    }

    fn max_overhead(&self) -> u32 {
        record::MAX_OVERHEAD
    }

    fn stats(&self, block: &[u8]) -> BlockStats {
        BlockStats {
            blk_size: get_u32(block, OFF_BLK_SIZE),
            blk_avail: Self::avail(block),
            is_sorted: get_u32(block, OFF_FLAGS) & FLAG_SORTED != 0,
            kv_stats: KvStats::load(block, OFF_STATS),
        }
    }
}
