//! Chained output buffers for wire payloads.
//!
//! A [`DbufWriter`] appends small inline byte runs and larger shared
//! byte-range references into a chain of fixed-capacity nodes; a
//! [`DbufReader`] turns the chain into a bounded scatter/gather view and
//! consumes it incrementally as bytes are written out. Every appended byte
//! is readable exactly once and in order, and every shared reference is
//! released exactly once, when its last byte is consumed.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Upper bound on the ranges produced by one [`DbufReader::view`] call.
pub const NIOVS: usize = 16;

/// Inline data runs are length-prefixed with one byte on the wire format
/// this mirrors, so a single run never exceeds this many bytes.
const DATA_RECORD_MAX: usize = 255;

/// Node payload granularities.
const NODE_SIZES: [usize; 3] = [64, 128, 256];

fn node_capacity(hint: usize) -> usize {
    for size in NODE_SIZES {
        if hint <= size {
            return size;
        }
    }
    NODE_SIZES[2]
}

/// A shared byte range carried by reference instead of being copied.
///
/// Clones share the backing allocation; the backing storage is released
/// when the last clone drops. A reader consuming a chain drops each
/// reference exactly once, when the range is fully consumed.
#[derive(Clone)]
pub struct ByteRef {
    data: Arc<dyn AsRef<[u8]> + Send + Sync>,
    offset: usize,
    length: usize,
}

impl core::fmt::Debug for ByteRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ByteRef")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

impl PartialEq for ByteRef {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl ByteRef {
    /// Reference `length` bytes starting at `offset` within `data`.
    ///
    /// # Panics
    ///
    /// Panics if the range falls outside `data`.
    pub fn new(data: Arc<dyn AsRef<[u8]> + Send + Sync>, offset: usize, length: usize) -> Self {
        assert!(offset + length <= (*data).as_ref().len());
        Self {
            data,
            offset,
            length,
        }
    }

    /// Reference the whole of `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self {
            data: Arc::new(bytes),
            offset: 0,
            length,
        }
    }

    /// Length of the referenced range.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The referenced bytes.
    pub fn as_slice(&self) -> &[u8] {
        &(*self.data).as_ref()[self.offset..self.offset + self.length]
    }
}

enum Record {
    /// Inline bytes at `start..start + len` of the node payload.
    Data { start: usize, len: usize },
    /// One shared range.
    Ref(ByteRef),
    /// A packed run of shared ranges.
    RefVec(VecDeque<ByteRef>),
}

struct Node {
    data: Box<[u8]>,
    used: usize,
    records: VecDeque<Record>,
}

impl Node {
    fn with_capacity(hint: usize) -> Self {
        Self {
            data: alloc::vec![0u8; node_capacity(hint)].into_boxed_slice(),
            used: 0,
            records: VecDeque::new(),
        }
    }

    fn room(&self) -> usize {
        self.data.len() - self.used
    }
}

/// Handle to a reserved byte range, for head back-patching.
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    node: usize,
    start: usize,
    len: usize,
}

impl Mark {
    /// Length of the reserved range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the reservation is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Append-side of a buffer chain.
#[derive(Default)]
pub struct DbufWriter {
    nodes: Vec<Node>,
    total: u64,
}

impl DbufWriter {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical payload bytes appended so far, shared ranges included.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn tail_room(&self) -> usize {
        self.nodes.last().map_or(0, Node::room)
    }

    /// Append inline bytes, coalescing into the open data run.
    pub fn add(&mut self, mut bytes: &[u8]) {
        self.total += bytes.len() as u64;
        while !bytes.is_empty() {
            if self.tail_room() == 0 {
                self.nodes.push(Node::with_capacity(bytes.len()));
            }
            let node = self.nodes.last_mut().expect("tail node exists");
            let room = node.room();

            let take = match node.records.back_mut() {
                Some(Record::Data { start, len })
                    if *len < DATA_RECORD_MAX && node.used == *start + *len =>
                {
                    let take = bytes.len().min(room).min(DATA_RECORD_MAX - *len);
                    node.data[node.used..node.used + take].copy_from_slice(&bytes[..take]);
                    *len += take;
                    take
                }
                _ => {
                    let take = bytes.len().min(room).min(DATA_RECORD_MAX);
                    node.data[node.used..node.used + take].copy_from_slice(&bytes[..take]);
                    node.records.push_back(Record::Data {
                        start: node.used,
                        len: take,
                    });
                    take
                }
            };
            node.used += take;
            bytes = &bytes[take..];
        }
    }

    /// Append a shared byte range without copying it.
    pub fn add_ref(&mut self, reference: ByteRef) {
        self.total += reference.len() as u64;
        if self.nodes.is_empty() {
            self.nodes.push(Node::with_capacity(0));
        }
        let node = self.nodes.last_mut().expect("tail node exists");
        node.records.push_back(Record::Ref(reference));
    }

    /// Append a packed run of shared ranges.
    pub fn commit_refs(&mut self, refs: Vec<ByteRef>) {
        if refs.is_empty() {
            return;
        }
        self.total += refs.iter().map(|r| r.len() as u64).sum::<u64>();
        if self.nodes.is_empty() {
            self.nodes.push(Node::with_capacity(0));
        }
        let node = self.nodes.last_mut().expect("tail node exists");
        node.records.push_back(Record::RefVec(refs.into()));
    }

    /// Reserve `len` contiguous zeroed bytes for later [`DbufWriter::patch`].
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds one data run (255 bytes).
    pub fn mark(&mut self, len: usize) -> Mark {
        assert!(len <= DATA_RECORD_MAX);
        self.total += len as u64;

        if self.nodes.is_empty() || self.tail_room() < len {
            self.nodes.push(Node::with_capacity(len));
        }

        let node_index = self.nodes.len() - 1;
        let node = self.nodes.last_mut().expect("tail node exists");
        let start = node.used;
        match node.records.back_mut() {
            Some(Record::Data { start: s, len: l })
                if *l + len <= DATA_RECORD_MAX && node.used == *s + *l =>
            {
                *l += len;
            }
            _ => {
                node.records.push_back(Record::Data { start, len });
            }
        }
        node.used += len;

        Mark {
            node: node_index,
            start,
            len,
        }
    }

    /// Overwrite a reserved range.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is longer than the reservation.
    pub fn patch(&mut self, mark: Mark, bytes: &[u8]) {
        assert!(bytes.len() <= mark.len);
        let node = &mut self.nodes[mark.node];
        node.data[mark.start..mark.start + bytes.len()].copy_from_slice(bytes);
    }

    /// Freeze the chain for reading.
    pub fn into_reader(self) -> DbufReader {
        DbufReader {
            nodes: self.nodes.into(),
            consumed: 0,
            remaining: self.total,
        }
    }
}

/// Consume-side of a buffer chain.
pub struct DbufReader {
    nodes: VecDeque<Node>,
    /// Bytes consumed from the front record (or its front vec element).
    consumed: usize,
    remaining: u64,
}

impl DbufReader {
    /// Bytes not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether the chain is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Gather up to [`NIOVS`] byte ranges starting at the read cursor.
    pub fn view(&self) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let mut consumed = self.consumed;
        'nodes: for node in &self.nodes {
            for record in &node.records {
                if out.len() == NIOVS {
                    break 'nodes;
                }
                match record {
                    Record::Data { start, len } => {
                        let slice = &node.data[start + consumed..start + len];
                        if !slice.is_empty() {
                            out.push(slice);
                        }
                        consumed = 0;
                    }
                    Record::Ref(r) => {
                        let slice = &r.as_slice()[consumed..];
                        if !slice.is_empty() {
                            out.push(slice);
                        }
                        consumed = 0;
                    }
                    Record::RefVec(refs) => {
                        for r in refs {
                            if out.len() == NIOVS {
                                break 'nodes;
                            }
                            let slice = &r.as_slice()[consumed..];
                            if !slice.is_empty() {
                                out.push(slice);
                            }
                            consumed = 0;
                        }
                    }
                }
            }
        }
        out
    }

    /// Advance the cursor by `n` consumed bytes.
    ///
    /// Shared references are dropped as their last byte is passed; nodes
    /// are freed once every record in them is consumed.
    pub fn remove(&mut self, n: usize) {
        let mut left = (n as u64).min(self.remaining);
        self.remaining -= left;

        while left > 0 {
            let node = self.nodes.front_mut().expect("bytes remain");
            let Some(record) = node.records.front_mut() else {
                self.nodes.pop_front();
                continue;
            };

            let rec_left = match record {
                Record::Data { len, .. } => (*len - self.consumed) as u64,
                Record::Ref(r) => (r.len() - self.consumed) as u64,
                Record::RefVec(refs) => match refs.front() {
                    Some(r) => (r.len() - self.consumed) as u64,
                    None => {
                        node.records.pop_front();
                        continue;
                    }
                },
            };

            if left < rec_left {
                self.consumed += left as usize;
                return;
            }

            left -= rec_left;
            self.consumed = 0;
            match record {
                Record::RefVec(refs) => {
                    refs.pop_front();
                    if refs.is_empty() {
                        node.records.pop_front();
                    }
                }
                _ => {
                    node.records.pop_front();
                }
            }
            if node.records.is_empty() {
                self.nodes.pop_front();
            }
        }

        // drop nodes that were already drained
        while matches!(self.nodes.front(), Some(node) if node.records.is_empty()) {
            self.nodes.pop_front();
        }
    }

    /// Release everything still queued.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.consumed = 0;
        self.remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(reader: &mut DbufReader, step: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while !reader.is_empty() {
            let view = reader.view();
            let mut taken = 0;
            for slice in view {
                let take = slice.len().min(step - taken);
                out.extend_from_slice(&slice[..take]);
                taken += take;
                if taken == step {
                    break;
                }
            }
            if taken == 0 {
                break;
            }
            reader.remove(taken);
        }
        out
    }

    #[test]
    fn inline_coalescing_round_trip() {
        let mut writer = DbufWriter::new();
        let mut expected = Vec::new();
        for chunk in [&b"hello "[..], b"world", &[0xaa; 300], b"!", &[]] {
            writer.add(chunk);
            expected.extend_from_slice(chunk);
        }
        assert_eq!(writer.total(), expected.len() as u64);

        let mut reader = writer.into_reader();
        assert_eq!(drain(&mut reader, 7), expected);
        assert!(reader.is_empty());
    }

    #[test]
    fn refs_are_released_exactly_once() {
        let payload: Arc<dyn AsRef<[u8]> + Send + Sync> = Arc::new(vec![0x42u8; 128]);
        let mut writer = DbufWriter::new();

        writer.add(b"head");
        writer.add_ref(ByteRef::new(payload.clone(), 0, 64));
        writer.add(b"mid");
        writer.commit_refs(vec![
            ByteRef::new(payload.clone(), 64, 32),
            ByteRef::new(payload.clone(), 96, 32),
        ]);
        assert_eq!(Arc::strong_count(&payload), 4);
        assert_eq!(writer.total(), 4 + 64 + 3 + 64);

        let mut reader = writer.into_reader();

        // partially consuming the first ref keeps it alive
        reader.remove(4 + 10);
        assert_eq!(Arc::strong_count(&payload), 4);

        // crossing its end releases it
        reader.remove(54 + 3 + 1);
        assert_eq!(Arc::strong_count(&payload), 3);

        reader.remove(31 + 32);
        assert_eq!(Arc::strong_count(&payload), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn clear_releases_pending_refs() {
        let payload: Arc<dyn AsRef<[u8]> + Send + Sync> = Arc::new(vec![1u8; 16]);
        let mut writer = DbufWriter::new();
        writer.add_ref(ByteRef::new(payload.clone(), 0, 16));
        let mut reader = writer.into_reader();
        reader.clear();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn mark_and_patch() {
        let mut writer = DbufWriter::new();
        let mark = writer.mark(4);
        writer.add(b"payload");
        writer.patch(mark, &(7u32).to_le_bytes());

        let reader = writer.into_reader();
        let view = reader.view();
        let flat: Vec<u8> = view.concat();
        assert_eq!(&flat[..4], &(7u32).to_le_bytes());
        assert_eq!(&flat[4..], b"payload");
    }

    #[test]
    fn view_interleaves_data_and_refs_in_order() {
        let mut writer = DbufWriter::new();
        writer.add(b"aa");
        writer.add_ref(ByteRef::from_vec(b"bb".to_vec()));
        writer.add(b"cc");

        let mut reader = writer.into_reader();
        assert_eq!(drain(&mut reader, 1), b"aabbcc");
    }

    #[test]
    fn writer_spills_across_many_nodes() {
        let mut writer = DbufWriter::new();
        let big = vec![0x5au8; 5000];
        writer.add(&big);
        let mut reader = writer.into_reader();
        assert_eq!(drain(&mut reader, 512), big);
    }
}
