//! Frame construction and the per-connection outbound queue.

use crate::head::{encode_head, MsgHead, PkgType, MAX_HEAD_SIZE};
use crate::WireError;
use reef_buf::{ByteRef, DbufReader, DbufWriter, Mark};

use std::collections::VecDeque;
use std::io;

/// Builds one outgoing frame into a buffer chain.
///
/// The head is written first through a patchable reservation, so the body
/// and data payloads can be streamed in before their final lengths are
/// known; [`FrameBuilder::finish`] patches the lengths in place. The widths
/// reserved for the lengths come from the upper bounds passed to
/// [`FrameBuilder::begin`], so the final lengths must not exceed them.
pub struct FrameBuilder {
    dbuf: DbufWriter,
    mark: Mark,
    pkg: PkgType,
    head: MsgHead,
    /// Length-field widths fixed by the bounds passed to `begin`.
    body_width: usize,
    data_width: usize,
}

impl FrameBuilder {
    /// Start a frame; `body_max`/`data_max` bound the payload lengths
    /// patched in by [`FrameBuilder::finish`].
    pub fn begin(
        pkg: PkgType,
        msg_type: u32,
        msg_id: u64,
        fwd: &[u8],
        body_max: u32,
        data_max: u32,
    ) -> Result<Self, WireError> {
        let head = MsgHead {
            msg_type,
            msg_id,
            fwd_length: fwd.len() as u32,
            body_length: body_max,
            data_length: data_max,
        };

        let mut hbuf = [0u8; MAX_HEAD_SIZE];
        let size = encode_head(&mut hbuf, pkg, &head)?;

        let mut dbuf = DbufWriter::new();
        let mark = dbuf.mark(size);
        dbuf.patch(mark, &hbuf[..size]);
        dbuf.add(fwd);

        Ok(Self {
            dbuf,
            mark,
            pkg,
            head,
            body_width: reef_types::varint::zsize_u32(body_max),
            data_width: reef_types::varint::zsize_u32(data_max),
        })
    }

    /// The underlying chain; append body and data payload through it.
    pub fn buf(&mut self) -> &mut DbufWriter {
        &mut self.dbuf
    }

    /// Append inline payload bytes.
    pub fn add(&mut self, bytes: &[u8]) {
        self.dbuf.add(bytes);
    }

    /// Append a shared payload range.
    pub fn add_ref(&mut self, reference: ByteRef) {
        self.dbuf.add_ref(reference);
    }

    /// Patch the final body/data lengths and seal the frame.
    ///
    /// # Panics
    ///
    /// Panics if a final length exceeds the bound passed to `begin` in a
    /// way that would need a wider length field.
    pub fn finish(mut self, body_length: u32, data_length: u32) -> DbufReader {
        assert!(
            reef_types::varint::zsize_u32(body_length) <= self.body_width
                && reef_types::varint::zsize_u32(data_length) <= self.data_width,
            "frame payload exceeded the bound declared to begin()"
        );
        self.head.body_length = body_length;
        self.head.data_length = data_length;

        // re-encode with the reserved widths; a shrunken length still
        // decodes correctly from the wider field
        let mt = reef_types::varint::size_u32(self.head.msg_type);
        let fw = reef_types::varint::zsize_u32(self.head.fwd_length);
        let mi = reef_types::varint::size(self.head.msg_id);
        let (b, d) = (self.body_width, self.data_width);

        let mut hbuf = [0u8; MAX_HEAD_SIZE];
        hbuf[0] = ((self.pkg as u8) << 4) | (((mt - 1) as u8) << 2) | fw as u8;
        hbuf[1] = (((mi - 1) as u8) << 5) | ((b as u8) << 3) | d as u8;

        let mut at = 2;
        reef_types::varint::encode_into(&mut hbuf[at..], mt, self.head.msg_type as u64);
        at += mt;
        reef_types::varint::encode_into(&mut hbuf[at..], mi, self.head.msg_id);
        at += mi;
        reef_types::varint::encode_into(&mut hbuf[at..], fw, self.head.fwd_length as u64);
        at += fw;
        reef_types::varint::encode_into(&mut hbuf[at..], b, self.head.body_length as u64);
        at += b;
        reef_types::varint::encode_into(&mut hbuf[at..], d, self.head.data_length as u64);
        at += d;
        debug_assert_eq!(at, self.mark.len());

        self.dbuf.patch(self.mark, &hbuf[..at]);
        self.dbuf.into_reader()
    }
}

/// Sink the outbound queue drains into.
pub trait ByteSink {
    /// Vectored write; returns bytes accepted.
    fn writev(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize>;
}

/// Queue of sealed outbound frames on one connection.
#[derive(Default)]
pub struct FrameQueue {
    frames: VecDeque<DbufReader>,
    queued: u64,
}

impl FrameQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes not yet written out.
    pub fn pending(&self) -> u64 {
        self.queued
    }

    /// Whether anything is waiting to be written.
    pub fn has_data(&self) -> bool {
        self.queued > 0
    }

    /// Enqueue a sealed frame.
    pub fn push(&mut self, frame: DbufReader) {
        self.queued += frame.remaining();
        self.frames.push_back(frame);
    }

    /// Write queued frames until the sink blocks or the queue drains.
    ///
    /// Returns true when the queue is empty.
    pub fn flush(&mut self, sink: &mut dyn ByteSink) -> io::Result<bool> {
        while let Some(frame) = self.frames.front_mut() {
            if frame.is_empty() {
                self.frames.pop_front();
                continue;
            }

            let written = {
                let view = frame.view();
                let iov: Vec<io::IoSlice<'_>> = view.iter().map(|s| io::IoSlice::new(s)).collect();
                sink.writev(&iov)
            };
            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    frame.remove(n);
                    self.queued -= n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drop every queued frame, releasing their payload references.
    pub fn clear(&mut self) {
        for mut frame in self.frames.drain(..) {
            frame.clear();
        }
        self.queued = 0;
    }
}

/// Encode one complete frame into a flat byte vector.
///
/// Convenience for clients and tests; the server path streams frames
/// through [`FrameBuilder`] instead.
pub fn encode_frame(
    pkg: PkgType,
    msg_type: u32,
    msg_id: u64,
    fwd: &[u8],
    body: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, WireError> {
    let head = MsgHead {
        msg_type,
        msg_id,
        fwd_length: fwd.len() as u32,
        body_length: body.len() as u32,
        data_length: data.len() as u32,
    };
    let mut hbuf = [0u8; MAX_HEAD_SIZE];
    let size = encode_head(&mut hbuf, pkg, &head)?;

    let mut out = Vec::with_capacity(size + fwd.len() + body.len() + data.len());
    out.extend_from_slice(&hbuf[..size]);
    out.extend_from_slice(fwd);
    out.extend_from_slice(body);
    out.extend_from_slice(data);
    Ok(out)
}
