//! Stateful frame reassembly.

use crate::head::{decode_head, head_size, MsgHead, PkgType, MAX_HEAD_SIZE};
use crate::WireError;

use std::io;
use std::io::IoSliceMut;

/// Frames larger than this are treated as malformed.
const MAX_FRAME_PAYLOAD: u64 = 64 << 20;

/// Byte stream the reader pulls from.
///
/// `Ok(0)` means the peer closed the stream; a non-blocking source with
/// nothing buffered returns [`io::ErrorKind::WouldBlock`].
pub trait ByteSource {
    /// Read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Vectored read; the default loops over [`ByteSource::read`].
    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match self.read(buf) {
                Ok(0) if total == 0 => return Ok(0),
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// In-memory source delivering at most `chunk` bytes per read, for tests
/// and for replaying buffered bytes.
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    chunk: usize,
}

impl<'a> SliceSource<'a> {
    /// Source over `bytes` delivering `chunk` bytes per read call.
    pub fn new(bytes: &'a [u8], chunk: usize) -> Self {
        Self { bytes, chunk }
    }
}

impl ByteSource for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.bytes.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let take = self.bytes.len().min(buf.len()).min(self.chunk);
        buf[..take].copy_from_slice(&self.bytes[..take]);
        self.bytes = &self.bytes[take..];
        Ok(take)
    }
}

/// Payload buffers of one frame, allocated by [`Protocol::alloc`].
#[derive(Debug, Default)]
pub struct Frame {
    /// Routing payload.
    pub fwd: Vec<u8>,
    /// Structured payload.
    pub body: Vec<u8>,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl Frame {
    /// Buffers sized for `head`.
    pub fn for_head(head: &MsgHead) -> Self {
        Self {
            fwd: vec![0; head.fwd_length as usize],
            body: vec![0; head.body_length as usize],
            data: vec![0; head.data_length as usize],
        }
    }
}

/// Consumer driving payload allocation and frame delivery.
pub trait Protocol {
    /// Reserve the payload buffers for a parsed head.
    ///
    /// Returning an error poisons the reader; the connection owner is
    /// expected to drop it.
    fn alloc(&mut self, pkg: PkgType, head: &MsgHead) -> Result<Frame, WireError> {
        let _ = pkg;
        Ok(Frame::for_head(head))
    }

    /// Take delivery of one complete frame.
    ///
    /// Called exactly once per frame, only after every payload byte has
    /// arrived.
    fn publish(&mut self, pkg: PkgType, head: &MsgHead, frame: Frame) -> Result<(), WireError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Head,
    Payload,
    Failure,
}

/// Frame reassembly state machine.
///
/// `Head -> Fwd -> Body -> Data -> publish -> Head`, with the three payload
/// sections filled by one vectored read per wakeup; any error moves the
/// reader into an absorbing failure state.
pub struct FrameReader {
    state: ReadState,
    hbuf: [u8; MAX_HEAD_SIZE],
    hlen: usize,
    pkg: PkgType,
    head: MsgHead,
    frame: Option<Frame>,
    filled: u64,
    read_calls: u32,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Reader positioned at a frame boundary.
    pub fn new() -> Self {
        Self {
            state: ReadState::Head,
            hbuf: [0; MAX_HEAD_SIZE],
            hlen: 0,
            pkg: PkgType::Request,
            head: MsgHead::default(),
            frame: None,
            filled: 0,
            read_calls: 0,
        }
    }

    /// Reads issued for the frame currently being assembled.
    pub fn read_calls(&self) -> u32 {
        self.read_calls
    }

    /// Pump bytes from `src` until it would block, publishing every frame
    /// that completes.
    ///
    /// Any failure (transport, malformed head, protocol refusal) poisons
    /// the reader; later calls keep returning [`WireError::Failed`].
    pub fn read(
        &mut self,
        src: &mut dyn ByteSource,
        proto: &mut dyn Protocol,
    ) -> Result<(), WireError> {
        match self.pump(src, proto) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(e, WireError::Failed) {
                    tracing::debug!(error = %e, "frame reader entered failure state");
                }
                self.state = ReadState::Failure;
                Err(e)
            }
        }
    }

    fn pump(&mut self, src: &mut dyn ByteSource, proto: &mut dyn Protocol) -> Result<(), WireError> {
        loop {
            match self.state {
                ReadState::Failure => return Err(WireError::Failed),
                ReadState::Head => {
                    if self.hlen >= 2 && self.hlen >= head_size(self.hbuf[0], self.hbuf[1]) {
                        self.parse_head(proto)?;
                        continue;
                    }
                    match src.read(&mut self.hbuf[self.hlen..]) {
                        Ok(0) => return Err(WireError::Closed),
                        Ok(n) => {
                            self.hlen += n;
                            self.read_calls += 1;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
                ReadState::Payload => {
                    if self.fill_payload(src)? {
                        self.publish(proto)?;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Parse the buffered head, reserve payload buffers and seed them with
    /// any payload bytes that were over-read into the head buffer.
    fn parse_head(&mut self, proto: &mut dyn Protocol) -> Result<(), WireError> {
        let need = head_size(self.hbuf[0], self.hbuf[1]);
        let (pkg, head) = decode_head(&self.hbuf[..need])?;
        if head.payload_length() > MAX_FRAME_PAYLOAD {
            return Err(WireError::Oversize);
        }

        let frame = proto.alloc(pkg, &head)?;
        debug_assert_eq!(frame.fwd.len(), head.fwd_length as usize);
        debug_assert_eq!(frame.body.len(), head.body_length as usize);
        debug_assert_eq!(frame.data.len(), head.data_length as usize);

        self.pkg = pkg;
        self.head = head;
        self.frame = Some(frame);
        self.filled = 0;
        self.state = ReadState::Payload;

        // payload (and possibly next-frame) bytes already read with the head
        let over = self.hlen - need;
        if over > 0 {
            let mut spill = [0u8; MAX_HEAD_SIZE];
            spill[..over].copy_from_slice(&self.hbuf[need..self.hlen]);
            self.hlen = 0;
            let leftover = self.seed_payload(&spill[..over]);
            if leftover > 0 {
                // a following frame starts inside the spill
                self.hbuf[..leftover].copy_from_slice(&spill[over - leftover..over]);
            }
            self.hlen = leftover;
        } else {
            self.hlen = 0;
        }
        Ok(())
    }

    /// Copy spilled bytes into the payload sections; returns how many of
    /// them belong to the next frame.
    fn seed_payload(&mut self, mut spill: &[u8]) -> usize {
        let frame = self.frame.as_mut().expect("payload in progress");
        let total = self.head.payload_length();
        while !spill.is_empty() && self.filled < total {
            let (section, at) = section_at(&self.head, self.filled);
            let buf = match section {
                Section::Fwd => &mut frame.fwd,
                Section::Body => &mut frame.body,
                Section::Data => &mut frame.data,
            };
            let take = spill.len().min(buf.len() - at);
            buf[at..at + take].copy_from_slice(&spill[..take]);
            self.filled += take as u64;
            spill = &spill[take..];
        }
        spill.len()
    }

    /// One vectored read over the unfilled payload remainder.
    ///
    /// Returns true once the frame is complete.
    fn fill_payload(&mut self, src: &mut dyn ByteSource) -> Result<bool, WireError> {
        let total = self.head.payload_length();
        if self.filled == total {
            return Ok(true);
        }

        let frame = self.frame.as_mut().expect("payload in progress");
        let (fwd_at, body_at, data_at) = section_fill(&self.head, self.filled);
        let mut iov = [
            IoSliceMut::new(&mut frame.fwd[fwd_at..]),
            IoSliceMut::new(&mut frame.body[body_at..]),
            IoSliceMut::new(&mut frame.data[data_at..]),
        ];

        match src.readv(&mut iov) {
            Ok(0) => Err(WireError::Closed),
            Ok(n) => {
                self.filled += n as u64;
                self.read_calls += 1;
                Ok(self.filled == total)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&mut self, proto: &mut dyn Protocol) -> Result<(), WireError> {
        let frame = self.frame.take().expect("complete frame");
        proto.publish(self.pkg, &self.head, frame)?;
        self.state = ReadState::Head;
        self.filled = 0;
        self.read_calls = 0;
        Ok(())
    }
}

enum Section {
    Fwd,
    Body,
    Data,
}

/// Section and intra-section offset for global payload offset `filled`.
fn section_at(head: &MsgHead, filled: u64) -> (Section, usize) {
    let fwd = head.fwd_length as u64;
    let body = head.body_length as u64;
    if filled < fwd {
        (Section::Fwd, filled as usize)
    } else if filled < fwd + body {
        (Section::Body, (filled - fwd) as usize)
    } else {
        (Section::Data, (filled - fwd - body) as usize)
    }
}

/// Per-section fill offsets (saturated at the section length).
fn section_fill(head: &MsgHead, filled: u64) -> (usize, usize, usize) {
    let fwd = head.fwd_length as u64;
    let body = head.body_length as u64;
    let fwd_at = filled.min(fwd);
    let body_at = filled.saturating_sub(fwd).min(body);
    let data_at = filled.saturating_sub(fwd + body);
    (fwd_at as usize, body_at as usize, data_at as usize)
}
