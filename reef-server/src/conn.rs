//! Connection and listener entities.

use crate::ops;

use reef_eloop::iopoll::{Entity, EntityCtl, Registration};
use reef_eloop::sock;
use reef_engine::Store;
use reef_wire::{ByteSink, ByteSource, Frame, FrameQueue, FrameReader, MsgHead, MsgStats, PkgType, Protocol, WireError};

use socket2::Socket;

use std::cell::RefCell;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

/// Store shared by every connection of one engine thread.
pub type SharedStore = Rc<RefCell<Store>>;

struct SockIo<'a>(&'a Socket);

impl ByteSource for SockIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.0;
        socket.read(buf)
    }
}

impl ByteSink for SockIo<'_> {
    fn writev(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.0.send_vectored(bufs)
    }
}

/// One accepted stream connection.
///
/// Owns the socket, the inbound frame reassembly state and the outbound
/// frame queue; requests published by the reader are dispatched into the
/// store and their responses queued in arrival order.
pub struct Connection {
    socket: Socket,
    reader: FrameReader,
    queue: FrameQueue,
    store: SharedStore,
    stats: MsgStats,
}

impl Connection {
    /// Wrap an accepted socket.
    pub fn new(socket: Socket, store: SharedStore) -> Self {
        Self {
            socket,
            reader: FrameReader::new(),
            queue: FrameQueue::new(),
            store,
            stats: MsgStats::new(),
        }
    }
}

/// Reader-side protocol hooks: dispatch on publish.
struct RequestHandler<'a> {
    store: &'a SharedStore,
    queue: &'a mut FrameQueue,
    stats: &'a mut MsgStats,
}

impl Protocol for RequestHandler<'_> {
    fn publish(&mut self, pkg: PkgType, head: &MsgHead, frame: Frame) -> Result<(), WireError> {
        if pkg != PkgType::Request {
            return Err(WireError::Rejected);
        }
        self.stats.add(head);

        let mut store = self.store.borrow_mut();
        let response = ops::dispatch(&mut store, head, &frame.body, frame.data)?;
        self.queue.push(response);
        Ok(())
    }
}

impl Entity for Connection {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let mut handler = RequestHandler {
            store: &self.store,
            queue: &mut self.queue,
            stats: &mut self.stats,
        };
        let mut source = SockIo(&self.socket);
        match self.reader.read(&mut source, &mut handler) {
            Ok(()) => {
                ctl.set_data_available(self.queue.has_data());
                Ok(())
            }
            Err(WireError::Io(e)) => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "connection framing failed");
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }

    fn write(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let mut sink = SockIo(&self.socket);
        let drained = self.queue.flush(&mut sink)?;
        ctl.set_data_available(!drained);
        Ok(())
    }

    fn close(&mut self) {
        self.queue.clear();
    }
}

/// Stream listener entity; accepted sockets become [`Connection`]s on the
/// same engine.
pub struct Listener {
    socket: Socket,
    store: SharedStore,
}

impl Listener {
    /// Wrap a listening socket.
    pub fn new(socket: Socket, store: SharedStore) -> Self {
        Self { socket, store }
    }
}

impl Entity for Listener {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        while let Some((socket, addr)) = sock::accept(&self.socket)? {
            tracing::debug!(peer = ?addr.as_socket(), "connection accepted");
            ctl.register(Registration::Io(Box::new(Connection::new(
                socket,
                self.store.clone(),
            ))));
        }
        Ok(())
    }
}

/// Datagram endpoint: every datagram carries exactly one frame and is
/// answered with a single response datagram.
pub struct Datagram {
    socket: Socket,
    store: SharedStore,
    stats: MsgStats,
}

impl Datagram {
    /// Wrap a bound datagram socket.
    pub fn new(socket: Socket, store: SharedStore) -> Self {
        Self {
            socket,
            store,
            stats: MsgStats::new(),
        }
    }
}

impl Entity for Datagram {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read(&mut self, _ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let mut raw = [std::mem::MaybeUninit::<u8>::uninit(); 64 << 10];
        loop {
            let (size, peer) = match self.socket.recv_from(&mut raw) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            // recv_from initialized the first `size` bytes
            #[allow(unsafe_code)]
            let bytes: &[u8] = unsafe {
                std::slice::from_raw_parts(raw.as_ptr() as *const u8, size)
            };

            let mut reader = FrameReader::new();
            let mut source = reef_wire::SliceSource::new(bytes, bytes.len().max(1));

            // responses collect into a scratch queue, then leave as one
            // datagram
            let mut queue = FrameQueue::new();
            let mut handler = RequestHandler {
                store: &self.store,
                queue: &mut queue,
                stats: &mut self.stats,
            };
            if reader.read(&mut source, &mut handler).is_err() {
                tracing::debug!(peer = ?peer.as_socket(), "bad datagram frame");
                continue;
            }

            let mut out = Vec::new();
            while queue.has_data() {
                let mut sink = VecSink(&mut out);
                if queue.flush(&mut sink).is_err() {
                    break;
                }
            }
            if !out.is_empty() {
                let _ = self.socket.send_to(&out, &peer);
            }
        }
    }
}

struct VecSink<'a>(&'a mut Vec<u8>);

impl ByteSink for VecSink<'_> {
    fn writev(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let mut written = 0;
        for buf in bufs {
            self.0.extend_from_slice(buf);
            written += buf.len();
        }
        Ok(written)
    }
}
