//! Socket setup helpers.
//!
//! Everything returned here is non-blocking and ready for edge-triggered
//! registration with an [`crate::iopoll::Engine`].

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// Resolve `addr`, preferring the first usable address.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))
}

/// Non-blocking TCP listener with `SO_REUSEADDR`.
pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Start a non-blocking TCP connect; completion surfaces as writability.
pub fn tcp_connect(addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(socket)
}

/// Non-blocking bound UDP socket.
pub fn udp_bind(addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket)
}

/// Non-blocking unix-domain stream listener; replaces a stale socket file.
pub fn unix_listen(path: &Path, backlog: i32) -> io::Result<Socket> {
    let _ = std::fs::remove_file(path);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Connect to a unix-domain stream socket.
pub fn unix_connect(path: &Path) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.connect(&SockAddr::unix(path)?)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Accept one pending connection, non-blocking with `TCP_NODELAY` where
/// the transport supports it.
///
/// Returns `None` once the accept queue drains.
pub fn accept(listener: &Socket) -> io::Result<Option<(Socket, SockAddr)>> {
    match listener.accept() {
        Ok((socket, addr)) => {
            socket.set_nonblocking(true)?;
            let _ = socket.set_nodelay(true); // not a stream, or not TCP
            Ok(Some((socket, addr)))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_listen_and_connect() {
        let listener = tcp_listen(resolve("127.0.0.1:0").unwrap(), 16).unwrap();
        let local = listener.local_addr().unwrap().as_socket().unwrap();

        let _client = tcp_connect(local).unwrap();
        // the non-blocking accept may need a beat for the handshake
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = accept(&listener).unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn udp_bind_is_nonblocking() {
        let socket = udp_bind(resolve("127.0.0.1:0").unwrap()).unwrap();
        let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 16];
        let err = socket.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
