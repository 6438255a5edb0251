use crate::conn::{Datagram, Listener, SharedStore};

use reef_eloop::iopoll::Engine;
use reef_eloop::sock;
use reef_engine::Store;

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Listener endpoints; every `None` transport stays unbound.
#[derive(Debug, Default, Clone)]
pub struct ServerConfig {
    /// TCP listener address.
    pub tcp: Option<SocketAddr>,
    /// UDP endpoint address.
    pub udp: Option<SocketAddr>,
    /// Unix-domain stream socket path.
    pub unix: Option<PathBuf>,
    /// Listen backlog for the stream transports.
    pub backlog: i32,
}

impl ServerConfig {
    /// Config with a sensible backlog and no endpoints.
    pub fn new() -> Self {
        Self {
            backlog: 128,
            ..Self::default()
        }
    }
}

/// One engine thread's worth of server: a poll engine, a store, and the
/// listeners that feed it.
///
/// The server does not own a thread; the front end drives [`Server::poll`]
/// from whatever loop it runs. Connections accepted here stay here.
pub struct Server {
    engine: Engine,
    store: SharedStore,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind the configured endpoints over a fresh store.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        Self::bind_with_store(config, Store::new())
    }

    /// Bind the configured endpoints over a caller-built store.
    pub fn bind_with_store(config: &ServerConfig, store: Store) -> io::Result<Self> {
        let mut engine = Engine::open()?;
        let store: SharedStore = Rc::new(RefCell::new(store));

        let mut tcp_addr = None;
        if let Some(addr) = config.tcp {
            let socket = sock::tcp_listen(addr, config.backlog)?;
            tcp_addr = socket.local_addr()?.as_socket();
            engine.add(Box::new(Listener::new(socket, store.clone())))?;
            tracing::info!(addr = ?tcp_addr, "tcp listener bound");
        }

        let mut udp_addr = None;
        if let Some(addr) = config.udp {
            let socket = sock::udp_bind(addr)?;
            udp_addr = socket.local_addr()?.as_socket();
            engine.add(Box::new(Datagram::new(socket, store.clone())))?;
            tracing::info!(addr = ?udp_addr, "udp endpoint bound");
        }

        if let Some(path) = &config.unix {
            let socket = sock::unix_listen(path, config.backlog)?;
            engine.add(Box::new(Listener::new(socket, store.clone())))?;
            tracing::info!(path = %path.display(), "unix listener bound");
        }

        Ok(Self {
            engine,
            store,
            tcp_addr,
            udp_addr,
        })
    }

    /// Address the TCP listener actually bound, port resolution included.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Address the UDP endpoint actually bound.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// The store behind this server.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// The engine, for registering extra entities (timers, wakeups).
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Process one poll round.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.engine.poll(timeout)
    }

    /// Poll until `stop` returns true, in `tick`-sized rounds.
    pub fn run_until(&mut self, tick: Duration, mut stop: impl FnMut() -> bool) -> io::Result<()> {
        while !stop() {
            self.poll(Some(tick))?;
        }
        Ok(())
    }
}
