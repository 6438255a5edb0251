use reef_eloop::iopoll::{Engine, Entity, EntityCtl, Registration};
use reef_eloop::sock;

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

struct UeventProbe {
    fired: Rc<Cell<u32>>,
}

impl Entity for UeventProbe {
    fn uevent(&mut self, _ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        self.fired.set(self.fired.get() + 1);
        Ok(())
    }
}

#[test]
fn uevent_notifier_wakes_the_engine() {
    let mut engine = Engine::open().unwrap();
    let fired = Rc::new(Cell::new(0));
    let token = engine
        .add_uevent(Box::new(UeventProbe { fired: fired.clone() }))
        .unwrap();
    let notifier = engine.notifier(token).unwrap();

    // nothing pending: the poll returns empty
    assert_eq!(engine.poll(Some(Duration::from_millis(10))).unwrap(), 0);

    notifier.notify().unwrap();
    engine.poll(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(fired.get(), 1);

    // notifications from another thread work the same way
    let handle = std::thread::spawn(move || notifier.notify().unwrap());
    handle.join().unwrap();
    engine.poll(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(fired.get(), 2);
    assert!(engine.stats().event.events() >= 2);
}

struct TimerProbe {
    fired: Rc<Cell<u32>>,
}

impl Entity for TimerProbe {
    fn timeout(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        self.fired.set(self.fired.get() + 1);
        if self.fired.get() < 3 {
            ctl.rearm(Duration::from_millis(1))?;
        }
        Ok(())
    }
}

#[test]
fn one_shot_timer_rearms_from_its_callback() {
    let mut engine = Engine::open().unwrap();
    let fired = Rc::new(Cell::new(0));
    engine
        .add_timer(
            Box::new(TimerProbe { fired: fired.clone() }),
            Duration::from_millis(1),
            None,
        )
        .unwrap();

    for _ in 0..50 {
        engine.poll(Some(Duration::from_millis(20))).unwrap();
        if fired.get() >= 3 {
            break;
        }
    }
    assert_eq!(fired.get(), 3, "fires once per re-arm");
    assert!(engine.stats().timeout.events() >= 3);
}

struct Echo {
    socket: socket2::Socket,
    queued: RefCell<Vec<u8>>,
}

impl Entity for Echo {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match (&self.socket).read(&mut buf) {
                Ok(0) => {
                    ctl.shutdown();
                    return Ok(());
                }
                Ok(n) => self.queued.borrow_mut().extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        ctl.set_data_available(!self.queued.borrow().is_empty());
        Ok(())
    }

    fn write(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let mut queued = self.queued.borrow_mut();
        while !queued.is_empty() {
            match (&self.socket).write(&queued) {
                Ok(n) => {
                    queued.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        ctl.set_data_available(!queued.is_empty());
        Ok(())
    }
}

struct EchoListener {
    socket: socket2::Socket,
}

impl Entity for EchoListener {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn read(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        while let Some((socket, _)) = sock::accept(&self.socket)? {
            ctl.register(Registration::Io(Box::new(Echo {
                socket,
                queued: RefCell::new(Vec::new()),
            })));
        }
        Ok(())
    }
}

#[test]
fn accepted_connections_echo_on_the_same_engine() {
    let mut engine = Engine::open().unwrap();
    let listener = sock::tcp_listen(sock::resolve("127.0.0.1:0").unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    engine.add(Box::new(EchoListener { socket: listener })).unwrap();

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    client.write_all(b"ping-pong over the poll engine").unwrap();

    let mut got = Vec::new();
    for _ in 0..100 {
        engine.poll(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 256];
        match client.read(&mut buf) {
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => panic!("client read: {e}"),
        }
        if got.len() >= 30 {
            break;
        }
    }
    assert_eq!(got, b"ping-pong over the poll engine");

    // listener + one connection are registered; dropping the client hangs
    // the connection up on a later poll
    assert_eq!(engine.len(), 2);
    drop(client);
    for _ in 0..100 {
        engine.poll(Some(Duration::from_millis(10))).unwrap();
        if engine.len() == 1 {
            break;
        }
    }
    assert_eq!(engine.len(), 1);
    assert!(engine.stats().ioread.events() > 0);
    assert!(engine.load() > 0.0);
}
