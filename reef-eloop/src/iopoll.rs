//! Edge-triggered I/O poll engine.
//!
//! One engine owns an epoll instance, the entities registered with it and
//! the latency accounting for everything it dispatches. Entities are
//! sockets, timers (timerfd) or user events (eventfd); each is affinitized
//! to its engine for life. Event processing follows a fixed order: hangup,
//! user event, timeout, read, then write with its subscription dance —
//! write interest is only armed while output is actually queued, and torn
//! down after a second of writable events with nothing to send.
//!
//! The kqueue flavor of the original engine is not compiled here; the
//! backend boundary is this module's private syscall wrappers.

use reef_types::histogram::TimeHistogram;

use bitflags::bitflags;
use slab::Slab;

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

bitflags! {
    /// Entity state and event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u8 {
        /// Readable, or a pending accept.
        const READABLE = 1 << 0;
        /// Write interest is armed with the poller.
        const WRITABLE = 1 << 1;
        /// Peer hung up, or the entity asked to be closed.
        const HANGUP = 1 << 2;
        /// Timer expiry.
        const TIMEOUT = 1 << 3;
        /// User event wakeup.
        const UEVENT = 1 << 4;
        /// Outbound bytes are queued on the entity.
        const HAS_DATA = 1 << 5;
    }
}

/// Handle to a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(usize);

/// Something registered with an engine.
pub trait Entity {
    /// File descriptor to poll; ignored for timer and user-event entities.
    fn fd(&self) -> RawFd {
        -1
    }

    /// Readable event. An error closes the entity.
    fn read(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let _ = ctl;
        Ok(())
    }

    /// Queued output should be flushed. An error closes the entity.
    fn write(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let _ = ctl;
        Ok(())
    }

    /// Timer expiry. An error closes the entity.
    fn timeout(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let _ = ctl;
        Ok(())
    }

    /// User-event wakeup. An error closes the entity.
    fn uevent(&mut self, ctl: &mut EntityCtl<'_>) -> io::Result<()> {
        let _ = ctl;
        Ok(())
    }

    /// About to be dropped from the engine; release owned resources.
    fn close(&mut self) {}
}

/// What an entity callback may do to its own registration.
pub struct EntityCtl<'a> {
    token: Token,
    flags: &'a mut Events,
    timer_fd: RawFd,
    pending: &'a mut Vec<Registration>,
    now: u64,
}

impl EntityCtl<'_> {
    /// This entity's token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Monotonic timestamp of the current event batch, in nanoseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Mark whether outbound bytes are queued; drives write-interest.
    pub fn set_data_available(&mut self, has_data: bool) {
        self.flags.set(Events::HAS_DATA, has_data);
    }

    /// Request a deferred close once the current event finishes.
    pub fn shutdown(&mut self) {
        self.flags.insert(Events::HANGUP);
    }

    /// Register another entity on the same engine once the batch ends.
    pub fn register(&mut self, registration: Registration) {
        self.pending.push(registration);
    }

    /// Re-arm a one-shot timer entity.
    pub fn rearm(&mut self, after: Duration) -> io::Result<()> {
        if self.timer_fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a timer entity"));
        }
        timerfd_arm(self.timer_fd, after, None)
    }
}

/// Deferred registration created inside an entity callback.
pub enum Registration {
    /// Poll the entity's own descriptor for readability.
    Io(Box<dyn Entity>),
    /// Fire the entity's `timeout` on a timer.
    Timer {
        /// The entity to notify.
        entity: Box<dyn Entity>,
        /// First expiry.
        after: Duration,
        /// Repeat period; one-shot when `None`.
        every: Option<Duration>,
    },
    /// Fire the entity's `uevent` when notified.
    UserEvent(Box<dyn Entity>),
}

enum Kind {
    Io,
    Timer,
    User,
}

struct Entry {
    entity: Box<dyn Entity>,
    kind: Kind,
    /// Descriptor registered with epoll (socket, timerfd or eventfd).
    fd: RawFd,
    flags: Events,
    /// Seconds timestamp of the last write-interest touch.
    last_write_ts: u64,
}

/// Callback latency histograms of one engine.
pub struct EngineStats {
    /// Time spent blocked in the poller.
    pub iowait: TimeHistogram,
    /// Read callback latency.
    pub ioread: TimeHistogram,
    /// Write callback latency.
    pub iowrite: TimeHistogram,
    /// User-event callback latency.
    pub event: TimeHistogram,
    /// Timeout callback latency.
    pub timeout: TimeHistogram,
}

impl EngineStats {
    fn new() -> Self {
        Self {
            iowait: TimeHistogram::time(),
            ioread: TimeHistogram::time(),
            iowrite: TimeHistogram::time(),
            event: TimeHistogram::time(),
            timeout: TimeHistogram::time(),
        }
    }
}

/// Rotating three-bucket utilization window.
#[derive(Default)]
struct LoadTracker {
    tail: usize,
    max_events: u32,
    events: [u32; 3],
    idle: [u64; 3],
    active: [u64; 3],
}

impl LoadTracker {
    fn add_events(&mut self, nevents: usize, idle_nanos: u64) {
        let nevents = nevents as u32;
        self.max_events = self.max_events.max(nevents);
        let tail = self.tail;
        if self.events[tail] + nevents < 0xffff {
            self.events[tail] += nevents;
            self.idle[tail] += idle_nanos;
        } else {
            self.tail = (tail + 1) % 3;
            self.events[self.tail] = nevents;
            self.idle[self.tail] = idle_nanos;
            self.active[self.tail] = 0;
        }
    }

    fn add_active(&mut self, nanos: u64) {
        self.active[self.tail] += nanos;
    }

    fn load(&self) -> f32 {
        let active: u64 = 1 + self.active.iter().sum::<u64>();
        let idle: u64 = 1 + self.idle.iter().sum::<u64>();
        (active as f32 * 100.0) / (active + idle) as f32
    }
}

/// One I/O poll engine; owns its epoll instance and its entities.
pub struct Engine {
    epfd: RawFd,
    entities: Slab<Entry>,
    pending: Vec<Registration>,
    stats: EngineStats,
    load: LoadTracker,
    base: Instant,
}

/// How long a connection may sit write-subscribed with nothing queued
/// before the subscription is dropped.
const WRITE_IDLE_SECS: u64 = 1;

impl Engine {
    /// Open an engine with a fresh epoll instance.
    pub fn open() -> io::Result<Self> {
        let epfd = syscall(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epfd,
            entities: Slab::new(),
            pending: Vec::new(),
            stats: EngineStats::new(),
            load: LoadTracker::default(),
            base: Instant::now(),
        })
    }

    /// Monotonic nanoseconds since the engine opened.
    pub fn now(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    /// Callback latency histograms.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Utilization percentage over the rotating window.
    pub fn load(&self) -> f32 {
        self.load.load()
    }

    /// Registered entity count.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Register an I/O entity for edge-triggered readability.
    pub fn add(&mut self, entity: Box<dyn Entity>) -> io::Result<Token> {
        let fd = entity.fd();
        let token = self.entities.insert(Entry {
            entity,
            kind: Kind::Io,
            fd,
            flags: Events::READABLE,
            last_write_ts: 0,
        });
        if let Err(e) = epoll_add(self.epfd, fd, token, false) {
            self.entities.remove(token);
            return Err(e);
        }
        Ok(Token(token))
    }

    /// Register a timer entity backed by a timerfd.
    pub fn add_timer(
        &mut self,
        entity: Box<dyn Entity>,
        after: Duration,
        every: Option<Duration>,
    ) -> io::Result<Token> {
        let tfd = syscall(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        timerfd_arm(tfd, after, every)?;

        let token = self.entities.insert(Entry {
            entity,
            kind: Kind::Timer,
            fd: tfd,
            flags: Events::TIMEOUT,
            last_write_ts: 0,
        });
        if let Err(e) = epoll_add(self.epfd, tfd, token, false) {
            self.entities.remove(token);
            unsafe { libc::close(tfd) };
            return Err(e);
        }
        Ok(Token(token))
    }

    /// Register a user-event entity backed by an eventfd.
    pub fn add_uevent(&mut self, entity: Box<dyn Entity>) -> io::Result<Token> {
        let efd = syscall(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let token = self.entities.insert(Entry {
            entity,
            kind: Kind::User,
            fd: efd,
            flags: Events::UEVENT,
            last_write_ts: 0,
        });
        if let Err(e) = epoll_add(self.epfd, efd, token, false) {
            self.entities.remove(token);
            unsafe { libc::close(efd) };
            return Err(e);
        }
        Ok(Token(token))
    }

    /// Wakeup handle for a user-event entity, usable from other threads.
    pub fn notifier(&self, token: Token) -> io::Result<Notifier> {
        let entry = self
            .entities
            .get(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown entity"))?;
        match entry.kind {
            Kind::User => Ok(Notifier { efd: entry.fd }),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a user-event entity")),
        }
    }

    /// Mark outbound data pending and arm write interest.
    ///
    /// Mirrors what entities do from inside callbacks through
    /// [`EntityCtl::set_data_available`], for use between events.
    pub fn set_writable(&mut self, token: Token, writable: bool) -> io::Result<()> {
        let now_secs = self.now() / 1_000_000_000;
        let Some(entry) = self.entities.get_mut(token.0) else {
            return Ok(());
        };
        entry.last_write_ts = now_secs;
        entry.flags.set(Events::HAS_DATA, writable);
        if writable
            && !entry.flags.contains(Events::WRITABLE)
            && !entry.flags.contains(Events::HANGUP)
        {
            entry.flags.insert(Events::WRITABLE);
            epoll_mod(self.epfd, entry.fd, token.0, true)?;
        }
        Ok(())
    }

    /// Drop an entity, closing engine-owned descriptors.
    pub fn remove(&mut self, token: Token) {
        if !self.entities.contains(token.0) {
            return;
        }
        let mut entry = self.entities.remove(token.0);
        let _ = epoll_del(self.epfd, entry.fd);
        entry.entity.close();
        if matches!(entry.kind, Kind::Timer | Kind::User) {
            unsafe { libc::close(entry.fd) };
        }
    }

    /// Wait for events and process them; returns the number dispatched.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events: [libc::epoll_event; 256] = unsafe { std::mem::zeroed() };
        let timeout_ms = timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as i32);

        let idle_start = self.now();
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        let active_start = self.now();
        self.stats.iowait.add(active_start - idle_start);
        self.load.add_events(n, active_start - idle_start);

        for event in &events[..n] {
            let token = event.u64 as usize;
            let Some(entry) = self.entities.get(token) else {
                continue; // removed earlier in this batch
            };

            let mut fired = Events::empty();
            let bits = event.events;
            if bits & (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32 != 0 {
                fired |= Events::HANGUP;
            }
            if bits & libc::EPOLLIN as u32 != 0 {
                fired |= match entry.kind {
                    Kind::Io => Events::READABLE,
                    Kind::Timer => Events::TIMEOUT,
                    Kind::User => Events::UEVENT,
                };
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                fired |= Events::WRITABLE;
            }

            self.process(token, fired);
        }

        let done = self.now();
        self.load.add_active(done - active_start);

        self.apply_pending()?;
        Ok(n)
    }

    /// Dispatch one entity's events in the canonical order.
    fn process(&mut self, token: usize, fired: Events) {
        if fired.contains(Events::HANGUP) {
            self.drop_entity(token);
            return;
        }

        let epfd = self.epfd;
        let mut now = self.now();

        macro_rules! dispatch {
            ($method:ident, $histogram:ident, $drain:expr) => {{
                let entry = &mut self.entities[token];
                if $drain {
                    drain_counter_fd(entry.fd);
                }
                let mut ctl = EntityCtl {
                    token: Token(token),
                    flags: &mut entry.flags,
                    timer_fd: if matches!(entry.kind, Kind::Timer) { entry.fd } else { -1 },
                    pending: &mut self.pending,
                    now,
                };
                let result = entry.entity.$method(&mut ctl);
                let done = self.now();
                self.stats.$histogram.add(done - now);
                now = done;
                if result.is_err() {
                    self.drop_entity(token);
                    return;
                }
            }};
        }

        if fired.contains(Events::UEVENT) {
            dispatch!(uevent, event, true);
        }
        if fired.contains(Events::TIMEOUT) {
            dispatch!(timeout, timeout, true);
        }
        if fired.contains(Events::READABLE) {
            dispatch!(read, ioread, false);
        }

        let has_data = self.entities[token].flags.contains(Events::HAS_DATA);
        if has_data || fired.contains(Events::WRITABLE) {
            if has_data {
                dispatch!(write, iowrite, false);

                let entry = &mut self.entities[token];
                if entry.flags.contains(Events::HAS_DATA)
                    && !entry.flags.contains(Events::WRITABLE)
                {
                    // output is still queued: arm write interest
                    entry.flags.insert(Events::WRITABLE);
                    let _ = epoll_mod(epfd, entry.fd, token, true);
                }
                entry.last_write_ts = now / 1_000_000_000;
            } else {
                let entry = &mut self.entities[token];
                let now_secs = now / 1_000_000_000;
                if now_secs.saturating_sub(entry.last_write_ts) > WRITE_IDLE_SECS {
                    // a second of writable events with nothing queued
                    entry.flags.remove(Events::WRITABLE);
                    let _ = epoll_mod(epfd, entry.fd, token, false);
                    entry.last_write_ts = now_secs;
                }
            }
        }

        if self.entities[token].flags.contains(Events::HANGUP) {
            self.drop_entity(token);
        }
    }

    fn drop_entity(&mut self, token: usize) {
        tracing::trace!(token, "iopoll entity closed");
        self.remove(Token(token));
    }

    fn apply_pending(&mut self) -> io::Result<()> {
        while let Some(registration) = self.pending.pop() {
            let added = match registration {
                Registration::Io(entity) => self.add(entity).map(|_| ()),
                Registration::Timer {
                    entity,
                    after,
                    every,
                } => self.add_timer(entity, after, every).map(|_| ()),
                Registration::UserEvent(entity) => self.add_uevent(entity).map(|_| ()),
            };
            if let Err(e) = added {
                // the entity is gone; the engine itself is still healthy
                tracing::warn!(error = %e, "deferred registration failed");
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let tokens: Vec<usize> = self.entities.iter().map(|(token, _)| token).collect();
        for token in tokens {
            self.remove(Token(token));
        }
        unsafe { libc::close(self.epfd) };
    }
}

/// Cross-thread wakeup handle for a user-event entity.
#[derive(Debug, Clone, Copy)]
pub struct Notifier {
    efd: RawFd,
}

impl Notifier {
    /// Wake the entity's engine.
    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(self.efd, &one as *const u64 as *const libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // a saturated counter still wakes the poller
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

fn syscall(rc: i32) -> io::Result<RawFd> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn epoll_event(token: usize, write: bool) -> libc::epoll_event {
    let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32;
    if write {
        events |= libc::EPOLLOUT as u32;
    }
    libc::epoll_event {
        events,
        u64: token as u64,
    }
}

fn epoll_add(epfd: RawFd, fd: RawFd, token: usize, write: bool) -> io::Result<()> {
    let mut event = epoll_event(token, write);
    syscall(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
    Ok(())
}

fn epoll_mod(epfd: RawFd, fd: RawFd, token: usize, write: bool) -> io::Result<()> {
    let mut event = epoll_event(token, write);
    syscall(unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut event) })?;
    Ok(())
}

fn epoll_del(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    syscall(unsafe {
        libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    })?;
    Ok(())
}

/// Drain a timerfd/eventfd counter so edge triggering can fire again.
fn drain_counter_fd(fd: RawFd) {
    let mut count: u64 = 0;
    unsafe {
        let _ = libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8);
    }
}

fn timerfd_arm(tfd: RawFd, after: Duration, every: Option<Duration>) -> io::Result<()> {
    fn timespec(d: Duration) -> libc::timespec {
        libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        }
    }

    // a zero it_value would disarm; clamp to the nearest nanosecond
    let after = if after.is_zero() {
        Duration::from_nanos(1)
    } else {
        after
    };
    let spec = libc::itimerspec {
        it_interval: every.map(timespec).unwrap_or(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }),
        it_value: timespec(after),
    };
    syscall(unsafe { libc::timerfd_settime(tfd, 0, &spec, std::ptr::null_mut()) })?;
    Ok(())
}
