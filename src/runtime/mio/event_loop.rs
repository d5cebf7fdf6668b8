//! mio proactor implementation.
//!
//! Readiness-based model turned into completion events: poll tells us when
//! sockets are ready, we perform the non-blocking read/write syscalls into
//! and out of the buffers the application handed over, and report the
//! outcome as [`Event`]s.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept -> Connected -> (Read | Written | NeedReadBuffers)*
//!        -> ClosedRead | ClosedWrite | close()
//!        -> Read/Written (buffers returned) -> Disconnected -> reaped
//! ```
//!
//! A connection is removed from the slab at the start of the wait cycle
//! after its `Disconnected` event was delivered, so its id stays valid while
//! the application handles the terminal event.

use crate::runtime::token::LISTENER_TOKEN;
use crate::runtime::{Condition, ConnId, Event, EventSource, RawBuffer};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EVENTS_CAPACITY: usize = 1024;

/// Ceiling for timer deadlines; larger requests saturate here.
const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One raw connection and the buffers it currently owns.
struct RawConnection {
    stream: TcpStream,
    /// Read capacity given by the application, not yet filled.
    given: VecDeque<RawBuffer>,
    /// Filled (or returned) read buffers awaiting `take_read_buffers`.
    filled: VecDeque<RawBuffer>,
    /// Buffers queued for writing, front first.
    writing: VecDeque<RawBuffer>,
    /// Written (or abandoned) buffers awaiting `take_written_buffers`.
    written: VecDeque<RawBuffer>,
    readable: bool,
    writable: bool,
    read_closed: bool,
    write_closed: bool,
    closing: bool,
    condition: Option<Condition>,
    // Edge flags so each condition is reported once until the application reacts.
    need_buffers: bool,
    need_buffers_signalled: bool,
    read_signalled: bool,
    written_signalled: bool,
    closed_read_pending: bool,
    closed_write_pending: bool,
    disconnected: bool,
}

impl RawConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            given: VecDeque::new(),
            filled: VecDeque::new(),
            writing: VecDeque::new(),
            written: VecDeque::new(),
            readable: false,
            writable: false,
            read_closed: false,
            write_closed: false,
            closing: false,
            condition: None,
            need_buffers: false,
            need_buffers_signalled: false,
            read_signalled: false,
            written_signalled: false,
            closed_read_pending: false,
            closed_write_pending: false,
            disconnected: false,
        }
    }

    /// Read into given buffers until the socket would block or buffers run out.
    fn pump_reads(&mut self) {
        while self.readable && !self.read_closed {
            let Some(mut buf) = self.given.pop_front() else {
                if !self.need_buffers_signalled {
                    self.need_buffers_signalled = true;
                    self.need_buffers = true;
                }
                return;
            };

            // A full buffer would read as EOF; hand it back untouched.
            if buf.spare_mut().is_empty() {
                self.filled.push_back(buf);
                continue;
            }

            match self.stream.read(buf.spare_mut()) {
                Ok(0) => {
                    self.given.push_front(buf);
                    self.close_read();
                }
                Ok(n) => {
                    buf.advance_filled(n);
                    self.filled.push_back(buf);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.given.push_front(buf);
                    self.readable = false;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.given.push_front(buf);
                }
                Err(e) => {
                    self.given.push_front(buf);
                    self.condition.get_or_insert_with(|| Condition::from_io(&e));
                    self.close_read();
                }
            }
        }
    }

    /// Write queued buffers until the socket would block or the queue empties.
    fn pump_writes(&mut self) {
        while self.writable && !self.write_closed {
            let Some(buf) = self.writing.front_mut() else {
                return;
            };

            if buf.is_empty() {
                if let Some(buf) = self.writing.pop_front() {
                    self.written.push_back(buf);
                }
                continue;
            }

            match self.stream.write(buf.payload()) {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "write returned 0");
                    self.condition.get_or_insert_with(|| Condition::from_io(&e));
                    self.close_write();
                }
                Ok(n) => {
                    buf.consume(n);
                    if buf.is_empty() {
                        if let Some(buf) = self.writing.pop_front() {
                            self.written.push_back(buf);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.condition.get_or_insert_with(|| Condition::from_io(&e));
                    self.close_write();
                }
            }
        }
    }

    /// No more reads: unfilled buffers go back empty.
    fn close_read(&mut self) {
        if self.read_closed {
            return;
        }
        self.read_closed = true;
        self.closed_read_pending = true;
        self.return_given();
    }

    /// No more writes: queued buffers go back with whatever was left unsent.
    fn close_write(&mut self) {
        if self.write_closed {
            return;
        }
        self.write_closed = true;
        self.closed_write_pending = true;
        self.return_writing();
    }

    fn return_given(&mut self) {
        self.filled.extend(self.given.drain(..));
        self.read_signalled = false;
    }

    fn return_writing(&mut self) {
        self.written.extend(self.writing.drain(..));
        self.written_signalled = false;
    }

    /// Push the events this connection owes the application, in order.
    fn emit(&mut self, id: ConnId, pending: &mut VecDeque<Event>) {
        if std::mem::take(&mut self.need_buffers) {
            pending.push_back(Event::NeedReadBuffers(id));
        }
        if !self.filled.is_empty() && !self.read_signalled {
            self.read_signalled = true;
            pending.push_back(Event::Read(id));
        }
        if !self.written.is_empty() && !self.written_signalled {
            self.written_signalled = true;
            pending.push_back(Event::Written(id));
        }
        if std::mem::take(&mut self.closed_read_pending) {
            pending.push_back(Event::ClosedRead(id));
        }
        if std::mem::take(&mut self.closed_write_pending) {
            pending.push_back(Event::ClosedWrite(id));
        }
        if self.closing && !self.disconnected {
            self.disconnected = true;
            pending.push_back(Event::Disconnected(id));
        }
    }
}

/// Event source over a mio `Poll`, one listener and a slab of connections.
pub struct Proactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    listener_addr: Option<SocketAddr>,
    listener_ready: bool,
    listener_closing: bool,
    listener_condition: Option<Condition>,
    /// Streams accepted from the OS, each announced by one `ListenerAccept`.
    backlog: VecDeque<TcpStream>,
    connections: Slab<RawConnection>,
    pending: VecDeque<Event>,
    reap: Vec<usize>,
    deadline: Option<Instant>,
    epoch: Instant,
}

impl Proactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: None,
            listener_addr: None,
            listener_ready: false,
            listener_closing: false,
            listener_condition: None,
            backlog: VecDeque::new(),
            connections: Slab::new(),
            pending: VecDeque::new(),
            reap: Vec::new(),
            deadline: None,
            epoch: Instant::now(),
        })
    }

    /// Bind and listen on `addr`; queues `ListenerOpen`.
    pub fn listen(&mut self, addr: SocketAddr, backlog: i32) -> io::Result<()> {
        let listener = create_listener(addr, backlog)?;
        let mut listener = TcpListener::from_std(listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        self.listener_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        self.listener_ready = true;
        self.pending.push_back(Event::ListenerOpen);
        Ok(())
    }

    fn drive_listener(&mut self) {
        if let Some(listener) = self.listener.as_ref() {
            while self.listener_ready && !self.listener_closing {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Connection pending accept");
                        self.backlog.push_back(stream);
                        self.pending.push_back(Event::ListenerAccept);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.listener_ready = false;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(error = %e, "Listener accept error");
                        self.listener_condition = Some(Condition::from_io(&e));
                        self.listener_closing = true;
                    }
                }
            }
        }

        if self.listener_closing {
            self.listener_closing = false;
            if let Some(mut listener) = self.listener.take() {
                if let Err(e) = self.poll.registry().deregister(&mut listener) {
                    debug!(error = %e, "Listener deregister failed");
                }
            }
            self.listener_addr = None;
            self.listener_ready = false;
            // Connections never accepted by the application are dropped (reset).
            self.backlog.clear();
            self.pending.push_back(Event::ListenerClose);
        }
    }

    fn drive_connections(&mut self) {
        for (key, conn) in self.connections.iter_mut() {
            if conn.disconnected {
                continue;
            }
            if !conn.closing {
                conn.pump_reads();
                conn.pump_writes();
            }
            conn.emit(ConnId(key), &mut self.pending);
            if conn.disconnected {
                self.reap.push(key);
            }
        }
    }

    fn fire_timer(&mut self) {
        if let Some(deadline) = self.deadline {
            if deadline <= Instant::now() {
                self.deadline = None;
                self.pending.push_back(Event::Timeout);
            }
        }
    }

    fn is_inactive(&self) -> bool {
        self.listener.is_none()
            && self.backlog.is_empty()
            && self.connections.is_empty()
            && self.deadline.is_none()
    }

    /// Record readiness; the I/O itself happens in the drive pass.
    fn absorb_readiness(&mut self) {
        for event in self.events.iter() {
            match ConnId::from_token(event.token()) {
                None => self.listener_ready = true,
                Some(id) => {
                    if let Some(conn) = self.connections.get_mut(id.0) {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            conn.readable = true;
                        }
                        if event.is_writable() || event.is_write_closed() || event.is_error() {
                            conn.writable = true;
                        }
                    }
                }
            }
        }
    }

    fn reap(&mut self) {
        for key in self.reap.drain(..) {
            if self.connections.try_remove(key).is_some() {
                debug!(conn = key, "Connection reaped");
            }
        }
    }
}

impl EventSource for Proactor {
    fn wait(&mut self, batch: &mut Vec<Event>) -> io::Result<()> {
        self.reap();

        loop {
            self.drive_listener();
            self.drive_connections();
            self.fire_timer();

            if self.pending.is_empty() && self.is_inactive() {
                self.pending.push_back(Event::Inactive);
            }
            if !self.pending.is_empty() {
                batch.extend(self.pending.drain(..));
                return Ok(());
            }

            let timeout = self
                .deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.absorb_readiness();
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn set_timeout(&mut self, millis: u64) {
        let timeout = Duration::from_millis(millis).min(MAX_TIMEOUT);
        self.deadline = Some(Instant::now() + timeout);
    }

    fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    fn listener_condition(&self) -> Option<&Condition> {
        self.listener_condition.as_ref()
    }

    fn close_listener(&mut self) {
        if self.listener.is_some() {
            self.listener_closing = true;
        }
    }

    fn accept(&mut self) -> io::Result<ConnId> {
        let mut stream = self
            .backlog
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no pending connection"))?;

        let entry = self.connections.vacant_entry();
        let id = ConnId(entry.key());
        self.poll.registry().register(
            &mut stream,
            id.token(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(RawConnection::new(stream));
        self.pending.push_back(Event::Connected(id));
        Ok(id)
    }

    fn close(&mut self, conn: ConnId) {
        let Some(c) = self.connections.get_mut(conn.0) else {
            return;
        };
        if c.closing {
            return;
        }

        // Last chance for queued echo data before the socket goes away.
        c.pump_writes();
        c.closing = true;
        c.read_closed = true;
        c.write_closed = true;
        if let Err(e) = c.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, %conn, "Shutdown failed");
        }
        if let Err(e) = self.poll.registry().deregister(&mut c.stream) {
            debug!(error = %e, %conn, "Deregister failed");
        }
        c.return_given();
        c.return_writing();
    }

    fn wake(&mut self, conn: ConnId) {
        if self.connections.get(conn.0).is_some_and(|c| !c.closing) {
            self.pending.push_back(Event::Wake(conn));
        }
    }

    fn condition(&self, conn: ConnId) -> Option<&Condition> {
        self.connections
            .get(conn.0)
            .and_then(|c| c.condition.as_ref())
    }

    fn is_read_closed(&self, conn: ConnId) -> bool {
        self.connections.get(conn.0).map_or(true, |c| c.read_closed)
    }

    fn is_write_closed(&self, conn: ConnId) -> bool {
        self.connections.get(conn.0).map_or(true, |c| c.write_closed)
    }

    fn give_read_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>) {
        let Some(c) = self.connections.get_mut(conn.0) else {
            debug!(%conn, count = buffers.len(), "Read buffers for unknown connection dropped");
            return;
        };
        if c.read_closed {
            c.filled.extend(buffers);
            c.read_signalled = false;
        } else {
            c.given.extend(buffers);
            c.need_buffers_signalled = false;
        }
    }

    fn take_read_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer> {
        let Some(c) = self.connections.get_mut(conn.0) else {
            return Vec::new();
        };
        let n = max.min(c.filled.len());
        let taken = c.filled.drain(..n).collect();
        if c.filled.is_empty() {
            c.read_signalled = false;
        }
        taken
    }

    fn write_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>) {
        let Some(c) = self.connections.get_mut(conn.0) else {
            debug!(%conn, count = buffers.len(), "Write buffers for unknown connection dropped");
            return;
        };
        if c.write_closed {
            c.written.extend(buffers);
            c.written_signalled = false;
        } else {
            c.writing.extend(buffers);
        }
    }

    fn take_written_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer> {
        let Some(c) = self.connections.get_mut(conn.0) else {
            return Vec::new();
        };
        let n = max.min(c.written.len());
        let taken = c.written.drain(..n).collect();
        if c.written.is_empty() {
            c.written_signalled = false;
        }
        taken
    }
}

/// Create a non-blocking TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExitStatus, Reactor, ReactorConfig};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    /// Output sink shared with the test thread.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Outcome {
        status: ExitStatus,
        connects: u64,
        disconnects: u64,
        rejected: u64,
    }

    fn spawn_reactor(
        config: ReactorConfig,
        sink: SharedSink,
    ) -> (SocketAddr, thread::JoinHandle<io::Result<Outcome>>) {
        let (addr_tx, addr_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut proactor = Proactor::new()?;
            proactor.listen("127.0.0.1:0".parse().unwrap(), 16)?;
            addr_tx.send(proactor.listener_addr().unwrap()).unwrap();

            let mut reactor = Reactor::new(proactor, sink, config);
            let status = reactor.run()?;
            Ok(Outcome {
                status,
                connects: reactor.connects(),
                disconnects: reactor.disconnects(),
                rejected: reactor.rejected(),
            })
        });
        (addr_rx.recv().unwrap(), handle)
    }

    fn fast_timers() -> ReactorConfig {
        ReactorConfig {
            busy_timeout_ms: 20,
            idle_timeout_ms: 500,
            keepalive_interval_ms: 20,
            ..ReactorConfig::default()
        }
    }

    #[test]
    fn test_shuts_down_after_idle_window() {
        let sink = SharedSink::default();
        let started = Instant::now();
        let (_addr, handle) = spawn_reactor(fast_timers(), sink.clone());

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.status, ExitStatus::Success);
        assert_eq!(outcome.connects, 0);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let mut proactor = Proactor::new().unwrap();
        proactor.set_timeout(u64::MAX);
        let deadline = proactor.deadline.unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_closed_listener_accepts_nothing() {
        let mut proactor = Proactor::new().unwrap();
        proactor.listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = proactor.listener_addr().unwrap();

        let mut batch = Vec::new();
        proactor.wait(&mut batch).unwrap();
        assert_eq!(batch, vec![Event::ListenerOpen]);

        // Pulled from the OS but never accepted by the application
        let mut pending = StdTcpStream::connect(addr).unwrap();
        batch.clear();
        proactor.wait(&mut batch).unwrap();
        assert_eq!(batch, vec![Event::ListenerAccept]);

        proactor.close_listener();
        batch.clear();
        proactor.wait(&mut batch).unwrap();
        assert_eq!(batch, vec![Event::ListenerClose]);
        assert!(proactor.listener_addr().is_none());
        assert!(proactor.listener_condition().is_none());

        // The dropped stream is closed on the peer, new connects are refused
        pending
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut scratch = [0u8; 16];
        match pending.read(&mut scratch) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
        }
        assert!(StdTcpStream::connect(addr).is_err());

        // Nothing else comes out: the reactor sees only the end of the source
        let mut reactor = Reactor::new(proactor, SharedSink::default(), fast_timers());
        assert_eq!(reactor.run().unwrap(), ExitStatus::Success);
        assert_eq!(reactor.connects(), 0);
        assert_eq!(reactor.disconnects(), 0);
        assert_eq!(reactor.slots().occupied_count(), 0);
    }

    #[test]
    fn test_echoes_rejects_overflow_and_exits_cleanly() {
        let sink = SharedSink::default();
        let (addr, handle) = spawn_reactor(fast_timers(), sink.clone());

        let mut clients: Vec<StdTcpStream> = (0..5)
            .map(|_| StdTcpStream::connect(addr).unwrap())
            .collect();
        let mut overflow = StdTcpStream::connect(addr).unwrap();

        // The sixth connection is accepted and closed straight away
        overflow
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut scratch = [0u8; 16];
        match overflow.read(&mut scratch) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let payload = format!("client-{i}-x");
            assert_eq!(payload.len(), 10);
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            client.write_all(payload.as_bytes()).unwrap();

            let mut echoed = [0u8; 10];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, payload.as_bytes());
        }
        drop(clients);

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.status, ExitStatus::Success);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.connects, 6);
        assert_eq!(outcome.connects, outcome.disconnects);

        let received = sink.0.lock().unwrap();
        assert_eq!(received.len(), 50);
        for i in 0..5 {
            let payload = format!("client-{i}-x");
            assert!(received.windows(10).any(|w| w == payload.as_bytes()));
        }
    }
}
