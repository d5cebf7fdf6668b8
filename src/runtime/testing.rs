//! Scripted in-memory event source for reactor tests.
//!
//! Tests drive time, data arrival and write completion by hand and inspect
//! what the reactor asked the source to do.

use crate::runtime::{Condition, ConnId, Event, EventSource, RawBuffer};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;

#[derive(Debug, Default)]
pub(crate) struct FakeConn {
    pub given: VecDeque<RawBuffer>,
    pub filled: VecDeque<RawBuffer>,
    pub writing: VecDeque<RawBuffer>,
    pub written: VecDeque<RawBuffer>,
    pub read_closed: bool,
    pub write_closed: bool,
    pub condition: Option<Condition>,
}

pub(crate) struct FakeSource {
    pub now: u64,
    pub batches: VecDeque<Vec<Event>>,
    pub timeouts: Vec<u64>,
    pub wakes: Vec<ConnId>,
    pub closes: Vec<ConnId>,
    pub accepted: Vec<ConnId>,
    pub listener_closes: usize,
    pub listener_condition: Option<Condition>,
    pub addr: Option<SocketAddr>,
    conns: HashMap<ConnId, FakeConn>,
    next_conn: usize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            now: 0,
            batches: VecDeque::new(),
            timeouts: Vec::new(),
            wakes: Vec::new(),
            closes: Vec::new(),
            accepted: Vec::new(),
            listener_closes: 0,
            listener_condition: None,
            addr: None,
            conns: HashMap::new(),
            next_conn: 0,
        }
    }

    pub fn conn(&self, conn: ConnId) -> &FakeConn {
        &self.conns[&conn]
    }

    pub fn conn_mut(&mut self, conn: ConnId) -> &mut FakeConn {
        self.conns.get_mut(&conn).expect("unknown connection")
    }

    /// Copy `data` into the next given read buffer and mark it filled.
    ///
    /// Returns false if the connection holds no read buffer.
    pub fn deliver(&mut self, conn: ConnId, data: &[u8]) -> bool {
        let fake = self.conn_mut(conn);
        let Some(mut buf) = fake.given.pop_front() else {
            return false;
        };
        let n = data.len().min(buf.spare_mut().len());
        buf.spare_mut()[..n].copy_from_slice(&data[..n]);
        buf.advance_filled(n);
        fake.filled.push_back(buf);
        true
    }

    /// Flush every queued write; returns the bytes "sent" to the peer.
    pub fn complete_writes(&mut self, conn: ConnId) -> Vec<u8> {
        let fake = self.conn_mut(conn);
        let mut sent = Vec::new();
        while let Some(mut buf) = fake.writing.pop_front() {
            sent.extend_from_slice(buf.payload());
            let n = buf.size();
            buf.consume(n);
            fake.written.push_back(buf);
        }
        sent
    }

    /// Peer end-of-stream: unfilled read buffers come back empty.
    pub fn hang_up(&mut self, conn: ConnId) {
        let fake = self.conn_mut(conn);
        fake.read_closed = true;
        let returned: Vec<_> = fake.given.drain(..).collect();
        fake.filled.extend(returned);
    }
}

impl EventSource for FakeSource {
    fn wait(&mut self, batch: &mut Vec<Event>) -> io::Result<()> {
        match self.batches.pop_front() {
            Some(events) => batch.extend(events),
            None => batch.push(Event::Inactive),
        }
        Ok(())
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn set_timeout(&mut self, millis: u64) {
        self.timeouts.push(millis);
    }

    fn listener_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn listener_condition(&self) -> Option<&Condition> {
        self.listener_condition.as_ref()
    }

    fn close_listener(&mut self) {
        self.listener_closes += 1;
    }

    fn accept(&mut self) -> io::Result<ConnId> {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        self.conns.insert(conn, FakeConn::default());
        self.accepted.push(conn);
        Ok(conn)
    }

    fn close(&mut self, conn: ConnId) {
        self.closes.push(conn);
        if let Some(fake) = self.conns.get_mut(&conn) {
            fake.read_closed = true;
            fake.write_closed = true;
            let given: Vec<_> = fake.given.drain(..).collect();
            fake.filled.extend(given);
            let writing: Vec<_> = fake.writing.drain(..).collect();
            fake.written.extend(writing);
        }
    }

    fn wake(&mut self, conn: ConnId) {
        self.wakes.push(conn);
    }

    fn condition(&self, conn: ConnId) -> Option<&Condition> {
        self.conns.get(&conn).and_then(|c| c.condition.as_ref())
    }

    fn is_read_closed(&self, conn: ConnId) -> bool {
        self.conns.get(&conn).map_or(true, |c| c.read_closed)
    }

    fn is_write_closed(&self, conn: ConnId) -> bool {
        self.conns.get(&conn).map_or(true, |c| c.write_closed)
    }

    fn give_read_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>) {
        let fake = self.conn_mut(conn);
        if fake.read_closed {
            fake.filled.extend(buffers);
        } else {
            fake.given.extend(buffers);
        }
    }

    fn take_read_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer> {
        let fake = self.conn_mut(conn);
        let n = max.min(fake.filled.len());
        fake.filled.drain(..n).collect()
    }

    fn write_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>) {
        let fake = self.conn_mut(conn);
        if fake.write_closed {
            fake.written.extend(buffers);
        } else {
            fake.writing.extend(buffers);
        }
    }

    fn take_written_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer> {
        let fake = self.conn_mut(conn);
        let n = max.min(fake.written.len());
        fake.written.drain(..n).collect()
    }
}
