//! The raw-connection echo reactor.
//!
//! A single-threaded loop: block on the event source for a batch, then handle
//! every event of the batch in order. Each [`Event`] variant has its own
//! handler. All state (slot table, buffer pool, counters, idle tracking) is
//! owned here, so no locking is needed.
//!
//! ## Buffer flow
//!
//! ```text
//! pool -> give (read) -> filled -> sink -> echo (write) -> written -> give (read)
//!                                     \-> recycle (read)        \-> free
//!                                      \-> free
//! ```
//!
//! ## Timer
//!
//! A single timer drives two cadences: `busy_timeout_ms` while connections
//! exist (keep-alive wakes every `keepalive_interval_ms`), `idle_timeout_ms`
//! while none do. After a full idle window the listener is closed, the source
//! drains, and `Inactive` ends the loop.

use crate::runtime::{
    disposition, BufferPool, BufferState, Completion, ConnId, Event, EventSource, PoolFull,
    RawBuffer, Sides, SlotTable,
};
use std::io::{self, Write};
use tracing::{debug, error, info, trace, warn};

/// Tunables for one reactor instance.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Slot table size.
    pub max_connections: usize,
    /// Read buffers given on connect and per refill.
    pub read_buffers: usize,
    /// Capacity of each buffer in bytes.
    pub buffer_size: usize,
    /// Cap on buffers loaned to one connection at a time.
    pub max_buffers_per_connection: usize,
    /// Timer period while connections are active.
    pub busy_timeout_ms: u64,
    /// Timer period while idle, and the idle window before shutdown.
    pub idle_timeout_ms: u64,
    /// Minimum spacing of keep-alive wakes.
    pub keepalive_interval_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            read_buffers: 4,
            buffer_size: 1024,
            max_buffers_per_connection: 16,
            busy_timeout_ms: 5000,
            idle_timeout_ms: 20000,
            keepalive_interval_ms: 5000,
        }
    }
}

/// Overall outcome reported as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

/// Whether the loop keeps going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Reactor<S, W> {
    source: S,
    sink: W,
    config: ReactorConfig,
    slots: SlotTable,
    buffers: BufferPool,
    listening: bool,
    connects: u64,
    disconnects: u64,
    rejected: u64,
    first_idle_time: Option<u64>,
    wake_conn_time: u64,
    exit_status: ExitStatus,
}

impl<S: EventSource, W: Write> Reactor<S, W> {
    /// Create a reactor that reads events from `source` and writes received
    /// payload bytes to `sink`.
    pub fn new(source: S, sink: W, config: ReactorConfig) -> Self {
        let max_free = config.max_connections * config.max_buffers_per_connection;
        Self {
            source,
            sink,
            slots: SlotTable::new(config.max_connections),
            buffers: BufferPool::new(max_free),
            config,
            listening: false,
            connects: 0,
            disconnects: 0,
            rejected: 0,
            first_idle_time: None,
            wake_conn_time: 0,
            exit_status: ExitStatus::Success,
        }
    }

    /// Run until the source reports `Inactive` or a fatal condition is seen.
    pub fn run(&mut self) -> io::Result<ExitStatus> {
        let mut batch = Vec::new();
        loop {
            self.source.wait(&mut batch)?;
            for event in batch.drain(..) {
                if self.dispatch(event) == Flow::Exit {
                    return Ok(self.exit_status);
                }
            }
        }
    }

    /// Handle one event.
    pub fn dispatch(&mut self, event: Event) -> Flow {
        trace!(event = event.name(), conn = ?event.connection(), "Dispatching event");

        match event {
            Event::ListenerOpen => self.on_listener_open(),
            Event::ListenerAccept => self.on_listener_accept(),
            Event::ListenerClose => self.on_listener_close(),
            Event::Timeout => self.on_timeout(),
            Event::Inactive => return Flow::Exit,
            Event::Connected(conn) => self.on_connected(conn),
            Event::Wake(conn) => self.on_wake(conn),
            Event::Disconnected(conn) => self.on_disconnected(conn),
            Event::NeedReadBuffers(conn) => self.on_need_read_buffers(conn),
            Event::Read(conn) => self.on_read(conn),
            Event::Written(conn) => self.on_written(conn),
            Event::ClosedRead(conn) | Event::ClosedWrite(conn) => self.on_closed(conn),
        }

        match self.exit_status {
            ExitStatus::Success => Flow::Continue,
            ExitStatus::Failure => Flow::Exit,
        }
    }

    fn on_listener_open(&mut self) {
        self.listening = true;
        match self.source.listener_addr() {
            Some(addr) => info!(addr = %addr, port = addr.port(), "Listening"),
            None => info!("Listening"),
        }
        self.source.set_timeout(self.config.busy_timeout_ms);
    }

    fn on_listener_accept(&mut self) {
        let conn = match self.source.accept() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                return;
            }
        };

        match self.slots.allocate(conn) {
            Ok(slot) => {
                self.connects += 1;
                self.first_idle_time = None;

                let now = self.source.now();
                if self.wake_conn_time < now {
                    self.wake_conn_time = now.saturating_add(self.config.keepalive_interval_ms);
                    self.source.set_timeout(self.config.busy_timeout_ms);
                }
                debug!(slot, %conn, "Accepted raw connection");
            }
            Err(PoolFull) => {
                self.rejected += 1;
                info!(
                    %conn,
                    rejected = self.rejected,
                    max_connections = self.slots.capacity(),
                    "Too many connections, closing"
                );
                self.source.close(conn);
            }
        }
    }

    fn on_listener_close(&mut self) {
        self.listening = false;

        if let Some(cond) = self.source.listener_condition() {
            error!(
                event = Event::ListenerClose.name(),
                condition = %cond.name,
                description = %cond.description,
                "Listener failed"
            );
            self.exit_status = ExitStatus::Failure;
            self.close_all();
        } else {
            info!("Listener closed");
        }
    }

    fn on_timeout(&mut self) {
        let now = self.source.now();

        let timeout = if self.slots.occupied_count() == 0 {
            let window = self.config.idle_timeout_ms;
            match self.first_idle_time {
                None => {
                    info!(shutdown_in_ms = window, "Idle detected");
                    self.first_idle_time = Some(now);
                }
                Some(since) if now.saturating_sub(since) >= window => {
                    if self.listening {
                        info!(idle_ms = now - since, "Idle window elapsed, closing listener");
                        self.listening = false;
                        self.source.close_listener();
                    }
                    return;
                }
                Some(_) => {}
            }
            window
        } else {
            if now >= self.wake_conn_time {
                for (_, slot) in self.slots.occupied() {
                    if let Some(conn) = slot.connection() {
                        self.source.wake(conn);
                    }
                }
                self.wake_conn_time = now.saturating_add(self.config.keepalive_interval_ms);
            }
            self.config.busy_timeout_ms
        };

        self.source.set_timeout(timeout);
    }

    fn on_connected(&mut self, conn: ConnId) {
        let Some(slot) = self.slots.slot_of(conn) else {
            debug!(%conn, "Raw connection connected without a slot");
            return;
        };

        info!(slot, "Raw connection connected");
        let count = self.config.read_buffers;
        self.give_new_buffers(conn, slot, count);
    }

    fn on_wake(&mut self, conn: ConnId) {
        match self.slots.slot_of(conn) {
            Some(slot) => info!(slot, "Raw connection woken"),
            None => debug!(%conn, "Wake for unknown connection"),
        }
    }

    fn on_disconnected(&mut self, conn: ConnId) {
        if let Some(cond) = self.source.condition(conn) {
            warn!(
                event = Event::Disconnected(conn).name(),
                condition = %cond.name,
                description = %cond.description,
                "Connection condition"
            );
        }

        match self.slots.release_conn(conn) {
            Some((slot, stats)) => {
                info!(
                    slot,
                    bytes = stats.bytes,
                    buffers = stats.buffers,
                    last_recv_ms = stats.last_recv_time,
                    pool_outstanding = self.buffers.outstanding(),
                    pool_free = self.buffers.available(),
                    "Raw connection disconnected"
                );
            }
            None => {
                // Rejected connections never held a slot; count their whole
                // lifetime here so connects - disconnects tracks occupancy.
                self.connects += 1;
                debug!(%conn, "Rejected raw connection disconnected");
            }
        }
        self.disconnects += 1;
        debug_assert!(self.connects >= self.disconnects);
        debug_assert_eq!(
            self.connects - self.disconnects,
            self.slots.occupied_count() as u64
        );
    }

    fn on_need_read_buffers(&mut self, conn: ConnId) {
        if self.source.is_read_closed(conn) {
            return;
        }
        let Some(slot) = self.slots.slot_of(conn) else {
            return;
        };
        let Some(outstanding) = self.slots.get(slot).map(|s| s.outstanding) else {
            return;
        };

        let room = self
            .config
            .max_buffers_per_connection
            .saturating_sub(outstanding);
        let count = room.min(self.config.read_buffers);
        if count == 0 {
            debug!(slot, outstanding, "Buffer cap reached, reads stall until writes drain");
            return;
        }
        self.give_new_buffers(conn, slot, count);
    }

    fn on_read(&mut self, conn: ConnId) {
        let slot = self.slots.slot_of(conn);
        let now = self.source.now();
        if let Some(entry) = slot.and_then(|idx| self.slots.get_mut(idx)) {
            entry.stats.last_recv_time = now;
        }

        loop {
            let taken = self.source.take_read_buffers(conn, self.config.read_buffers);
            if taken.is_empty() {
                break;
            }
            let sides = self.sides(conn);

            let mut echo = Vec::with_capacity(taken.len());
            let mut refill = Vec::new();
            for buf in taken {
                if !buf.is_empty() {
                    if let Some(entry) = slot.and_then(|idx| self.slots.get_mut(idx)) {
                        entry.stats.bytes += buf.size() as u64;
                        entry.stats.buffers += 1;
                    }
                    if let Err(e) = self.sink.write_all(buf.payload()) {
                        warn!(error = %e, %conn, "Output sink write failed");
                    }
                }
                let state = disposition(Completion::Read, !buf.is_empty(), sides);
                self.route(slot, buf, state, &mut echo, &mut refill);
            }

            if !echo.is_empty() {
                self.source.write_buffers(conn, echo);
            }
            if !refill.is_empty() {
                self.source.give_read_buffers(conn, refill);
            }
        }

        if let Err(e) = self.sink.flush() {
            warn!(error = %e, "Output sink flush failed");
        }
    }

    fn on_written(&mut self, conn: ConnId) {
        let slot = self.slots.slot_of(conn);

        loop {
            let taken = self
                .source
                .take_written_buffers(conn, self.config.read_buffers);
            if taken.is_empty() {
                break;
            }
            let sides = self.sides(conn);

            let mut echo = Vec::new();
            let mut refill = Vec::with_capacity(taken.len());
            for buf in taken {
                let state = disposition(Completion::Written, !buf.is_empty(), sides);
                self.route(slot, buf, state, &mut echo, &mut refill);
            }

            if !echo.is_empty() {
                self.source.write_buffers(conn, echo);
            }
            if !refill.is_empty() {
                self.source.give_read_buffers(conn, refill);
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        self.source.close(conn);
    }

    fn sides(&self, conn: ConnId) -> Sides {
        Sides {
            read_open: !self.source.is_read_closed(conn),
            write_open: !self.source.is_write_closed(conn),
        }
    }

    /// Move a returned buffer to its next owner.
    fn route(
        &mut self,
        slot: Option<usize>,
        mut buf: RawBuffer,
        state: BufferState,
        echo: &mut Vec<RawBuffer>,
        refill: &mut Vec<RawBuffer>,
    ) {
        match state {
            BufferState::PendingWrite => echo.push(buf),
            BufferState::PendingRead => {
                buf.clear();
                refill.push(buf);
            }
            BufferState::Free => {
                if let Some(entry) = slot.and_then(|idx| self.slots.get_mut(idx)) {
                    entry.outstanding = entry.outstanding.saturating_sub(1);
                }
                self.buffers.release(buf);
            }
        }
    }

    fn give_new_buffers(&mut self, conn: ConnId, slot: usize, count: usize) {
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        entry.outstanding += count;
        let bufs = self.buffers.acquire_many(count, self.config.buffer_size);
        self.source.give_read_buffers(conn, bufs);
    }

    /// Close the listener and every connection after a fatal condition.
    fn close_all(&mut self) {
        if self.listening {
            self.listening = false;
            self.source.close_listener();
        }
        for (_, slot) in self.slots.occupied() {
            if let Some(conn) = slot.connection() {
                self.source.close(conn);
            }
        }
    }
}

#[cfg(test)]
impl<S: EventSource, W: Write> Reactor<S, W> {
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn first_idle_time(&self) -> Option<u64> {
        self.first_idle_time
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }
}
