//! The event source contract consumed by the reactor.
//!
//! An event source owns the network side: the listener, the sockets, the
//! buffers currently given to connections, and the single global timer. The
//! reactor only ever sees typed [`Event`]s and moves [`RawBuffer`]s in and out.

use crate::runtime::{Condition, ConnId, Event, RawBuffer};
use std::io;
use std::net::SocketAddr;

pub trait EventSource {
    /// Block until at least one event is available and append the batch.
    fn wait(&mut self, batch: &mut Vec<Event>) -> io::Result<()>;

    /// Milliseconds on the source's monotonic clock.
    fn now(&self) -> u64;

    /// Arm the global timer; replaces any previous deadline.
    fn set_timeout(&mut self, millis: u64);

    /// Local address of the listener while it is open.
    fn listener_addr(&self) -> Option<SocketAddr>;

    /// Fault recorded on the listener, if any.
    fn listener_condition(&self) -> Option<&Condition>;

    /// Request listener shutdown; `ListenerClose` follows.
    fn close_listener(&mut self);

    /// Complete acceptance of the pending connection announced by `ListenerAccept`.
    fn accept(&mut self) -> io::Result<ConnId>;

    /// Request connection shutdown; buffers come back, then `Disconnected`.
    fn close(&mut self, conn: ConnId);

    /// Queue a `Wake` event for the connection.
    fn wake(&mut self, conn: ConnId);

    /// Fault recorded on the connection, if any.
    fn condition(&self, conn: ConnId) -> Option<&Condition>;

    /// True once no more data will be read; also true for unknown connections.
    fn is_read_closed(&self, conn: ConnId) -> bool;

    /// True once no more data will be written; also true for unknown connections.
    fn is_write_closed(&self, conn: ConnId) -> bool;

    fn give_read_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>);

    /// Take up to `max` filled read buffers, in fill order.
    fn take_read_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer>;

    /// Queue buffers for writing; each buffer's payload is written in order.
    fn write_buffers(&mut self, conn: ConnId, buffers: Vec<RawBuffer>);

    /// Take up to `max` buffers whose payload has been written (or abandoned).
    fn take_written_buffers(&mut self, conn: ConnId, max: usize) -> Vec<RawBuffer>;
}
