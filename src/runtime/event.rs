//! Events delivered by an event source, and the fault conditions attached to
//! connections and listeners.

use crate::runtime::ConnId;
use std::io;

/// One typed event from a wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An accepted connection is ready for buffer exchange.
    Connected(ConnId),
    /// Out-of-band wake requested through `EventSource::wake`.
    Wake(ConnId),
    /// Terminal event; every buffer has been returned before it.
    Disconnected(ConnId),
    /// The connection wants to read but holds no read buffers.
    NeedReadBuffers(ConnId),
    /// Filled read buffers are ready to be taken.
    Read(ConnId),
    /// Written buffers are ready to be taken.
    Written(ConnId),
    ClosedRead(ConnId),
    ClosedWrite(ConnId),
    ListenerOpen,
    /// A connection is pending on the listener; call `EventSource::accept`.
    ListenerAccept,
    ListenerClose,
    /// The timer armed with `EventSource::set_timeout` expired.
    Timeout,
    /// No listener, no connections and no timer remain.
    Inactive,
}

impl Event {
    /// Stable name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected(_) => "connection_connected",
            Event::Wake(_) => "connection_wake",
            Event::Disconnected(_) => "connection_disconnected",
            Event::NeedReadBuffers(_) => "connection_need_read_buffers",
            Event::Read(_) => "connection_read",
            Event::Written(_) => "connection_written",
            Event::ClosedRead(_) => "connection_closed_read",
            Event::ClosedWrite(_) => "connection_closed_write",
            Event::ListenerOpen => "listener_open",
            Event::ListenerAccept => "listener_accept",
            Event::ListenerClose => "listener_close",
            Event::Timeout => "proactor_timeout",
            Event::Inactive => "proactor_inactive",
        }
    }

    /// The connection this event concerns, if any.
    pub fn connection(&self) -> Option<ConnId> {
        match *self {
            Event::Connected(c)
            | Event::Wake(c)
            | Event::Disconnected(c)
            | Event::NeedReadBuffers(c)
            | Event::Read(c)
            | Event::Written(c)
            | Event::ClosedRead(c)
            | Event::ClosedWrite(c) => Some(c),
            _ => None,
        }
    }
}

/// A fault recorded on a connection or listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub name: String,
    pub description: String,
}

impl Condition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Condition describing an I/O failure.
    pub fn from_io(err: &io::Error) -> Self {
        Self::new(format!("io:{:?}", err.kind()), err.to_string())
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_connection() {
        assert_eq!(Event::Read(ConnId(3)).connection(), Some(ConnId(3)));
        assert_eq!(Event::ClosedWrite(ConnId(1)).connection(), Some(ConnId(1)));
        assert_eq!(Event::Timeout.connection(), None);
        assert_eq!(Event::ListenerAccept.connection(), None);
    }

    #[test]
    fn test_condition_from_io() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let cond = Condition::from_io(&err);
        assert_eq!(cond.name, "io:ConnectionReset");
        assert_eq!(cond.description, "peer reset");
        assert_eq!(cond.to_string(), "io:ConnectionReset: peer reset");
    }
}
