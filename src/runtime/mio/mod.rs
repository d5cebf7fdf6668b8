//! mio-based event source.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS), exposed
//! to the reactor as completion events over application-owned buffers.

mod event_loop;

pub use event_loop::Proactor;
