//! Raw-connection runtime.
//!
//! - `BufferPool` / `RawBuffer`: byte buffers exchanged with connections
//! - `SlotTable`: bounded connection slots
//! - `Reactor`: the single-threaded event dispatcher
//! - `EventSource`: the contract the reactor consumes, implemented by the
//!   mio-backed `Proactor`

mod buffer;
mod connection;
mod event;
mod mio;
mod reactor;
mod source;
mod token;

#[cfg(test)]
mod testing;

pub use buffer::{disposition, BufferPool, BufferState, Completion, RawBuffer, Sides};
pub use connection::{PoolFull, SlotTable};
pub use event::{Condition, Event};
pub use self::mio::Proactor;
pub use reactor::{ExitStatus, Reactor, ReactorConfig};
pub use source::EventSource;
pub use token::ConnId;

use crate::config::Config;
use std::io;
use tracing::info;

/// Bind the configured address and run the echo reactor until it goes idle.
///
/// Received payload bytes are written to stdout.
pub fn run(config: Config) -> io::Result<ExitStatus> {
    let addr = config
        .listen_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut proactor = Proactor::new()?;
    proactor.listen(addr, config.backlog)?;
    info!(addr = %addr, backlog = config.backlog, "Starting raw echo reactor");

    let stdout = io::stdout().lock();
    let mut reactor = Reactor::new(proactor, stdout, config.reactor());
    reactor.run()
}
