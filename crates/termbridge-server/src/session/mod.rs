//! Terminal sessions: PTY lifecycle, output pump, input writer, and the
//! registry that owns them.

pub mod input;
pub mod pty;
pub mod pump;
pub mod registry;
pub mod terminal;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use termbridge_core::ServerEvent;
use tokio::sync::mpsc;

pub use registry::Registry;

/// Outbound event channel of one connection.
pub type EventSink = mpsc::Sender<TerminalEvent>;

/// A terminal event tagged with the generation of the session that
/// produced it.
///
/// Generations are process-unique, so a connection can tell output of a
/// closed or replaced session apart from output of the one now registered
/// under the same terminal id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    pub generation: u64,
    pub event: ServerEvent,
}

impl TerminalEvent {
    pub fn new(generation: u64, event: ServerEvent) -> Self {
        Self { generation, event }
    }
}

/// Identity of one accepted duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
