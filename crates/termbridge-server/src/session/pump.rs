//! Output pump: one task per live terminal forwarding PTY output to the
//! owning connection.
//!
//! Session end is detected only from the child's exit status or from end of
//! stream on the master, never from the content of the output. Every event
//! carries the session's generation.

use super::pty::PtyMaster;
use super::registry::{self, SessionTable};
use super::terminal::TerminalSession;
use super::{EventSink, TerminalEvent};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use termbridge_core::ServerEvent;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound on reads performed when draining after the shell exits.
const MAX_DRAIN_READS: usize = 64;

/// How long to wait for the shell to be reapable once its stream ended.
const REAP_GRACE: Duration = Duration::from_millis(500);

pub(super) struct PumpContext {
    pub session: Arc<TerminalSession>,
    pub master: Arc<PtyMaster>,
    pub child: Child,
    pub sink: EventSink,
    pub table: SessionTable,
    pub cancel: watch::Receiver<bool>,
    pub read_chunk: usize,
    pub poll_interval: Duration,
}

/// Why the read loop stopped.
#[derive(Debug)]
enum Stop {
    /// Teardown was requested from outside; the requester cleans up.
    Cancelled,
    /// The shell exited or the stream ended.
    Exited,
    Failed(io::Error),
    /// The connection's outbound channel is gone.
    Detached,
}

pub(super) enum Emit {
    Sent,
    Cancelled,
    Closed,
}

/// Returns the child when another caller owns teardown, so it is dropped
/// only after that caller released the PTY.
pub(super) async fn run(ctx: PumpContext) -> Option<Child> {
    let PumpContext {
        session,
        master,
        mut child,
        sink,
        table,
        mut cancel,
        read_chunk,
        poll_interval,
    } = ctx;

    debug!(conn = %session.connection(), terminal = %session.terminal_id(), "pump started");

    let stop = pump_output(
        &session,
        master,
        &mut child,
        &sink,
        &mut cancel,
        read_chunk,
        poll_interval,
    )
    .await;

    if let Stop::Cancelled = stop {
        debug!(conn = %session.connection(), terminal = %session.terminal_id(), "pump cancelled");
        return Some(child);
    }
    if !session.mark_dead() {
        return Some(child);
    }

    let terminal_id = session.terminal_id().to_string();
    let generation = session.generation();
    match stop {
        Stop::Exited => {
            debug!(conn = %session.connection(), terminal = %terminal_id, "shell ended");
            let event = TerminalEvent::new(generation, ServerEvent::ShellExit { terminal_id });
            emit(&sink, &mut cancel, event).await;
        }
        Stop::Failed(e) => {
            warn!(conn = %session.connection(), terminal = %terminal_id, error = %e, "PTY read failed");
            let event = TerminalEvent::new(generation, ServerEvent::shell_error(terminal_id, e));
            emit(&sink, &mut cancel, event).await;
        }
        Stop::Detached => {
            debug!(conn = %session.connection(), terminal = %terminal_id, "connection gone, stopping pump");
        }
        Stop::Cancelled => {}
    }

    session.stop_writer().await;
    session.release().await;
    registry::evict(&table, &session).await;
    None
}

/// Read loop. Consumes the master handle so it is dropped before any
/// teardown runs.
async fn pump_output(
    session: &TerminalSession,
    master: Arc<PtyMaster>,
    child: &mut Child,
    sink: &EventSink,
    cancel: &mut watch::Receiver<bool>,
    read_chunk: usize,
    poll_interval: Duration,
) -> Stop {
    let mut buf = vec![0u8; read_chunk];
    let mut decoder = Utf8Carry::default();

    loop {
        if *cancel.borrow() {
            return Stop::Cancelled;
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(terminal = %session.terminal_id(), %status, "shell exited");
                session.leader_exited().await;
                return drain(session, &master, &mut buf, &mut decoder, sink, cancel).await;
            }
            Ok(None) => {}
            Err(e) => return Stop::Failed(e),
        }

        tokio::select! {
            biased;
            _ = cancel.changed() => return Stop::Cancelled,
            read = tokio::time::timeout(poll_interval, master.read(&mut buf)) => {
                let n = match read {
                    Err(_elapsed) => continue,
                    Ok(Ok(0)) => return reap_after_eof(session, child, cancel).await,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) if is_end_of_stream(&e) => {
                        return reap_after_eof(session, child, cancel).await
                    }
                    Ok(Err(e)) => return Stop::Failed(e),
                };
                let output = decoder.decode(&buf[..n]);
                if let Some(stop) = forward(session, output, sink, cancel).await {
                    return stop;
                }
            }
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(terminal = %session.terminal_id(), %status, "shell exited"),
                    Err(e) => return Stop::Failed(e),
                }
                session.leader_exited().await;
                return drain(session, &master, &mut buf, &mut decoder, sink, cancel).await;
            }
        }
    }
}

/// The stream ended, which usually means the shell is exiting. Reap it here
/// so its group is signalled before the pid can be reused.
async fn reap_after_eof(
    session: &TerminalSession,
    child: &mut Child,
    cancel: &mut watch::Receiver<bool>,
) -> Stop {
    tokio::select! {
        biased;
        _ = cancel.changed() => return Stop::Cancelled,
        waited = tokio::time::timeout(REAP_GRACE, child.wait()) => match waited {
            Ok(Ok(status)) => {
                debug!(terminal = %session.terminal_id(), %status, "shell exited");
                session.leader_exited().await;
            }
            Ok(Err(e)) => return Stop::Failed(e),
            Err(_elapsed) => {
                debug!(terminal = %session.terminal_id(), "stream ended with the shell still running");
            }
        },
    }
    Stop::Exited
}

/// Forward output still buffered in the pty after the shell exited.
async fn drain(
    session: &TerminalSession,
    master: &PtyMaster,
    buf: &mut [u8],
    decoder: &mut Utf8Carry,
    sink: &EventSink,
    cancel: &mut watch::Receiver<bool>,
) -> Stop {
    for _ in 0..MAX_DRAIN_READS {
        match master.try_read(buf) {
            Ok(Some(n)) if n > 0 => {
                let output = decoder.decode(&buf[..n]);
                if let Some(stop) = forward(session, output, sink, cancel).await {
                    return stop;
                }
            }
            _ => break,
        }
    }
    let rest = decoder.finish();
    if let Some(stop) = forward(session, rest, sink, cancel).await {
        return stop;
    }
    Stop::Exited
}

async fn forward(
    session: &TerminalSession,
    output: String,
    sink: &EventSink,
    cancel: &mut watch::Receiver<bool>,
) -> Option<Stop> {
    if output.is_empty() {
        return None;
    }
    let event = TerminalEvent::new(
        session.generation(),
        ServerEvent::ShellOutput {
            terminal_id: session.terminal_id().to_string(),
            output,
        },
    );
    match emit(sink, cancel, event).await {
        Emit::Sent => None,
        Emit::Cancelled => Some(Stop::Cancelled),
        Emit::Closed => Some(Stop::Detached),
    }
}

/// Send unless teardown is requested first, so a stalled connection can
/// never block `terminate`.
pub(super) async fn emit(
    sink: &EventSink,
    cancel: &mut watch::Receiver<bool>,
    event: TerminalEvent,
) -> Emit {
    if *cancel.borrow() {
        return Emit::Cancelled;
    }
    tokio::select! {
        biased;
        _ = cancel.changed() => Emit::Cancelled,
        sent = sink.send(event) => match sent {
            Ok(()) => Emit::Sent,
            Err(_) => Emit::Closed,
        },
    }
}

/// Linux reports EIO on the master once every slave descriptor is closed.
fn is_end_of_stream(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

/// Lossy UTF-8 decoding that holds back an incomplete trailing sequence so
/// a multi-byte character split across reads is not mangled.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated-but-valid UTF-8 prefix at the end of `bytes`.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match b {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < width && std::str::from_utf8(&bytes[i..]).is_err() {
            have
        } else {
            0
        };
    }
    0
}
