//! Input writer: one task per live terminal delivering queued keystrokes to
//! the PTY.
//!
//! Dispatch only enqueues, so a shell that stops reading its input stalls
//! this task and never the connection that owns it. A chunk that cannot be
//! written within the write timeout is reported as a `shell_error` and the
//! writer moves on; the session itself stays up.

use super::pty::PtyMaster;
use super::pump::{self, Emit};
use super::{ConnectionId, EventSink, TerminalEvent};
use std::sync::Arc;
use std::time::Duration;
use termbridge_core::{BridgeError, ServerEvent, TerminalId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub(super) struct InputContext {
    pub connection: ConnectionId,
    pub terminal_id: TerminalId,
    pub generation: u64,
    pub master: Arc<PtyMaster>,
    pub queue: mpsc::Receiver<Vec<u8>>,
    pub sink: EventSink,
    pub cancel: watch::Receiver<bool>,
    pub write_timeout: Duration,
}

pub(super) async fn run(ctx: InputContext) {
    let InputContext {
        connection,
        terminal_id,
        generation,
        master,
        mut queue,
        sink,
        mut cancel,
        write_timeout,
    } = ctx;

    loop {
        if *cancel.borrow() {
            break;
        }
        let data = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            next = queue.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            written = tokio::time::timeout(write_timeout, master.write_all(&data)) => written,
        };
        let error = match written {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => BridgeError::from(e),
            Err(_elapsed) => BridgeError::Timeout,
        };

        warn!(conn = %connection, terminal = %terminal_id, bytes = data.len(), error = %error, "input write failed");
        let event = TerminalEvent::new(
            generation,
            ServerEvent::shell_error(terminal_id.clone(), error),
        );
        match pump::emit(&sink, &mut cancel, event).await {
            Emit::Sent => {}
            Emit::Cancelled | Emit::Closed => break,
        }
    }

    debug!(conn = %connection, terminal = %terminal_id, "input writer stopped");
}
