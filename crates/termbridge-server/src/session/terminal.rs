//! One live terminal: its PTY, liveness flag, output pump and input writer.

use super::input::{self, InputContext};
use super::pty::{self, PtyProcess};
use super::pump::{self, PumpContext};
use super::registry::SessionTable;
use super::{ConnectionId, EventSink};
use crate::config::ShellSettings;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use termbridge_core::{BridgeError, BridgeResult, TerminalId};
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Input chunks a terminal may hold before further input is refused.
const INPUT_QUEUE_DEPTH: usize = 256;

fn next_generation() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A terminal owned by one connection.
///
/// Whoever flips `alive` from true to false owns the teardown: the pump when
/// the shell exits or its stream fails, otherwise the caller of
/// [`TerminalSession::terminate`].
pub struct TerminalSession {
    connection: ConnectionId,
    terminal_id: TerminalId,
    generation: u64,
    pid: Pid,
    alive: AtomicBool,
    /// Serializes resize and release.
    pty: Mutex<PtyProcess>,
    input: mpsc::Sender<Vec<u8>>,
    cancel: watch::Sender<bool>,
    /// Yields the child back when the pump did not tear down itself.
    pump: std::sync::Mutex<Option<JoinHandle<Option<Child>>>>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSession {
    /// Wrap a freshly spawned PTY and start its pump and input writer.
    pub(super) fn start(
        connection: ConnectionId,
        terminal_id: TerminalId,
        mut pty: PtyProcess,
        sink: EventSink,
        table: SessionTable,
        settings: &ShellSettings,
    ) -> BridgeResult<Arc<Self>> {
        let child = pty
            .take_child()
            .ok_or_else(|| BridgeError::Spawn("child handle already taken".into()))?;
        let master = pty
            .master()
            .ok_or_else(|| BridgeError::Spawn("PTY master already released".into()))?;
        let (cancel, cancel_rx) = watch::channel(false);
        let (input_tx, queue) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let generation = next_generation();

        let session = Arc::new(Self {
            connection,
            terminal_id: terminal_id.clone(),
            generation,
            pid: pty.pid(),
            alive: AtomicBool::new(true),
            pty: Mutex::new(pty),
            input: input_tx,
            cancel,
            pump: std::sync::Mutex::new(None),
            writer: std::sync::Mutex::new(None),
        });

        let writer = tokio::spawn(input::run(InputContext {
            connection,
            terminal_id,
            generation,
            master: master.clone(),
            queue,
            sink: sink.clone(),
            cancel: cancel_rx.clone(),
            write_timeout: settings.write_timeout,
        }));
        *session.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);

        let pump = tokio::spawn(pump::run(PumpContext {
            session: session.clone(),
            master,
            child,
            sink,
            table,
            cancel: cancel_rx,
            read_chunk: settings.read_chunk,
            poll_interval: settings.poll_interval,
        }));
        *session.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        Ok(session)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Tag carried by every event this session emits.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Whether a pump task is still attached and running.
    #[cfg(test)]
    pub fn pump_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Whether both descriptors have been closed.
    #[cfg(test)]
    pub async fn is_released(&self) -> bool {
        self.pty.lock().await.is_released()
    }

    #[cfg(test)]
    pub async fn leader_reaped(&self) -> bool {
        self.pty.lock().await.leader_reaped()
    }

    /// Queue input for the writer task. Never waits on the shell.
    pub fn write(&self, data: &[u8]) -> BridgeResult<()> {
        if !self.is_alive() {
            return Err(BridgeError::TerminalNotFound(self.terminal_id.clone()));
        }
        match self.input.try_send(data.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::Backlog(self.terminal_id.clone())),
            Err(TrySendError::Closed(_)) => {
                Err(BridgeError::TerminalNotFound(self.terminal_id.clone()))
            }
        }
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        if !self.is_alive() {
            return Err(BridgeError::TerminalNotFound(self.terminal_id.clone()));
        }
        self.pty.lock().await.resize(cols, rows)
    }

    /// Flip liveness; true only for the single caller that observed it live.
    pub(super) fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Signal the shell's group right after its leader was reaped and stop
    /// teardown from signalling the same pgid again later.
    pub(super) async fn leader_exited(&self) {
        pty::signal_group(self.pid);
        self.pty.lock().await.mark_leader_reaped();
    }

    /// Cancel and wait for the input writer so it drops its master handle.
    pub(super) async fn stop_writer(&self) {
        self.cancel.send_replace(true);
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(conn = %self.connection, terminal = %self.terminal_id, error = %e, "input writer failed");
            }
        }
    }

    /// Close descriptors and signal the process group. Idempotent.
    pub(super) async fn release(&self) {
        self.pty.lock().await.teardown();
    }

    /// Stop both tasks, wait for them, then release the PTY.
    ///
    /// Safe to race with the pump's own exit handling. Only the caller that
    /// removed the session from the registry calls this.
    pub async fn terminate(&self) {
        let owner = self.mark_dead();
        self.cancel.send_replace(true);

        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // The child stays unreaped until after release so its pgid cannot
        // be recycled while the group is signalled.
        let mut child = None;
        if let Some(handle) = handle {
            match handle.await {
                Ok(returned) => child = returned,
                Err(e) => {
                    warn!(conn = %self.connection, terminal = %self.terminal_id, error = %e, "pump task failed")
                }
            }
        }
        self.stop_writer().await;

        if owner {
            self.release().await;
            debug!(conn = %self.connection, terminal = %self.terminal_id, "terminal terminated");
        }
        drop(child);
    }
}
