//! Terminal session registry.
//!
//! Authoritative map of connection → terminal → live session. Every
//! mutating operation except disconnect cleanup checks the access gate
//! first and has no side effect when it fails.

use super::pty::PtyProcess;
use super::terminal::TerminalSession;
use super::{ConnectionId, EventSink};
use crate::auth::AccessGate;
use crate::config::ShellSettings;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use termbridge_core::{BridgeError, BridgeResult, TerminalId};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub(super) type SessionTable =
    Arc<RwLock<HashMap<ConnectionId, HashMap<TerminalId, Arc<TerminalSession>>>>>;

pub struct Registry {
    sessions: SessionTable,
    gate: Arc<AccessGate>,
    settings: ShellSettings,
}

impl Registry {
    pub fn new(gate: Arc<AccessGate>, settings: ShellSettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            gate,
            settings,
        }
    }

    pub fn gate(&self) -> &Arc<AccessGate> {
        &self.gate
    }

    /// Spawn a shell for `(conn, terminal_id)` and start streaming its output
    /// to `sink`. Returns the generation tagging the new session's events.
    ///
    /// A live session already registered under the same id is torn down
    /// completely before the new shell is spawned.
    pub async fn create(
        &self,
        conn: ConnectionId,
        terminal_id: &str,
        cols: u16,
        rows: u16,
        sink: EventSink,
    ) -> BridgeResult<u64> {
        self.gate.ensure_authorized(conn).await?;

        if let Some(previous) = self.take(conn, terminal_id).await {
            info!(conn = %conn, terminal = %terminal_id, pid = previous.pid().as_raw(), "replacing existing terminal");
            previous.terminate().await;
        }

        let pty = PtyProcess::spawn(&self.settings, cols, rows)?;
        let session = TerminalSession::start(
            conn,
            terminal_id.to_string(),
            pty,
            sink,
            self.sessions.clone(),
            &self.settings,
        )?;
        let generation = session.generation();

        let displaced = self
            .sessions
            .write()
            .await
            .entry(conn)
            .or_default()
            .insert(terminal_id.to_string(), session);
        if let Some(displaced) = displaced {
            displaced.terminate().await;
        }

        info!(conn = %conn, terminal = %terminal_id, cols, rows, generation, "terminal created");
        Ok(generation)
    }

    pub async fn resize(
        &self,
        conn: ConnectionId,
        terminal_id: &str,
        cols: u16,
        rows: u16,
    ) -> BridgeResult<()> {
        self.gate.ensure_authorized(conn).await?;
        self.lookup(conn, terminal_id).await?.resize(cols, rows).await
    }

    /// Queue input for a terminal. Succeeds once the input is accepted for
    /// delivery; write failures surface later as `shell_error` events.
    pub async fn write(&self, conn: ConnectionId, terminal_id: &str, data: &[u8]) -> BridgeResult<()> {
        self.gate.ensure_authorized(conn).await?;
        self.lookup(conn, terminal_id).await?.write(data)
    }

    /// Tear down one terminal. Destroying an absent terminal succeeds.
    pub async fn destroy(&self, conn: ConnectionId, terminal_id: &str) -> BridgeResult<()> {
        self.gate.ensure_authorized(conn).await?;
        match self.take(conn, terminal_id).await {
            Some(session) => {
                session.terminate().await;
                info!(conn = %conn, terminal = %terminal_id, "terminal closed");
            }
            None => debug!(conn = %conn, terminal = %terminal_id, "close of unknown terminal ignored"),
        }
        Ok(())
    }

    /// Tear down every terminal of a connection. Used on disconnect, so no
    /// authorization is required.
    pub async fn destroy_all(&self, conn: ConnectionId) {
        let owned = self.sessions.write().await.remove(&conn);
        let Some(owned) = owned else {
            return;
        };
        let count = owned.len();
        join_all(owned.into_values().map(|s| async move { s.terminate().await })).await;
        info!(conn = %conn, count, "connection terminals destroyed");
    }

    /// Tear down everything, e.g. on server shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<ConnectionId> = self.sessions.read().await.keys().copied().collect();
        info!(connections = all.len(), "tearing down all terminals");
        join_all(all.into_iter().map(|conn| self.destroy_all(conn))).await;
    }

    pub async fn session(&self, conn: ConnectionId, terminal_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .get(&conn)
            .and_then(|terminals| terminals.get(terminal_id))
            .cloned()
    }

    #[cfg(test)]
    pub async fn contains(&self, conn: ConnectionId, terminal_id: &str) -> bool {
        self.session(conn, terminal_id).await.is_some()
    }

    pub async fn terminal_count(&self, conn: ConnectionId) -> usize {
        self.sessions.read().await.get(&conn).map_or(0, HashMap::len)
    }

    /// Number of connections owning at least one terminal.
    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lookup(&self, conn: ConnectionId, terminal_id: &str) -> BridgeResult<Arc<TerminalSession>> {
        self.session(conn, terminal_id)
            .await
            .ok_or_else(|| BridgeError::TerminalNotFound(terminal_id.to_string()))
    }

    /// Remove an entry, pruning the connection when it becomes empty.
    async fn take(&self, conn: ConnectionId, terminal_id: &str) -> Option<Arc<TerminalSession>> {
        let mut sessions = self.sessions.write().await;
        let terminals = sessions.get_mut(&conn)?;
        let removed = terminals.remove(terminal_id);
        if terminals.is_empty() {
            sessions.remove(&conn);
        }
        removed
    }
}

/// Remove `session` from the table if it is still the registered entry for
/// its id. Called by the pump after it tore the session down itself.
pub(super) async fn evict(table: &SessionTable, session: &Arc<TerminalSession>) {
    let conn = session.connection();
    let mut sessions = table.write().await;
    let Some(terminals) = sessions.get_mut(&conn) else {
        return;
    };
    let current = terminals
        .get(session.terminal_id())
        .is_some_and(|s| Arc::ptr_eq(s, session));
    if current {
        terminals.remove(session.terminal_id());
        debug!(conn = %conn, terminal = %session.terminal_id(), "terminal evicted after exit");
    }
    if terminals.is_empty() {
        sessions.remove(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use crate::session::TerminalEvent;
    use termbridge_core::ServerEvent;
    use tokio::sync::mpsc;

    const KEY: &str = "test-key";

    fn registry() -> Registry {
        let gate = Arc::new(AccessGate::new(KEY, 3600).unwrap());
        let settings = ShellSettings {
            path: PathBuf::from("/bin/sh"),
            ..ShellSettings::default()
        };
        Registry::new(gate, settings)
    }

    async fn authorized(reg: &Registry) -> ConnectionId {
        let conn = ConnectionId::next();
        assert!(reg.gate().authenticate(conn, KEY).await.is_granted());
        conn
    }

    /// Collect output for `terminal` until it contains `needle`.
    async fn wait_for_output(
        rx: &mut mpsc::Receiver<TerminalEvent>,
        terminal: &str,
        needle: &str,
        others: &mut Vec<ServerEvent>,
    ) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !seen.contains(needle) {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, saw {seen:?}"))
                .expect("sink closed")
                .event;
            match &event {
                ServerEvent::ShellOutput { terminal_id, output } if terminal_id == terminal => {
                    seen.push_str(output)
                }
                _ => others.push(event),
            }
        }
        seen
    }

    async fn wait_for_exit(rx: &mut mpsc::Receiver<TerminalEvent>, terminal: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for shell_exit")
                .expect("sink closed")
                .event;
            if let ServerEvent::ShellExit { terminal_id } = &event {
                if terminal_id == terminal {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn create_before_authenticate_creates_nothing() {
        let reg = registry();
        let conn = ConnectionId::next();
        let (tx, _rx) = mpsc::channel(16);

        let err = reg.create(conn, "t1", 80, 24, tx).await.unwrap_err();
        assert!(err.is_auth());
        assert!(!reg.contains(conn, "t1").await);
        assert_eq!(reg.connection_count().await, 0);
    }

    #[tokio::test]
    async fn wrong_key_then_create_is_refused() {
        let reg = registry();
        let conn = ConnectionId::next();
        assert!(!reg.gate().authenticate(conn, "wrong").await.is_granted());

        let (tx, _rx) = mpsc::channel(16);
        assert!(matches!(
            reg.create(conn, "t1", 80, 24, tx).await,
            Err(BridgeError::Unauthorized)
        ));
        assert!(matches!(
            reg.write(conn, "t1", b"ls\n").await,
            Err(BridgeError::Unauthorized)
        ));
        assert!(matches!(
            reg.destroy(conn, "t1").await,
            Err(BridgeError::Unauthorized)
        ));
        assert_eq!(reg.terminal_count(conn).await, 0);
    }

    #[tokio::test]
    async fn echo_round_trip_then_close() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        assert!(reg.contains(conn, "t1").await);

        reg.write(conn, "t1", b"echo hi-$((40+2))\n").await.unwrap();
        let mut others = Vec::new();
        let out = wait_for_output(&mut rx, "t1", "hi-42", &mut others).await;
        assert!(out.contains("hi-42"));

        let session = reg.session(conn, "t1").await.unwrap();
        reg.destroy(conn, "t1").await.unwrap();
        assert!(!reg.contains(conn, "t1").await);
        assert_eq!(reg.connection_count().await, 0);
        assert!(!session.is_alive());
        assert!(!session.pump_running());
        assert!(session.is_released().await);

        // Anything emitted before close completed is already queued; nothing
        // may follow it.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminals_do_not_cross_talk() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx.clone()).await.unwrap();
        reg.create(conn, "t2", 80, 24, tx).await.unwrap();
        assert_eq!(reg.terminal_count(conn).await, 2);

        reg.write(conn, "t1", b"echo one-$((1+1))\n").await.unwrap();
        reg.write(conn, "t2", b"echo two-$((2+2))\n").await.unwrap();

        let mut others = Vec::new();
        wait_for_output(&mut rx, "t1", "one-2", &mut others).await;
        let mut rest = Vec::new();
        wait_for_output(&mut rx, "t2", "two-4", &mut rest).await;
        others.extend(rest);

        for event in &others {
            if let ServerEvent::ShellOutput { terminal_id, output } = event {
                if terminal_id == "t2" {
                    assert!(!output.contains("one-2"), "t1 output leaked into t2");
                }
                if terminal_id == "t1" {
                    assert!(!output.contains("two-4"), "t2 output leaked into t1");
                }
            }
        }

        reg.destroy_all(conn).await;
    }

    #[tokio::test]
    async fn recreate_tears_down_previous_session() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        let first_gen = reg.create(conn, "t1", 80, 24, tx.clone()).await.unwrap();
        let first = reg.session(conn, "t1").await.unwrap();

        let second_gen = reg.create(conn, "t1", 100, 30, tx).await.unwrap();
        let second = reg.session(conn, "t1").await.unwrap();

        assert_ne!(first_gen, second_gen);
        assert_eq!(first.generation(), first_gen);
        assert_eq!(second.generation(), second_gen);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.pid(), second.pid());
        assert!(!first.is_alive());
        assert!(!first.pump_running());
        assert!(first.is_released().await);
        assert!(second.is_alive());
        assert!(second.pump_running());
        assert_eq!(reg.terminal_count(conn).await, 1);

        reg.write(conn, "t1", b"echo again-$((3*3))\n").await.unwrap();
        let mut others = Vec::new();
        wait_for_output(&mut rx, "t1", "again-9", &mut others).await;

        reg.destroy_all(conn).await;
    }

    #[tokio::test]
    async fn resize_and_write_on_unknown_terminal_fail() {
        let reg = registry();
        let conn = authorized(&reg).await;

        assert!(matches!(
            reg.resize(conn, "ghost", 80, 24).await,
            Err(BridgeError::TerminalNotFound(_))
        ));
        assert!(matches!(
            reg.write(conn, "ghost", b"x").await,
            Err(BridgeError::TerminalNotFound(_))
        ));
        assert_eq!(reg.connection_count().await, 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, _rx) = mpsc::channel(16);

        assert!(reg.destroy(conn, "never").await.is_ok());
        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        assert!(reg.destroy(conn, "t1").await.is_ok());
        assert!(reg.destroy(conn, "t1").await.is_ok());
        assert!(!reg.contains(conn, "t1").await);
    }

    #[tokio::test]
    async fn destroy_all_clears_connection_for_any_count() {
        let reg = registry();

        let empty = authorized(&reg).await;
        reg.destroy_all(empty).await;
        assert_eq!(reg.terminal_count(empty).await, 0);

        let one = authorized(&reg).await;
        let (tx, _rx1) = mpsc::channel(64);
        reg.create(one, "a", 80, 24, tx).await.unwrap();
        reg.destroy_all(one).await;
        assert_eq!(reg.terminal_count(one).await, 0);

        let many = authorized(&reg).await;
        let (tx, _rx2) = mpsc::channel(64);
        let mut sessions = Vec::new();
        for id in ["a", "b", "c"] {
            reg.create(many, id, 80, 24, tx.clone()).await.unwrap();
            sessions.push(reg.session(many, id).await.unwrap());
        }
        reg.destroy_all(many).await;
        assert_eq!(reg.terminal_count(many).await, 0);
        assert_eq!(reg.connection_count().await, 0);
        for s in sessions {
            assert!(s.is_released().await);
        }
    }

    #[tokio::test]
    async fn shell_exit_is_reported_and_pruned() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        let session = reg.session(conn, "t1").await.unwrap();
        reg.write(conn, "t1", b"exit\n").await.unwrap();

        wait_for_exit(&mut rx, "t1").await;
        assert!(session.leader_reaped().await);
        // Eviction follows the exit event.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while reg.contains(conn, "t1").await {
            assert!(tokio::time::Instant::now() < deadline, "session not evicted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reg.connection_count().await, 0);
        assert!(!session.is_alive());
        assert!(session.is_released().await);
    }

    #[tokio::test]
    async fn output_mentioning_logout_does_not_end_session() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        reg.write(conn, "t1", b"echo logout exit-$((5+5))\n").await.unwrap();
        let mut others = Vec::new();
        wait_for_output(&mut rx, "t1", "exit-10", &mut others).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reg.contains(conn, "t1").await);
        assert!(reg.session(conn, "t1").await.unwrap().is_alive());

        reg.destroy_all(conn).await;
    }

    #[tokio::test]
    async fn closed_sink_stops_pump_and_cleans_up() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, rx) = mpsc::channel(4);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        let session = reg.session(conn, "t1").await.unwrap();
        drop(rx);
        reg.write(conn, "t1", b"echo gone\n").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reg.contains(conn, "t1").await {
            assert!(tokio::time::Instant::now() < deadline, "session not cleaned up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(session.is_released().await);
    }

    #[tokio::test]
    async fn events_carry_the_session_generation() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        let generation = reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        reg.write(conn, "t1", b"echo gen-$((7*6))\n").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let tagged = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("sink closed");
            assert_eq!(tagged.generation, generation);
            if let ServerEvent::ShellOutput { output, .. } = &tagged.event {
                if output.contains("gen-42") {
                    break;
                }
            }
        }
        reg.destroy_all(conn).await;
    }

    #[tokio::test]
    async fn stalled_shell_does_not_block_input_or_other_terminals() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, mut rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx.clone()).await.unwrap();
        reg.create(conn, "t2", 80, 24, tx).await.unwrap();
        reg.write(conn, "t1", b"sleep 30\n").await.unwrap();

        // Far more than the pty buffer holds while nobody reads it.
        let flood = vec![b'x'; 64 * 1024];
        let started = tokio::time::Instant::now();
        reg.write(conn, "t1", &flood).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        reg.write(conn, "t2", b"echo free-$((8+8))\n").await.unwrap();
        let mut others = Vec::new();
        wait_for_output(&mut rx, "t2", "free-16", &mut others).await;
        assert!(started.elapsed() < Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        reg.destroy_all(conn).await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn full_input_queue_is_refused() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, _rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        reg.write(conn, "t1", b"sleep 30\n").await.unwrap();

        let chunk = vec![b'y'; 16 * 1024];
        let mut refused = false;
        for _ in 0..1024 {
            match reg.write(conn, "t1", &chunk).await {
                Ok(()) => {}
                Err(BridgeError::Backlog(id)) => {
                    assert_eq!(id, "t1");
                    refused = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(refused, "input queue never filled");
        assert!(reg.session(conn, "t1").await.unwrap().is_alive());
        reg.destroy_all(conn).await;
    }

    #[tokio::test]
    async fn terminated_shell_leader_is_signalled_by_teardown() {
        let reg = registry();
        let conn = authorized(&reg).await;
        let (tx, _rx) = mpsc::channel(256);

        reg.create(conn, "t1", 80, 24, tx).await.unwrap();
        let session = reg.session(conn, "t1").await.unwrap();
        reg.destroy(conn, "t1").await.unwrap();

        // The pump never reaped the leader, so teardown signalled the group.
        assert!(!session.leader_reaped().await);
        assert!(session.is_released().await);
    }
}
