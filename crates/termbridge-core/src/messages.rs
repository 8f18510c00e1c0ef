//! Event types exchanged over the duplex channel.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. Payload
//! field names are camelCase to match the browser client.

use serde::{Deserialize, Serialize};

/// Caller-supplied terminal identifier, unique per connection only.
pub type TerminalId = String;

/// Column count used when a client omits `cols`.
pub const DEFAULT_COLS: u16 = 80;
/// Row count used when a client omits `rows`.
pub const DEFAULT_ROWS: u16 = 24;

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

// ── Client → server ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShellPayload {
    pub terminal_id: TerminalId,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInputPayload {
    pub terminal_id: TerminalId,
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTerminalPayload {
    pub terminal_id: TerminalId,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseShellPayload {
    pub terminal_id: TerminalId,
}

/// Events sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate(AuthenticatePayload),
    RestoreSession(RestoreSessionPayload),
    CreateShell(CreateShellPayload),
    ShellInput(ShellInputPayload),
    ResizeTerminal(ResizeTerminalPayload),
    CloseShell(CloseShellPayload),
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => "authenticate",
            ClientEvent::RestoreSession(_) => "restore_session",
            ClientEvent::CreateShell(_) => "create_shell",
            ClientEvent::ShellInput(_) => "shell_input",
            ClientEvent::ResizeTerminal(_) => "resize_terminal",
            ClientEvent::CloseShell(_) => "close_shell",
        }
    }

    /// Whether the event mutates terminal state and therefore needs an
    /// authorized connection.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            ClientEvent::Authenticate(_) | ClientEvent::RestoreSession(_)
        )
    }
}

// ── Server → client ────────────────────────────────────────────────────

/// Events pushed to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Carries a reconnection token the client may present via
    /// `restore_session` after the socket drops.
    AuthenticationSuccess { token: String },
    AuthenticationFailed { reason: String },
    ShellOutput { terminal_id: TerminalId, output: String },
    ShellExit { terminal_id: TerminalId },
    ShellError { terminal_id: TerminalId, error: String },
    /// Reply to any client frame that carried an `ack` id.
    Ack {
        ack: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerEvent {
    /// The terminal this event is tagged with, if any.
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ShellOutput { terminal_id, .. }
            | ServerEvent::ShellExit { terminal_id }
            | ServerEvent::ShellError { terminal_id, .. } => Some(terminal_id),
            _ => None,
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        ServerEvent::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub fn shell_error(terminal_id: impl Into<TerminalId>, error: impl ToString) -> Self {
        ServerEvent::ShellError {
            terminal_id: terminal_id.into(),
            error: error.to_string(),
        }
    }
}
