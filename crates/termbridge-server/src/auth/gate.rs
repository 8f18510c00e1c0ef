//! Access control gate: the single authority on which connections may
//! mutate terminal state.
//!
//! A connection becomes authorized by presenting the shared API key, or by
//! presenting a reconnection token issued to an earlier connection. Grants
//! are never revoked while the connection lives; `revoke` is called only
//! from disconnect cleanup.

use crate::session::ConnectionId;
use std::collections::HashSet;
use termbridge_core::{
    create_token, credential_digest, credential_matches, generate_secret, verify_token,
    BridgeError, BridgeResult,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authorized. `token` can be presented later via `restore`.
    Granted { token: String },
    Denied { reason: String },
}

impl AuthOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthOutcome::Granted { .. })
    }
}

pub struct AccessGate {
    /// SHA-256 of the shared API key; doubles as the token subject.
    key_digest: String,
    /// Per-process HMAC secret for reconnection tokens.
    secret: Vec<u8>,
    token_ttl: u64,
    authorized: RwLock<HashSet<ConnectionId>>,
}

impl AccessGate {
    pub fn new(api_key: &str, token_ttl: u64) -> BridgeResult<Self> {
        if api_key.is_empty() {
            return Err(BridgeError::Config("API key must not be empty".into()));
        }
        Ok(Self {
            key_digest: credential_digest(api_key),
            secret: generate_secret()?,
            token_ttl,
            authorized: RwLock::new(HashSet::new()),
        })
    }

    /// Check `credential` against the shared key and authorize on match.
    ///
    /// A failed attempt leaves any existing grant for the connection intact.
    pub async fn authenticate(&self, conn: ConnectionId, credential: &str) -> AuthOutcome {
        if !credential_matches(&self.key_digest, credential) {
            debug!(conn = %conn, "authentication denied");
            return AuthOutcome::Denied {
                reason: "invalid API key".into(),
            };
        }
        self.grant(conn).await
    }

    /// Re-authorize with a token from a previous `Granted` outcome.
    pub async fn restore(&self, conn: ConnectionId, token: &str) -> AuthOutcome {
        if let Err(e) = verify_token(&self.secret, &self.key_digest, token) {
            debug!(conn = %conn, error = %e, "session restore denied");
            return AuthOutcome::Denied {
                reason: e.to_string(),
            };
        }
        self.grant(conn).await
    }

    async fn grant(&self, conn: ConnectionId) -> AuthOutcome {
        let newly = self.authorized.write().await.insert(conn);
        if newly {
            info!(conn = %conn, "connection authorized");
        }
        AuthOutcome::Granted {
            token: create_token(&self.secret, &self.key_digest, self.token_ttl),
        }
    }

    pub async fn is_authorized(&self, conn: ConnectionId) -> bool {
        self.authorized.read().await.contains(&conn)
    }

    /// `Err(Unauthorized)` unless the connection is authorized.
    pub async fn ensure_authorized(&self, conn: ConnectionId) -> BridgeResult<()> {
        if self.is_authorized(conn).await {
            Ok(())
        } else {
            Err(BridgeError::Unauthorized)
        }
    }

    /// Forget a connection's grant. Tokens already issued stay valid.
    pub async fn revoke(&self, conn: ConnectionId) {
        if self.authorized.write().await.remove(&conn) {
            debug!(conn = %conn, "authorization cleared");
        }
    }

    pub async fn authorized_count(&self) -> usize {
        self.authorized.read().await.len()
    }
}
