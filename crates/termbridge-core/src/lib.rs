//! termbridge-core: Shared protocol library for termbridge.
//!
//! Provides the JSON event types exchanged over the WebSocket, the frame
//! codec, the error taxonomy, and HMAC reconnection tokens.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_client_frame, encode_server_event, ClientFrame, MAX_FRAME_SIZE};
pub use error::{BridgeError, BridgeResult};
pub use messages::{ClientEvent, ServerEvent, TerminalId, DEFAULT_COLS, DEFAULT_ROWS};
pub use token::{
    create_token, credential_digest, credential_matches, generate_secret, verify_token,
};
