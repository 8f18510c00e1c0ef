//! JSON framing for the WebSocket channel.
//!
//! Wire format: one text frame per event,
//! `{"event": "<name>", "data": {...}, "ack": <optional u64>}`.

use crate::error::{BridgeError, BridgeResult};
use crate::messages::{ClientEvent, ServerEvent};
use serde_json::Value;

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// A decoded inbound frame.
///
/// The acknowledgement id is kept even when the event itself fails to
/// decode so the sender can still be told the request was rejected.
#[derive(Debug)]
pub struct ClientFrame {
    pub ack: Option<u64>,
    pub event: BridgeResult<ClientEvent>,
}

/// Decode a text frame received from a client.
///
/// Fails outright only when the frame is oversized or not a JSON object.
pub fn decode_client_frame(text: &str) -> BridgeResult<ClientFrame> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(BridgeError::InvalidMessage(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }

    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(BridgeError::InvalidMessage(
            "frame is not a JSON object".into(),
        ));
    }

    let ack = value.get("ack").and_then(Value::as_u64);
    let event = serde_json::from_value::<ClientEvent>(value).map_err(|e| {
        BridgeError::InvalidMessage(format!("unrecognised event: {e}"))
    });

    Ok(ClientFrame { ack, event })
}

/// Encode a server event into a text frame.
pub fn encode_server_event(event: &ServerEvent) -> BridgeResult<String> {
    Ok(serde_json::to_string(event)?)
}
