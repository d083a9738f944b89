//! Helpers for the wire protocol of spec.md §6: JSON text-frame envelopes
//! carrying a `type` discriminator plus `clientId`/`fromClientId` addressing.
//! The broker only ever looks at these three fields — payloads (`offer`,
//! `answer`, `candidate`) pass through untouched as opaque JSON.

use serde_json::Value;

pub const TYPE_VIEWER_CONNECTED: &str = "viewer_connected";

/// Builds the `viewer_connected` envelope the broker synthesises on
/// registration — this is never something a client sends, only something
/// the broker emits to every other connected client.
pub fn viewer_connected(client_id: &str) -> Value {
    serde_json::json!({ "type": TYPE_VIEWER_CONNECTED, "clientId": client_id })
}

/// Stamps `fromClientId` (always overwritten to the real sender) and
/// `clientId` (only filled in when absent, preserving a caller-specified
/// target) per the routing rule in spec.md §4.5.
pub fn stamp_routing_fields(mut msg: Value, sender_id: &str) -> Value {
    if let Value::Object(map) = &mut msg {
        map.insert("fromClientId".to_string(), Value::String(sender_id.to_string()));
        map.entry("clientId".to_string())
            .or_insert_with(|| Value::String(sender_id.to_string()));
    }
    msg
}

/// The target a message should be dispatched to on the receiving side:
/// prefer `clientId`, fall back to `fromClientId`, per spec.md §6.
pub fn target_client_id(msg: &Value) -> Option<&str> {
    msg.get("clientId")
        .and_then(Value::as_str)
        .or_else(|| msg.get("fromClientId").and_then(Value::as_str))
}

pub fn message_type(msg: &Value) -> Option<&str> {
    msg.get("type").and_then(Value::as_str)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamp_preserves_explicit_target() {
        let msg = json!({"type": "candidate", "clientId": "client-2", "candidate": {}});
        let stamped = stamp_routing_fields(msg, "client-5");
        assert_eq!(stamped["clientId"], "client-2");
        assert_eq!(stamped["fromClientId"], "client-5");
    }

    #[test]
    fn stamp_fills_missing_target_with_sender() {
        let msg = json!({"type": "candidate", "candidate": {}});
        let stamped = stamp_routing_fields(msg, "client-5");
        assert_eq!(stamped["clientId"], "client-5");
        assert_eq!(stamped["fromClientId"], "client-5");
    }

    #[test]
    fn target_falls_back_to_from_client_id() {
        let msg = json!({"fromClientId": "client-5"});
        assert_eq!(target_client_id(&msg), Some("client-5"));
    }
}
