//! Transport envelope: the `{type, payload, meta}` wire shape, legacy flat
//! key promotion, and size enforcement.
//!
//! This module only knows how to turn raw frame text into an [`Envelope`]
//! and back; it does not touch the socket. [`crate::transport`] owns the
//! read/write loop and the rate limiter.

use serde_json::{Map, Value};

use crate::error::BrokerError;

/// Top-level legacy keys that are promoted into `payload` when a peer
/// sends a flat message instead of the enveloped shape. Kept in this
/// order only for readability; promotion order does not affect behavior.
const LEGACY_PROMOTED_KEYS: &[&str] = &[
    "publicId", "owner", "value", "content", "message", "username", "password", "reason",
];

/// A decoded `{type, payload, meta}` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Frame type, e.g. `"init"`, `"command"`, `"line"`.
    pub frame_type: String,
    /// Type-specific payload object.
    pub payload: Map<String, Value>,
    /// Out-of-band metadata: `clientTs`, `client`, and (server-attached)
    /// `serverTs`.
    pub meta: Map<String, Value>,
}

impl Envelope {
    /// Build an outgoing envelope. `meta` defaults to an empty object if
    /// not supplied by the caller; `serverTs` is stamped in by
    /// [`Envelope::encode`].
    #[must_use]
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            frame_type: frame_type.into(),
            payload,
            meta: Map::new(),
        }
    }

    /// Parse a raw frame.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::OversizedFrame` if `raw` exceeds `max_bytes`,
    /// or `BrokerError::MalformedFrame` if it is not valid JSON, is not an
    /// object, or has no `type` string field.
    pub fn parse(raw: &str, max_bytes: usize) -> Result<Self, BrokerError> {
        if raw.len() > max_bytes {
            return Err(BrokerError::OversizedFrame {
                limit: max_bytes,
                actual: raw.len(),
            });
        }

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BrokerError::MalformedFrame(e.to_string()))?;

        let mut root = match value {
            Value::Object(map) => map,
            _ => return Err(BrokerError::MalformedFrame("frame is not a JSON object".to_string())),
        };

        let frame_type = match root.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(BrokerError::MalformedFrame("missing \"type\" field".to_string())),
        };

        let mut payload = match root.remove("payload") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(BrokerError::MalformedFrame("\"payload\" must be an object".to_string())),
        };

        let meta = match root.remove("meta") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(BrokerError::MalformedFrame("\"meta\" must be an object".to_string())),
        };

        // Legacy peers send flat top-level fields instead of nesting them
        // under `payload`. Promote the recognized ones so both forms are
        // accepted on the read path. The enveloped form always wins if a
        // key is present both flat and already under `payload`.
        for key in LEGACY_PROMOTED_KEYS {
            if let Some(v) = root.remove(*key) {
                payload.entry((*key).to_string()).or_insert(v);
            }
        }

        Ok(Self { frame_type, payload, meta })
    }

    /// Serialize this envelope, stamping `serverTs` (milliseconds since
    /// the Unix epoch) into `meta`.
    #[must_use]
    pub fn encode(mut self, server_ts_millis: i64) -> String {
        self.meta
            .insert("serverTs".to_string(), Value::from(server_ts_millis));
        let root = Value::Object(
            [
                ("type".to_string(), Value::String(self.frame_type)),
                ("payload".to_string(), Value::Object(self.payload)),
                ("meta".to_string(), Value::Object(self.meta)),
            ]
            .into_iter()
            .collect(),
        );
        root.to_string()
    }

    /// Convenience accessor for a string field in `payload`.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Server→client message type names, matching the message taxonomy.
pub mod frame {
    pub const INIT_OK: &str = "init_ok";
    pub const SESSION_INVALID: &str = "session_invalid";
    pub const STATE: &str = "state";
    pub const HISTORY: &str = "history";
    pub const LINE: &str = "line";
    pub const SYSTEM: &str = "system";
    pub const SOUND: &str = "sound";
    pub const ERROR: &str = "error";
    pub const CONFIRM: &str = "confirm";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enveloped_frame() {
        let raw = r#"{"type":"command","payload":{"value":"look"},"meta":{"clientTs":1}}"#;
        let env = Envelope::parse(raw, 1024).expect("parses");
        assert_eq!(env.frame_type, "command");
        assert_eq!(env.payload_str("value"), Some("look"));
        assert_eq!(env.meta.get("clientTs"), Some(&Value::from(1)));
    }

    #[test]
    fn test_parse_promotes_legacy_flat_keys() {
        let raw = r#"{"type":"init","publicId":"abc","owner":"def"}"#;
        let env = Envelope::parse(raw, 1024).expect("parses");
        assert_eq!(env.payload_str("publicId"), Some("abc"));
        assert_eq!(env.payload_str("owner"), Some("def"));
    }

    #[test]
    fn test_enveloped_keys_win_over_legacy_flat_keys() {
        let raw = r#"{"type":"init","publicId":"flat","payload":{"publicId":"nested"}}"#;
        let env = Envelope::parse(raw, 1024).expect("parses");
        assert_eq!(env.payload_str("publicId"), Some("nested"));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = Envelope::parse(r#"{"payload":{}}"#, 1024).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedFrame(_)));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = Envelope::parse("not json", 1024).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedFrame(_)));
    }

    #[test]
    fn test_oversized_frame_rejected_before_parsing() {
        let raw = "x".repeat(100);
        let err = Envelope::parse(&raw, 10).unwrap_err();
        assert_eq!(
            err,
            BrokerError::OversizedFrame { limit: 10, actual: 100 }
        );
    }

    #[test]
    fn test_encode_stamps_server_ts() {
        let env = Envelope::new("line", serde_json::json!({"content": "hi"}));
        let encoded = env.encode(42);
        let value: Value = serde_json::from_str(&encoded).expect("valid json");
        assert_eq!(value["type"], "line");
        assert_eq!(value["payload"]["content"], "hi");
        assert_eq!(value["meta"]["serverTs"], 42);
    }

    #[test]
    fn test_non_object_payload_is_malformed() {
        let err = Envelope::parse(r#"{"type":"x","payload":5}"#, 1024).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedFrame(_)));
    }
}
