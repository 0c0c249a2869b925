use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text of the synthetic first frame on every event stream.
pub const CONNECTED_NOTICE: &str = "Connected to message stream";

/// Source tag given to payloads that were not published through the relay.
pub const FALLBACK_SOURCE: &str = "broker";

/// A message travelling through the broker.
///
/// Immutable once constructed. On the wire it is a JSON object:
///
/// ```json
/// { "message": "hello", "timestamp": "2024-01-15T10:30:00Z", "source": "mqtt-relay" }
/// ```
///
/// The PascalCase keys written by the standalone publisher service
/// (`Message`, `Timestamp`, `Source`) are accepted when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "message", alias = "Message")]
    text: String,
    #[serde(alias = "Timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(alias = "Source", default = "fallback_source")]
    source: String,
}

fn fallback_source() -> String {
    FALLBACK_SOURCE.to_string()
}

impl RelayMessage {
    /// Create a message stamped with the current time.
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self::with_timestamp(text, source, Utc::now())
    }

    /// Create a message with an explicit timestamp.
    pub fn with_timestamp(
        text: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            text: text.into(),
            timestamp,
            source: source.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Encode as the JSON broker payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a broker payload.
    ///
    /// Never fails: anything that is not a relay envelope is taken as raw
    /// text (invalid UTF-8 is replaced), stamped with `received_at` and the
    /// fallback source.
    pub fn from_payload(payload: &[u8], received_at: DateTime<Utc>) -> Self {
        match serde_json::from_slice::<RelayMessage>(payload) {
            Ok(message) => message,
            Err(_) => Self::with_timestamp(
                String::from_utf8_lossy(payload),
                FALLBACK_SOURCE,
                received_at,
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uses_lowercase_keys() {
        let message = RelayMessage::new("hello", "mqtt-relay");
        let json: serde_json::Value =
            serde_json::from_slice(&message.to_payload().unwrap()).unwrap();

        assert_eq!(json["message"], "hello");
        assert_eq!(json["source"], "mqtt-relay");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_from_payload_accepts_publisher_keys() {
        let payload =
            br#"{"Message":"hi","Timestamp":"2024-01-15T10:30:00Z","Source":"MqttPublisher"}"#;
        let message = RelayMessage::from_payload(payload, Utc::now());

        assert_eq!(message.text(), "hi");
        assert_eq!(message.source(), "MqttPublisher");
        assert_eq!(message.timestamp().to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_from_payload_raw_text_falls_back() {
        let received_at = Utc::now();
        let message = RelayMessage::from_payload(b"plain text", received_at);

        assert_eq!(message.text(), "plain text");
        assert_eq!(message.source(), FALLBACK_SOURCE);
        assert_eq!(message.timestamp(), received_at);
    }

    #[test]
    fn test_from_payload_other_json_is_raw_text() {
        let message = RelayMessage::from_payload(br#"{"unrelated":1}"#, Utc::now());
        assert_eq!(message.text(), r#"{"unrelated":1}"#);
    }

    #[test]
    fn test_from_payload_invalid_utf8_is_lossy() {
        let message = RelayMessage::from_payload(&[0x66, 0x6f, 0xff], Utc::now());
        assert_eq!(message.text(), "fo\u{fffd}");
    }
}
