//! The application message carried through the write-ahead log.
//!
//! A [`Message`] is encoded as JSON and written as the content of a logical
//! decoding message. The payload is base64 inside the JSON document so the
//! encoding stays symmetric for arbitrary bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id assigned by the producer.
    pub id: String,
    /// Wall-clock time the producer built the message; only used for latency.
    pub time: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            time: Utc::now(),
            payload,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(content: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(content)?)
    }

    /// Time elapsed since the producer built the message, never negative.
    pub fn latency(&self) -> std::time::Duration {
        (Utc::now() - self.time).to_std().unwrap_or_default()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_message_serialize_deserialize() {
        let message = Message::new("7", b"hello".to_vec());
        let encoded = message.serialize().unwrap();
        let decoded = Message::deserialize(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_payload_is_base64_in_json() {
        let message = Message::new("1", vec![0, 159, 146, 150]);
        let json: serde_json::Value = serde_json::from_slice(&message.serialize().unwrap()).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["payload"], "AJ+Slg==");
        assert!(json["time"].is_string());
    }

    #[test]
    fn test_deserialize_rejects_bad_payload() {
        let content = br#"{"id":"1","time":"2024-01-01T00:00:00Z","payload":"not base64!"}"#;
        assert!(Message::deserialize(content).is_err());
        assert!(Message::deserialize(b"{").is_err());
    }

    #[test]
    fn test_latency_is_never_negative() {
        let mut message = Message::new("1", Vec::new());
        message.time = Utc::now() + Duration::seconds(60);
        assert_eq!(message.latency(), std::time::Duration::ZERO);

        message.time = Utc::now() - Duration::seconds(2);
        assert!(message.latency() >= std::time::Duration::from_secs(2));
    }
}
