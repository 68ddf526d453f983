use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Business entity written next to each outbox message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub details: serde_json::Value,
    pub birth_date: DateTime<Utc>,
}

impl User {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_serialize() {
        let user = User {
            id: "42".to_string(),
            first_name: "user42".to_string(),
            details: json!({"key": 1700000000, "random": 7}),
            birth_date: DateTime::parse_from_rfc3339("1990-05-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let bytes = user.serialize().unwrap();
        let back: User = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, user);

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["first_name"], "user42");
        assert_eq!(json["details"]["random"], 7);
    }
}
