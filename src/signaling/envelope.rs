//! The wire message format for the signaling WebSocket (`spec.md` §6.2).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call_store::CallDto;

/// `{ type, to?, from?, call_type?, data? }` — the envelope every signaling
/// frame is wrapped in.
///
/// `type` is deliberately a plain `String`, not a closed enum: `offer`,
/// `answer`, `ice-candidate`, `leave`, and any type the browser peers agree
/// on between themselves must forward verbatim even if the server does not
/// recognize it (`spec.md` §6.2, "(other)" row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const TYPE_JOIN: &str = "join";
pub const TYPE_STATE: &str = "state";
pub const TYPE_PEER_RECONNECTED: &str = "peer-reconnected";
pub const TYPE_PEER_DISCONNECTED: &str = "peer-disconnected";
pub const TYPE_PING: &str = "ping";

impl SessionEnvelope {
    pub fn new(kind: impl Into<String>) -> Self {
        SessionEnvelope {
            kind: kind.into(),
            to: None,
            from: None,
            call_type: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// The first message any peer receives on a fresh socket (`spec.md`
    /// §4.3 step 5, §8 invariant 7).
    pub fn join(peer_id: &str, role: &str, is_reconnect: bool, peer_online: bool) -> Self {
        SessionEnvelope::new(TYPE_JOIN).with_data(serde_json::json!({
            "peer_id": peer_id,
            "role": role,
            "is_reconnect": is_reconnect,
            "peer_online": peer_online,
        }))
    }

    /// `{call_id, status, participants:{count}}` (`spec.md` §4.3.1).
    pub fn state(dto: &CallDto) -> Self {
        SessionEnvelope::new(TYPE_STATE)
            .with_data(serde_json::to_value(dto).unwrap_or(Value::Null))
    }

    pub fn peer_reconnected(from: &str) -> Self {
        SessionEnvelope::new(TYPE_PEER_RECONNECTED).with_from(from)
    }

    pub fn peer_disconnected(from: &str) -> Self {
        SessionEnvelope::new(TYPE_PEER_DISCONNECTED).with_from(from)
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_envelope_round_trips_through_json() {
        let env = SessionEnvelope::join("H", "host", false, true);
        let json = env.to_json().unwrap();
        let parsed: SessionEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, TYPE_JOIN);
        assert_eq!(parsed.data.unwrap()["peer_id"], "H");
    }

    #[test]
    fn offer_envelope_preserves_to_from_and_data() {
        let json = r#"{"type":"offer","to":"G","data":{"sdp":"v=0"}}"#;
        let mut env: SessionEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.to.as_deref(), Some("G"));

        // Server tags `from` before forwarding (spec.md §6.2).
        env.from = Some("H".to_string());
        let out = env.to_json().unwrap();
        let reparsed: SessionEnvelope = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed.kind, "offer");
        assert_eq!(reparsed.from.as_deref(), Some("H"));
        assert_eq!(reparsed.data.unwrap()["sdp"], "v=0");
    }

    #[test]
    fn state_envelope_has_expected_shape() {
        let dto = CallDto {
            call_id: "A".to_string(),
            status: "active",
            participants: crate::call_store::ParticipantsDto { count: 2 },
        };
        let env = SessionEnvelope::state(&dto);
        let data = env.data.unwrap();
        assert_eq!(data["call_id"], "A");
        assert_eq!(data["status"], "active");
        assert_eq!(data["participants"]["count"], 2);
    }

    #[test]
    fn unrecognized_type_still_parses_for_forwarding() {
        let json = r#"{"type":"custom-app-event","data":{"foo":1}}"#;
        let env: SessionEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.kind, "custom-app-event");
    }

    #[test]
    fn malformed_json_fails_to_parse() {
        let result: Result<SessionEnvelope, _> = serde_json::from_str("not json");
        assert!(result.is_err());
    }
}
