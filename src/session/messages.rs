use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::CivicsQuestion;
use crate::session::state::{Player, PlayerAnswer, SessionStatus};

/// Everything that travels over a game channel. Delivery is at-least-once
/// with no ordering guarantee across message kinds; receivers filter stale
/// and self-originated traffic (see `merge`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "messageType", content = "payload")]
pub enum WireMessage {
    GameUpdate(GameUpdate),
    PlayerAction(ActionEnvelope),
}

impl WireMessage {
    pub fn sender(&self) -> Uuid {
        match self {
            WireMessage::GameUpdate(update) => update.player_id,
            WireMessage::PlayerAction(envelope) => envelope.player_id,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            WireMessage::GameUpdate(update) => update.seq,
            WireMessage::PlayerAction(envelope) => envelope.seq,
        }
    }
}

/// Partial-session patch. Every field is optional; absent fields leave the
/// receiver's copy untouched (shallow merge).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_question_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_question: Option<CivicsQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<CivicsQuestion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<Player>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<Vec<PlayerAnswer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<Uuid>,
}

/// Low-frequency state snapshot patch, stamped with the sender's id and a
/// per-sender monotonic sequence number for stale-message rejection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameUpdate {
    #[serde(flatten)]
    pub patch: SessionPatch,
    pub player_id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Discrete player action, never throttled.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionEnvelope {
    #[serde(flatten)]
    pub action: PlayerAction,
    pub player_id: Uuid,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum PlayerAction {
    Join { name: String },
    Leave,
    Ready { is_ready: bool },
    Answer(AnswerPayload),
    ClaimHost { term: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub question_id: String,
    pub answer: String,
    pub time_spent: u32,
    pub is_correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// First frame a websocket client must send to associate with a game channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "messageType", content = "payload")]
pub enum ClientHello {
    ConnectToGame {
        game_id: Uuid,
        player_id: Uuid,
        name: String,
    },
}

/// Out-of-band messages from the relay itself (not game traffic).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "messageType", content = "payload")]
pub enum SystemMessage {
    SystemError { message: String },
}

impl SystemMessage {
    pub fn to_ws_text(&self) -> Result<axum::extract::ws::Message, serde_json::Error> {
        serde_json::to_string(self)
            .map(|json_string| axum::extract::ws::Message::Text(json_string.into()))
    }
}

pub fn wire_message_from_text(text: &str) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn client_hello_from_text(text: &str) -> Result<ClientHello, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_envelope_round_trips_with_flat_tag() {
        let envelope = ActionEnvelope {
            action: PlayerAction::Ready { is_ready: true },
            player_id: Uuid::new_v4(),
            seq: 7,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["data"]["is_ready"], true);
        assert_eq!(json["seq"], 7);

        let back: ActionEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.action, PlayerAction::Ready { is_ready: true });
    }

    #[test]
    fn unknown_action_type_is_a_parse_error() {
        let raw = r#"{
            "messageType": "PlayerAction",
            "payload": {
                "type": "Teleport",
                "payload": {},
                "player_id": "6dfc1c80-44ae-4326-9e8b-30e5e4897b7f",
                "seq": 1,
                "timestamp": "2026-01-01T00:00:00Z"
            }
        }"#;
        assert!(wire_message_from_text(raw).is_err());
    }

    #[test]
    fn action_without_player_id_is_a_parse_error() {
        let raw = r#"{
            "messageType": "PlayerAction",
            "payload": {
                "type": "Leave",
                "seq": 1,
                "timestamp": "2026-01-01T00:00:00Z"
            }
        }"#;
        assert!(wire_message_from_text(raw).is_err());
    }

    #[test]
    fn patch_omits_absent_fields() {
        let update = GameUpdate {
            patch: SessionPatch {
                time_remaining: Some(12),
                ..SessionPatch::default()
            },
            player_id: Uuid::new_v4(),
            seq: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["time_remaining"], 12);
        assert!(json.get("status").is_none());
        assert!(json.get("players").is_none());
    }
}
