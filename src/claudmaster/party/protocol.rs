//! Wire-format DTOs for Party Mode (engine <-> browser).
//!
//! This module defines the HTTP and WebSocket message shapes and is
//! intentionally free of transport logic so the server layer stays thin.
//! WebSocket messages are JSON objects discriminated by a `type` field.

use crate::claudmaster::permissions::Role;
use crate::claudmaster::session::ActionSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A connected (or connectable) human client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
    /// Bound character; required for players.
    pub character_id: Option<String>,
    /// Bearer token. A player's token equals their character id; the observer
    /// token is the fixed string `OBSERVER`.
    pub token: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn player(id: impl Into<String>, character_id: impl Into<String>) -> Self {
        let character_id = character_id.into();
        Self {
            id: id.into(),
            role: Role::Player,
            token: character_id.clone(),
            character_id: Some(character_id),
            last_heartbeat: None,
        }
    }

    pub fn dm(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Dm,
            character_id: None,
            token: token.into(),
            last_heartbeat: None,
        }
    }

    pub fn observer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Observer,
            character_id: None,
            token: "OBSERVER".to_string(),
            last_heartbeat: None,
        }
    }
}

/// Queue status of a submitted action. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Processing,
    Resolved,
    Rejected,
}

impl ActionStatus {
    /// Rank used to enforce monotonic advancement in the JSONL log.
    pub fn rank(self) -> u8 {
        match self {
            ActionStatus::Queued => 0,
            ActionStatus::Processing => 1,
            ActionStatus::Resolved => 2,
            // Rejected is terminal like Resolved.
            ActionStatus::Rejected => 2,
        }
    }
}

/// One submitted player action, as logged to `party/actions.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyAction {
    pub id: String,
    pub participant_id: String,
    pub text: String,
    pub source: ActionSource,
    pub status: ActionStatus,
    pub submitted_at: DateTime<Utc>,
}

/// One published response, as logged to `party/responses.jsonl`.
///
/// Stored unfiltered; the output filter projects it per recipient at
/// delivery time, including on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyResponse {
    pub id: String,
    pub action_id: String,
    pub public: Option<String>,
    /// participant id -> private text.
    #[serde(default)]
    pub private_by_recipient: BTreeMap<String, String>,
    pub dm_only: Option<String>,
    pub produced_at: DateTime<Utc>,
}

/// Messages the server pushes to a connected participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message after a successful join.
    Connected {
        participant_id: String,
        role: Role,
        /// Sequence the replay started from.
        resume_from: u64,
    },
    Narrative {
        action_id: Option<String>,
        text: String,
    },
    Private {
        text: String,
    },
    CharacterUpdate {
        character_id: String,
        record: serde_json::Value,
    },
    CombatState {
        active: bool,
        current_turn: Option<String>,
        order: Vec<String>,
    },
    ActionStatus {
        action_id: String,
        status: ActionStatus,
        reason: Option<String>,
    },
    System {
        text: String,
    },
    Audio {
        format: String,
        sample_rate: u32,
        sequence: u32,
        total_chunks: u32,
        duration_ms: u64,
        /// Base64-encoded chunk bytes.
        data: String,
    },
    Ping,
    Pong,
}

impl ServerMessage {
    /// Non-critical messages may be coalesced under backpressure; narrative
    /// and private messages never are.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            ServerMessage::CombatState { .. } | ServerMessage::Ping | ServerMessage::Pong
        )
    }

    /// Coalescing key: a newer message replaces an older queued one with the
    /// same key.
    pub fn coalesce_key(&self) -> Option<&'static str> {
        match self {
            ServerMessage::CombatState { .. } => Some("combat_state"),
            _ => None,
        }
    }
}

/// Messages a client may send over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    /// Request replay of everything after `last_acked_seq`.
    HistoryRequest { last_acked_seq: u64 },
}

/// A server message wrapped with its delivery bookkeeping.
///
/// `seq` orders messages per session; `message_id` lets clients drop
/// duplicates across the at-least-once replay boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub message_id: String,
    #[serde(flatten)]
    pub message: ServerMessage,
}

/// `POST /action` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitActionRequest {
    pub action: String,
    #[serde(default)]
    pub source: Option<ActionSource>,
}

/// `POST /action` response body.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /private` request body (DM only).
#[derive(Debug, Clone, Deserialize)]
pub struct PrivateMessageRequest {
    pub to: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_discriminate_by_type() {
        let msg = ServerMessage::ActionStatus {
            action_id: "a1".into(),
            status: ActionStatus::Rejected,
            reason: Some("not your turn".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "action_status");
        assert_eq!(json["status"], "rejected");

        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn envelope_flattens_the_payload() {
        let envelope = Envelope {
            seq: 7,
            message_id: "m-7".into(),
            message: ServerMessage::Narrative {
                action_id: None,
                text: "The door creaks open.".into(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "narrative");
    }

    #[test]
    fn status_rank_is_monotonic() {
        assert!(ActionStatus::Queued.rank() < ActionStatus::Processing.rank());
        assert!(ActionStatus::Processing.rank() < ActionStatus::Resolved.rank());
        assert_eq!(ActionStatus::Resolved.rank(), ActionStatus::Rejected.rank());
    }
}
