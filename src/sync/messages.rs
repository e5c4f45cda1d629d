use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Full snapshot, sent on join and whenever the toggle flips. `enabled`
    /// is only present when the sender just wrote the toggle itself; a
    /// joining context must never impose its view of the toggle.
    StateSync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enabled: Option<bool>,
        revealed: Vec<String>,
    },
    ModeChanged {
        enabled: bool,
    },
    IqRevealed {
        #[serde(rename = "itemId")]
        item_id: String,
    },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::StateSync { .. } => "state_sync",
            SyncMessage::ModeChanged { .. } => "mode_changed",
            SyncMessage::IqRevealed { .. } => "iq_revealed",
        }
    }
}

/// What actually travels between contexts. The nonce keeps two identical
/// messages distinct so a storage write always registers as a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub origin: Uuid,
    pub nonce: Uuid,
    pub sent_at: DateTime<Utc>,
    pub message: SyncMessage,
}

impl Envelope {
    pub fn new(origin: Uuid, message: SyncMessage) -> Self {
        Self {
            origin,
            nonce: Uuid::new_v4(),
            sent_at: Utc::now(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_snake_case_tags() {
        let value = serde_json::to_value(SyncMessage::IqRevealed {
            item_id: "post-9".into(),
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "iq_revealed", "itemId": "post-9" }));

        let parsed: SyncMessage =
            serde_json::from_value(json!({ "type": "mode_changed", "enabled": true })).unwrap();
        assert_eq!(parsed, SyncMessage::ModeChanged { enabled: true });
    }

    #[test]
    fn join_snapshot_carries_no_toggle() {
        let value = serde_json::to_value(SyncMessage::StateSync {
            enabled: None,
            revealed: vec!["post-1".into()],
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "state_sync", "revealed": ["post-1"] }));

        let parsed: SyncMessage = serde_json::from_value(
            json!({ "type": "state_sync", "enabled": true, "revealed": [] }),
        )
        .unwrap();
        assert_eq!(
            parsed,
            SyncMessage::StateSync {
                enabled: Some(true),
                revealed: vec![],
            }
        );
    }

    #[test]
    fn envelopes_with_same_message_differ() {
        let origin = Uuid::new_v4();
        let message = SyncMessage::ModeChanged { enabled: false };
        assert_ne!(
            Envelope::new(origin, message.clone()),
            Envelope::new(origin, message)
        );
    }
}
