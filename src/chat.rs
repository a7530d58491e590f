use crate::entity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_chat_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_chat_id!(ConversationId);
define_chat_id!(MessageId);

/// A pairing of exactly two participants that owns their shared message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [ParticipantId; 2],
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(participants: [ParticipantId; 2]) -> Self {
        Self {
            id: ConversationId::generate(),
            participants,
            created_at: Utc::now(),
        }
    }

    pub fn includes(&self, participant: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == participant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append payload; the store assigns the id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub sender_id: ParticipantId,
    pub text: String,
}

impl NewMessage {
    pub fn new(sender_id: ParticipantId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            text: text.into(),
        }
    }
}

/// Timestamp for the next append to a log whose newest entry is `last`.
/// Never goes backwards, even if the wall clock does.
pub fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(last) if last > now => last,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn message_serializes_with_camel_case_fields() {
        let msg = Message {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("c1"),
            sender_id: ParticipantId::new("alice"),
            text: "hello".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["text"], "hello");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn next_timestamp_does_not_regress() {
        let future = Utc::now() + Duration::seconds(60);
        assert_eq!(next_timestamp(Some(future)), future);

        let past = Utc::now() - Duration::seconds(60);
        assert!(next_timestamp(Some(past)) > past);
    }

    #[test]
    fn includes_matches_either_side() {
        let conv = Conversation::new([ParticipantId::new("a"), ParticipantId::new("b")]);
        assert!(conv.includes(&ParticipantId::new("a")));
        assert!(conv.includes(&ParticipantId::new("b")));
        assert!(!conv.includes(&ParticipantId::new("c")));
    }
}
