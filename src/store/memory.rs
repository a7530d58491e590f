use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::bus::{Event, EventBus};
use crate::chat::{next_timestamp, Conversation, ConversationId, Message, MessageId, NewMessage};
use crate::entity::{pair_key, ParticipantId};
use crate::error::ChatError;

use super::{spawn_bus_feed, ChatStore, OnUpdate, Subscription};

#[derive(Default)]
struct MemoryState {
    conversations: Vec<Conversation>,
    by_pair: HashMap<String, ConversationId>,
    logs: HashMap<ConversationId, Vec<Message>>,
}

/// Process-local store with the same semantics as `SqliteStore`.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    bus: Arc<EventBus>,
}

impl MemoryStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn conversations_with(&self, participant: &ParticipantId) -> Result<Vec<Conversation>> {
        let state = self.lock();
        Ok(state
            .conversations
            .iter()
            .filter(|c| c.includes(participant))
            .cloned()
            .collect())
    }

    async fn create_conversation(&self, participants: [ParticipantId; 2]) -> Result<Conversation> {
        let key = pair_key(&participants[0], &participants[1]);
        let conversation = {
            let mut state = self.lock();
            if let Some(existing) = state.by_pair.get(&key) {
                let existing = existing.clone();
                if let Some(found) = state.conversations.iter().find(|c| c.id == existing) {
                    return Ok(found.clone());
                }
            }

            let conversation = Conversation::new(participants);
            state.by_pair.insert(key, conversation.id.clone());
            state.logs.insert(conversation.id.clone(), Vec::new());
            state.conversations.push(conversation.clone());
            conversation
        };

        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message> {
        if message.text.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let saved = {
            let mut state = self.lock();
            let log = state
                .logs
                .get_mut(conversation_id)
                .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.clone()))?;

            let saved = Message {
                id: MessageId::generate(),
                conversation_id: conversation_id.clone(),
                sender_id: message.sender_id,
                text: message.text,
                timestamp: next_timestamp(log.last().map(|m| m.timestamp)),
            };
            log.push(saved.clone());
            saved
        };

        self.bus.publish(Event::MessageAppended(saved.clone()));
        Ok(saved)
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let state = self.lock();
        state
            .logs
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.clone()).into())
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_update: OnUpdate,
    ) -> Result<Subscription> {
        let events = self.bus.subscribe();
        let initial = self.messages(conversation_id).await?;

        let store = self.clone();
        let id = conversation_id.clone();
        let fetch = move || {
            let store = store.clone();
            let id = id.clone();
            async move { store.messages(&id).await }
        };

        Ok(spawn_bus_feed(
            conversation_id.clone(),
            events,
            initial,
            fetch,
            on_update,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_pair_resolves_to_one_record() {
        let store = MemoryStore::default();
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");

        let first = store.create_conversation([a.clone(), b.clone()]).await.unwrap();
        let second = store.create_conversation([b, a.clone()]).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.conversations_with(&a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timestamps_never_decrease() {
        let store = MemoryStore::default();
        let conv = store
            .create_conversation([ParticipantId::new("a"), ParticipantId::new("b")])
            .await
            .unwrap();

        for n in 0..20 {
            store
                .append_message(&conv.id, NewMessage::new(ParticipantId::new("a"), n.to_string()))
                .await
                .unwrap();
        }

        let log = store.messages(&conv.id).await.unwrap();
        assert_eq!(log.len(), 20);
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(log[19].text, "19");
    }

    #[tokio::test]
    async fn unknown_conversation_is_reported() {
        let store = MemoryStore::default();
        let err = store
            .messages(&ConversationId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatError>(),
            Some(ChatError::ConversationNotFound(_))
        ));
    }
}
