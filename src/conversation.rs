//! Store-facing chat operations: find-or-create a conversation for a pair,
//! append to its log, and attach a live feed of the log.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::chat::{ConversationId, NewMessage};
use crate::entity::{pair_key, ParticipantId};
use crate::error::ChatError;
use crate::store::{ChatStore, OnUpdate, Subscription};

/// Returns the id of the conversation shared by `a` and `b`, creating it on
/// first contact. Sequential calls for the same unordered pair return the
/// same id. `a == b` resolves to a conversation whose participants are both
/// `a`, never to one of `a`'s conversations with someone else.
pub async fn resolve_conversation(
    store: &dyn ChatStore,
    a: &ParticipantId,
    b: &ParticipantId,
) -> Result<ConversationId> {
    for participant in [a, b] {
        if participant.is_empty() {
            return Err(ChatError::InvalidParticipant(participant.to_string()).into());
        }
    }

    let candidates = store
        .conversations_with(a)
        .await
        .with_context(|| format!("Failed to look up conversations of {}", a))?;

    let key = pair_key(a, b);
    let existing = candidates
        .into_iter()
        .find(|c| pair_key(&c.participants[0], &c.participants[1]) == key);

    if let Some(existing) = existing {
        debug!("Found conversation {} for {} and {}", existing.id, a, b);
        return Ok(existing.id);
    }

    let created = store
        .create_conversation([a.clone(), b.clone()])
        .await
        .with_context(|| format!("Failed to create conversation for {} and {}", a, b))?;

    info!("Resolved new conversation {} for {} and {}", created.id, a, b);
    Ok(created.id)
}

/// Appends one message. The created message is not returned; subscribers see
/// it through their feed.
pub async fn publish_message(
    store: &dyn ChatStore,
    conversation_id: &ConversationId,
    sender_id: &ParticipantId,
    text: &str,
) -> Result<()> {
    store
        .append_message(conversation_id, NewMessage::new(sender_id.clone(), text))
        .await
        .with_context(|| format!("Failed to publish message to {}", conversation_id))?;
    Ok(())
}

pub async fn subscribe(
    store: &dyn ChatStore,
    conversation_id: &ConversationId,
    on_update: OnUpdate,
) -> Result<Subscription> {
    store
        .subscribe(conversation_id, on_update)
        .await
        .with_context(|| format!("Failed to subscribe to {}", conversation_id))
}
