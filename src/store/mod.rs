//! The realtime document store that hosts conversations and their message
//! logs, and the live feed that pushes ordered snapshots to subscribers.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::Event;
use crate::chat::{Conversation, ConversationId, Message, NewMessage};
use crate::entity::ParticipantId;

pub mod memory;
pub mod remote;
pub mod sqlite;

pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

/// Callback invoked with the full ordered message list of a conversation.
pub type OnUpdate = Box<dyn FnMut(Vec<Message>) + Send + 'static>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All conversations whose participant list contains `participant`.
    async fn conversations_with(&self, participant: &ParticipantId) -> Result<Vec<Conversation>>;

    /// Creates a conversation for the pair, or returns the one that already
    /// exists for the same unordered pair.
    async fn create_conversation(&self, participants: [ParticipantId; 2]) -> Result<Conversation>;

    /// Appends a message with a store-assigned id and timestamp.
    async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message>;

    /// Snapshot of the log, ascending by timestamp then insertion order.
    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    /// Attaches a live feed: `on_update` receives the current list right away
    /// and the full updated list after every append, until unsubscribed.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_update: OnUpdate,
    ) -> Result<Subscription>;
}

/// Detach flag shared by a `Subscription` and its `FeedSink`. Deliveries
/// run while the flag is locked, so once `detach` returns no callback is
/// running and none will start.
#[derive(Default)]
pub(crate) struct FeedGate {
    detached: Mutex<bool>,
}

impl FeedGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.detached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` if the gate was already detached.
    fn detach(&self) -> bool {
        let mut detached = self.lock();
        !std::mem::replace(&mut *detached, true)
    }
}

/// Handle to a live feed. Dropping it detaches the feed.
pub struct Subscription {
    conversation_id: ConversationId,
    gate: Arc<FeedGate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(
        conversation_id: ConversationId,
        gate: Arc<FeedGate>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            conversation_id,
            gate,
            task: Mutex::new(Some(task)),
        }
    }

    /// Detaches the feed. Safe to call any number of times, including after
    /// the feed task has already finished. Waits for an in-flight delivery,
    /// so it must not be called from the feed's own `on_update`.
    pub fn unsubscribe(&self) {
        if !self.gate.detach() {
            return;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        debug!("Unsubscribed from conversation {}", self.conversation_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Delivery end of a feed. Suppresses deliveries after detachment and any
/// snapshot that is not newer than the last one delivered.
pub(crate) struct FeedSink {
    gate: Arc<FeedGate>,
    delivered: Option<usize>,
    on_update: OnUpdate,
}

impl FeedSink {
    pub(crate) fn new(gate: Arc<FeedGate>, on_update: OnUpdate) -> Self {
        Self {
            gate,
            delivered: None,
            on_update,
        }
    }

    /// Returns `false` once the feed is detached.
    pub(crate) fn deliver(&mut self, messages: Vec<Message>) -> bool {
        let detached = self.gate.lock();
        if *detached {
            return false;
        }
        // The log is append-only, so a snapshot is newer iff it is longer.
        if matches!(self.delivered, Some(len) if messages.len() <= len) {
            return true;
        }
        self.delivered = Some(messages.len());
        (self.on_update)(messages);
        true
    }
}

/// Runs a feed for stores whose changes are announced on an `EventBus`.
///
/// `events` must be subscribed before `initial` was read so that no append
/// in between goes unnoticed.
pub(crate) fn spawn_bus_feed<F, Fut>(
    conversation_id: ConversationId,
    mut events: broadcast::Receiver<Event>,
    initial: Vec<Message>,
    fetch: F,
    on_update: OnUpdate,
) -> Subscription
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<Message>>> + Send + 'static,
{
    let gate = Arc::new(FeedGate::default());
    let mut sink = FeedSink::new(gate.clone(), on_update);
    let id = conversation_id.clone();

    let task = tokio::spawn(async move {
        if !sink.deliver(initial) {
            return;
        }
        loop {
            match events.recv().await {
                Ok(Event::MessageAppended(message)) if message.conversation_id == id => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Feed for {} lagged by {} events, refreshing", id, skipped);
                }
                Err(RecvError::Closed) => break,
            }

            match fetch().await {
                Ok(messages) => {
                    if !sink.deliver(messages) {
                        break;
                    }
                }
                Err(e) => error!("Failed to refresh messages for {}: {:#}", id, e),
            }
        }
        debug!("Feed task for {} finished", id);
    });

    Subscription::new(conversation_id, gate, task)
}
