use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chat::{ConversationId, Message};
use crate::conversation::{publish_message, resolve_conversation, subscribe};
use crate::entity::ParticipantId;
use crate::store::{ChatStore, OnUpdate, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No participants bound yet
    Idle,
    /// Looking up or creating the conversation; sending is disabled
    Resolving,
    /// Subscribed to the conversation's log
    Active,
    /// Detached; terminal
    Closed,
}

/// What a UI renders from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub state: SessionState,
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

struct SessionInner {
    state: SessionState,
    me: Option<ParticipantId>,
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    draft: String,
    subscription: Option<Subscription>,
}

impl SessionInner {
    /// Messages become visible with the transition to `Active`; a snapshot
    /// that arrives while still attaching is held back until then.
    fn visible_messages(&self) -> Vec<Message> {
        match self.state {
            SessionState::Idle | SessionState::Resolving => Vec::new(),
            SessionState::Active | SessionState::Closed => self.messages.clone(),
        }
    }

    fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            conversation_id: self.conversation_id.clone(),
            messages: self.visible_messages(),
        }
    }
}

/// Drives one participant's side of a direct conversation.
///
/// Sent messages are never inserted locally: the message list only ever
/// changes through the live feed, so the store stays the single source of
/// truth and a message cannot render twice.
pub struct ChatSession {
    store: Arc<dyn ChatStore>,
    inner: Arc<Mutex<SessionInner>>,
    view: Arc<watch::Sender<SessionView>>,
}

impl ChatSession {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        let inner = SessionInner {
            state: SessionState::Idle,
            me: None,
            conversation_id: None,
            messages: Vec::new(),
            draft: String::new(),
            subscription: None,
        };
        let (view, _rx) = watch::channel(inner.view());
        Self {
            store,
            inner: Arc::new(Mutex::new(inner)),
            view: Arc::new(view),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        lock_inner(&self.inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.lock().conversation_id.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().visible_messages()
    }

    /// Receiver that changes on every state transition and, once `Active`,
    /// every delivered message list.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    /// Binds the participants, resolves their conversation and attaches the
    /// live feed. Failures are logged and leave the session in `Resolving`.
    pub async fn open(&self, me: ParticipantId, peer: ParticipantId) {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Idle {
                warn!("Ignoring open in state {:?}", inner.state);
                return;
            }
            inner.state = SessionState::Resolving;
            inner.me = Some(me.clone());
            self.view.send_replace(inner.view());
        }

        let conversation_id = match resolve_conversation(self.store.as_ref(), &me, &peer).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to open chat between {} and {}: {:#}", me, peer, e);
                return;
            }
        };

        if self.state() == SessionState::Closed {
            debug!("Session closed while resolving, discarding {}", conversation_id);
            return;
        }

        let subscription =
            match subscribe(self.store.as_ref(), &conversation_id, self.feed_callback()).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("Failed to attach to {}: {:#}", conversation_id, e);
                    return;
                }
            };

        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            drop(inner);
            subscription.unsubscribe();
            debug!("Session closed while attaching, detached {}", conversation_id);
            return;
        }

        info!("Chat between {} and {} active on {}", me, peer, conversation_id);
        inner.conversation_id = Some(conversation_id);
        inner.subscription = Some(subscription);
        inner.state = SessionState::Active;
        self.view.send_replace(inner.view());
    }

    fn feed_callback(&self) -> OnUpdate {
        let inner: Weak<Mutex<SessionInner>> = Arc::downgrade(&self.inner);
        let view = self.view.clone();
        Box::new(move |messages| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = lock_inner(&inner);
            match inner.state {
                SessionState::Closed => {}
                SessionState::Active => {
                    inner.messages = messages;
                    view.send_replace(inner.view());
                }
                SessionState::Idle | SessionState::Resolving => inner.messages = messages,
            }
        })
    }

    pub fn update_draft(&self, text: impl Into<String>) {
        self.lock().draft = text.into();
    }

    pub fn draft(&self) -> String {
        self.lock().draft.clone()
    }

    pub fn can_send(&self) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Active && !inner.draft.trim().is_empty()
    }

    /// Publishes the trimmed draft. Returns whether a message was published.
    pub async fn send(&self) -> bool {
        let (conversation_id, me, text) = {
            let inner = self.lock();
            if inner.state != SessionState::Active {
                debug!("Ignoring send in state {:?}", inner.state);
                return false;
            }
            let text = inner.draft.trim();
            if text.is_empty() {
                return false;
            }
            match (&inner.conversation_id, &inner.me) {
                (Some(id), Some(me)) => (id.clone(), me.clone(), text.to_string()),
                _ => return false,
            }
        };

        match publish_message(self.store.as_ref(), &conversation_id, &me, &text).await {
            Ok(()) => {
                let mut inner = self.lock();
                // Keep anything typed while the send was in flight.
                if inner.draft.trim() == text {
                    inner.draft.clear();
                }
                true
            }
            Err(e) => {
                error!("Failed to send message: {:#}", e);
                false
            }
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.update_draft(text);
        self.send().await
    }

    /// Detaches the feed. Idempotent; `Closed` is terminal.
    pub fn close(&self) {
        let subscription = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            self.view.send_replace(inner.view());
            inner.subscription.take()
        };

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        info!("Chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_inner(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
