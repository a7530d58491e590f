use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::chat::{Conversation, ConversationId, Message, NewMessage};
use crate::entity::ParticipantId;
use crate::error::ChatError;
use crate::store::remote::{CreateConversationBody, ErrorBody, MESSAGES_EVENT};
use crate::store::ChatStore;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::ConversationNotFound(_)) => StatusCode::NOT_FOUND,
            Some(
                ChatError::EmptyMessage
                | ChatError::InvalidParticipant(_)
                | ChatError::InvalidRequest(_),
            ) => StatusCode::BAD_REQUEST,
            Some(ChatError::Remote { .. }) => StatusCode::BAD_GATEWAY,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {:#}", self.0);
        } else {
            debug!("Request rejected ({}): {:#}", status, self.0);
        }

        let body = ErrorBody {
            error: format!("{:#}", self.0),
        };
        (status, Json(body)).into_response()
    }
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

pub struct ApiState {
    pub store: Arc<dyn ChatStore>,
}

pub struct ApiServer {
    store: Arc<dyn ChatStore>,
}

impl ApiServer {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ApiState {
            store: self.store.clone(),
        });

        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/conversations", post(create_conversation))
            .route(
                "/participants/:participant/conversations",
                get(list_conversations),
            )
            .route(
                "/conversations/:id/messages",
                get(list_messages).post(append_message),
            )
            .route("/conversations/:id/stream", get(stream_messages))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

async fn create_conversation(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateConversationBody>,
) -> Result<Json<Conversation>, ApiError> {
    let [a, b] = body.participants;
    let a = ParticipantId::parse(a.as_str())?;
    let b = ParticipantId::parse(b.as_str())?;

    let conversation = state.store.create_conversation([a, b]).await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<Arc<ApiState>>,
    Path(participant): Path<String>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let participant = ParticipantId::parse(&participant)?;
    let conversations = state.store.conversations_with(&participant).await?;
    Ok(Json(conversations))
}

async fn list_messages(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state.store.messages(&ConversationId::new(id)).await?;
    Ok(Json(messages))
}

async fn append_message(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(message): Json<NewMessage>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    if message.sender_id.is_empty() {
        return Err(ChatError::InvalidParticipant(message.sender_id.to_string()).into());
    }
    let saved = state
        .store
        .append_message(&ConversationId::new(id), message)
        .await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn stream_messages(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation_id = ConversationId::new(id);
    // Only the newest list matters, so a slow client skips intermediate ones.
    let (tx, mut rx) = watch::channel::<Option<Vec<Message>>>(None);

    let subscription = state
        .store
        .subscribe(
            &conversation_id,
            Box::new(move |messages| {
                tx.send_replace(Some(messages));
            }),
        )
        .await?;

    info!("New message stream for {}", conversation_id);

    let stream = async_stream::stream! {
        // Dropped with the stream when the client disconnects.
        let _subscription = subscription;

        while rx.changed().await.is_ok() {
            let Some(messages) = rx.borrow_and_update().clone() else {
                continue;
            };
            match Event::default().event(MESSAGES_EVENT).json_data(&messages) {
                Ok(event) => yield Ok(event),
                Err(e) => error!("Failed to encode message list: {}", e),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
