use thiserror::Error;

use crate::chat::ConversationId;

/// Failures a caller needs to tell apart. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation {0} does not exist")]
    ConversationNotFound(ConversationId),

    #[error("message text must not be empty")]
    EmptyMessage,

    #[error("participant id '{0}' is invalid")]
    InvalidParticipant(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("chat server answered {status}: {message}")]
    Remote { status: u16, message: String },
}
