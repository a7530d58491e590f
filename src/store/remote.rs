use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::chat::{Conversation, ConversationId, Message, NewMessage};
use crate::entity::ParticipantId;
use crate::error::ChatError;

use super::{ChatStore, FeedGate, FeedSink, OnUpdate, Subscription};

/// Name of the server-sent event that carries a message list.
pub const MESSAGES_EVENT: &str = "messages";

/// Client for a store served over HTTP by `neighborly serve`.
#[derive(Clone)]
pub struct RemoteStore {
    http: Client,
    base: Url,
}

#[derive(Serialize, Deserialize)]
pub struct CreateConversationBody {
    pub participants: [ParticipantId; 2],
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl RemoteStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid server URL {}", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Server URL {} cannot carry a path", base_url);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Server URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ChatStore for RemoteStore {
    async fn conversations_with(&self, participant: &ParticipantId) -> Result<Vec<Conversation>> {
        let url = self.endpoint(&["participants", participant.as_str(), "conversations"])?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to query conversations")?;
        Ok(check(resp, None).await?.json().await?)
    }

    async fn create_conversation(&self, participants: [ParticipantId; 2]) -> Result<Conversation> {
        let url = self.endpoint(&["conversations"])?;
        let resp = self
            .http
            .post(url)
            .json(&CreateConversationBody { participants })
            .send()
            .await
            .context("Failed to create conversation")?;
        Ok(check(resp, None).await?.json().await?)
    }

    async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let resp = self
            .http
            .post(url)
            .json(&message)
            .send()
            .await
            .context("Failed to send message")?;
        Ok(check(resp, Some(conversation_id)).await?.json().await?)
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to fetch messages")?;
        Ok(check(resp, Some(conversation_id)).await?.json().await?)
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_update: OnUpdate,
    ) -> Result<Subscription> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "stream"])?;
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .context("Failed to open message stream")?;
        let resp = check(resp, Some(conversation_id)).await?;

        info!("Message stream attached for {}", conversation_id);

        let gate = Arc::new(FeedGate::default());
        let mut sink = FeedSink::new(gate.clone(), on_update);
        let id = conversation_id.clone();

        let task = tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("Message stream for {} failed: {}", id, e);
                        return;
                    }
                };

                for frame in decoder.push(&chunk) {
                    if frame.event.as_deref() != Some(MESSAGES_EVENT) {
                        continue;
                    }
                    match serde_json::from_str::<Vec<Message>>(&frame.data) {
                        Ok(messages) => {
                            if !sink.deliver(messages) {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping malformed stream frame for {}: {}", id, e),
                    }
                }
            }
            debug!("Message stream for {} closed by server", id);
        });

        Ok(Subscription::new(conversation_id.clone(), gate, task))
    }
}

async fn check(resp: Response, conversation: Option<&ConversationId>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };

    let err = match (status.as_u16(), conversation) {
        (404, Some(id)) => ChatError::ConversationNotFound(id.clone()),
        (400, _) => ChatError::InvalidRequest(message),
        (status, _) => ChatError::Remote { status, message },
    };
    Err(err.into())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);

            let mut frame = SseFrame::default();
            let mut data_lines = Vec::new();
            for line in text.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "event" => frame.event = Some(value.to_string()),
                    "data" => data_lines.push(value),
                    _ => {}
                }
            }

            if data_lines.is_empty() {
                continue;
            }
            frame.data = data_lines.join("\n");
            frames.push(frame);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_frames_and_comments() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b":keep-alive\n\nevent: mess").is_empty());

        let frames = decoder.push(b"ages\ndata: [1,\ndata: 2]\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("messages".into()),
                data: "[1,\n2]".into(),
            }]
        );
    }

    #[test]
    fn decoder_accepts_crlf() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b"event: messages\r\ndata: []\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "[]");
    }

    #[test]
    fn endpoint_escapes_participant_ids() {
        let store = RemoteStore::new("http://localhost:3000/").unwrap();
        let url = store
            .endpoint(&["participants", "a b/c", "conversations"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/participants/a%20b%2Fc/conversations"
        );
    }
}
