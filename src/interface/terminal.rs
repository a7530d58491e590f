use crate::{
    chat::Message,
    entity::ParticipantId,
    session::{ChatSession, SessionState},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub const QUIT_COMMAND: &str = "/quit";

/// Line-oriented chat client: stdin lines become messages, the live
/// conversation is echoed to stdout.
pub struct TerminalInterface {
    session: Arc<ChatSession>,
    me: ParticipantId,
    peer: ParticipantId,
}

impl TerminalInterface {
    pub fn new(session: Arc<ChatSession>, me: ParticipantId, peer: ParticipantId) -> Self {
        Self { session, me, peer }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut view = self.session.watch();
        let me = self.me.clone();

        let printer = tokio::spawn(async move {
            let mut printed = 0;
            loop {
                let current = view.borrow_and_update().clone();
                for message in current.messages.iter().skip(printed) {
                    println!("{}", render_line(message, &me));
                }
                printed = printed.max(current.messages.len());

                if current.state == SessionState::Closed || view.changed().await.is_err() {
                    break;
                }
            }
        });

        info!("Opening chat between {} and {}...", self.me, self.peer);
        self.session.open(self.me.clone(), self.peer.clone()).await;

        if self.session.state() != SessionState::Active {
            self.session.close();
            printer.abort();
            anyhow::bail!("Could not open a chat with {}", self.peer);
        }

        println!("Chatting with {}. Type {} to leave.", self.peer, QUIT_COMMAND);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim() == QUIT_COMMAND {
                break;
            }
            self.session.update_draft(line);
            if !self.session.can_send() {
                continue;
            }
            if !self.session.send().await {
                warn!("Message was not delivered");
            }
        }

        self.session.close();
        let _ = printer.await;
        Ok(())
    }
}

fn render_line(message: &Message, me: &ParticipantId) -> String {
    let who = if &message.sender_id == me {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        who,
        message.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ConversationId, MessageId};
    use chrono::{TimeZone, Utc};

    fn message(sender: &str, text: &str) -> Message {
        Message {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("c1"),
            sender_id: ParticipantId::new(sender),
            text: text.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 5).unwrap(),
        }
    }

    #[test]
    fn own_messages_render_as_you() {
        let me = ParticipantId::new("alice");
        assert_eq!(
            render_line(&message("alice", "hello"), &me),
            "[18:30:05] you: hello"
        );
        assert_eq!(
            render_line(&message("bob", "hi"), &me),
            "[18:30:05] bob: hi"
        );
    }
}
