use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ChatError;

/// Opaque identifier of a chat participant (a neighborhood user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Like `new`, but rejects empty or whitespace-only ids.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidParticipant(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Order-insensitive key for an unordered pair of participants.
///
/// The two ids are sorted and joined with a NUL byte, which cannot appear in
/// the ids handed out by the user directory.
pub fn pair_key(a: &ParticipantId, b: &ParticipantId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}\u{0}{}", low.as_str(), high.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_ids() {
        assert!(ParticipantId::parse("").is_err());
        assert!(ParticipantId::parse("   ").is_err());
        assert_eq!(ParticipantId::parse(" alice ").unwrap().as_str(), "alice");
    }

    #[test]
    fn pair_key_ignores_order() {
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
        assert_ne!(pair_key(&a, &a), pair_key(&a, &b));
    }
}
