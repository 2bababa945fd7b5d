use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named, prompt-defined conversational identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub prompt: String,
    /// Used for fallback relevance matching when no remote scorer answers.
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Who produced a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "bot" => Ok(Role::Bot),
            other => anyhow::bail!("unknown memory role: {other}"),
        }
    }
}

/// One line of a persona's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MemoryEntry {
    /// Create an entry stamped with the current time.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(Role::Bot, text)
    }
}

/// A message in a specific chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Normalized incoming text message from the messaging platform.
#[derive(Debug, Clone)]
pub struct InboundText {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub text: String,
    /// Message id (in the same chat) this message replies to, if any.
    pub reply_to: Option<i64>,
}

/// A press on an inline keyboard button.
#[derive(Debug, Clone)]
pub struct ButtonPress {
    pub callback_id: String,
    pub chat_id: Option<i64>,
    pub sender_id: i64,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Text(InboundText),
    Button(ButtonPress),
}

/// An inline keyboard button: visible label plus opaque callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}
