pub mod telegram;

use async_trait::async_trait;

use crate::types::{Button, MessageRef};

/// Options for an outbound text message.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Ask the client to open a reply box pointed at this message.
    pub force_reply: bool,
}

impl SendOptions {
    pub fn force_reply() -> Self {
        Self { force_reply: true }
    }
}

/// Outbound surface of the messaging platform.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> anyhow::Result<MessageRef>;

    /// Send text with an inline keyboard, one inner `Vec` per row.
    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> anyhow::Result<MessageRef>;

    /// Message a user directly rather than in the chat they wrote from.
    async fn send_private(
        &self,
        user_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> anyhow::Result<MessageRef>;

    async fn indicate_typing(&self, chat_id: i64) -> anyhow::Result<()>;

    /// Acknowledge a button press, optionally showing an alert.
    async fn answer_button(&self, callback_id: &str, alert: Option<&str>) -> anyhow::Result<()>;
}
