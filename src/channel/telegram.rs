use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{SendOptions, Transport};
use crate::dispatch::Dispatcher;
use crate::types::{Button, ButtonPress, InboundEvent, InboundText, MessageRef};

/// Telegram rejects messages longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Bot API client over plain HTTPS.
pub struct TelegramClient {
    http: Client,
    api: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self::with_api_base("https://api.telegram.org", token)
    }

    /// Point at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(base: &str, token: &str) -> Self {
        Self {
            http: Client::new(),
            api: format!("{}/bot{token}", base.trim_end_matches('/')),
        }
    }

    /// Call a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let response: serde_json::Value = self
            .http
            .post(format!("{}/{method}", self.api))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{method} request failed: {e}"))?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("{method} returned unparseable body: {e}"))?;

        if response.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let description = response
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            anyhow::bail!("{method} failed: {description}");
        }
        Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// The bot's own username, without the leading `@`.
    pub async fn get_me(&self) -> anyhow::Result<String> {
        let me = self.call("getMe", serde_json::json!({})).await?;
        me.get("username")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("getMe response has no username"))
    }

    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let result = self
            .call(
                "getUpdates",
                serde_json::json!({
                    "offset": offset,
                    "timeout": timeout_secs,
                    "allowed_updates": ["message", "callback_query"],
                }),
            )
            .await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> anyhow::Result<()> {
        let mut body = serde_json::json!({
            "url": url,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(secret) = secret_token {
            body["secret_token"] = serde_json::json!(secret);
        }
        self.call("setWebhook", body).await?;
        info!(url, "registered telegram webhook");
        Ok(())
    }

    /// Polling and webhooks are mutually exclusive on Telegram's side.
    pub async fn delete_webhook(&self) -> anyhow::Result<()> {
        self.call("deleteWebhook", serde_json::json!({})).await?;
        Ok(())
    }

    async fn send_message(&self, body: serde_json::Value) -> anyhow::Result<MessageRef> {
        let sent = self.call("sendMessage", body).await?;
        message_ref(&sent).ok_or_else(|| anyhow::anyhow!("sendMessage returned no message id"))
    }
}

fn message_ref(message: &serde_json::Value) -> Option<MessageRef> {
    Some(MessageRef {
        chat_id: message.pointer("/chat/id")?.as_i64()?,
        message_id: message.get("message_id")?.as_i64()?,
    })
}

/// Split text into chunks Telegram will accept, on char boundaries.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> anyhow::Result<MessageRef> {
        let chunks = split_message(text, MAX_MESSAGE_CHARS);
        let last = chunks.len() - 1;
        let mut sent = None;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut body = serde_json::json!({ "chat_id": chat_id, "text": chunk });
            if opts.force_reply && i == last {
                body["reply_markup"] = serde_json::json!({ "force_reply": true });
            }
            sent = Some(self.send_message(body).await?);
        }
        sent.ok_or_else(|| anyhow::anyhow!("nothing to send"))
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> anyhow::Result<MessageRef> {
        let keyboard: Vec<Vec<serde_json::Value>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|b| serde_json::json!({ "text": b.label, "callback_data": b.payload }))
                    .collect()
            })
            .collect();

        self.send_message(serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": { "inline_keyboard": keyboard },
        }))
        .await
    }

    async fn send_private(
        &self,
        user_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> anyhow::Result<MessageRef> {
        // A user's private chat id is their user id.
        self.send_text(user_id, text, opts).await
    }

    async fn indicate_typing(&self, chat_id: i64) -> anyhow::Result<()> {
        self.call(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await?;
        Ok(())
    }

    async fn answer_button(&self, callback_id: &str, alert: Option<&str>) -> anyhow::Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = alert {
            body["text"] = serde_json::json!(text);
            body["show_alert"] = serde_json::json!(true);
        }
        self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

/// Normalize a raw Bot API update. Returns `None` for update kinds the bot
/// does not handle (edits, stickers, channel posts, ...).
pub fn parse_update(update: &serde_json::Value) -> Option<InboundEvent> {
    if let Some(message) = update.get("message") {
        let text = message.get("text")?.as_str()?.to_string();
        let from = message.get("from");
        let sender_name = from
            .and_then(|f| f.get("username").or_else(|| f.get("first_name")))
            .and_then(|v| v.as_str())
            .unwrap_or("user")
            .to_string();

        return Some(InboundEvent::Text(InboundText {
            chat_id: message.pointer("/chat/id")?.as_i64()?,
            message_id: message.get("message_id")?.as_i64()?,
            sender_id: from.and_then(|f| f.get("id")).and_then(|v| v.as_i64())?,
            sender_name,
            text,
            reply_to: message
                .pointer("/reply_to_message/message_id")
                .and_then(|v| v.as_i64()),
        }));
    }

    if let Some(query) = update.get("callback_query") {
        return Some(InboundEvent::Button(ButtonPress {
            callback_id: query.get("id")?.as_str()?.to_string(),
            chat_id: query.pointer("/message/chat/id").and_then(|v| v.as_i64()),
            sender_id: query.pointer("/from/id")?.as_i64()?,
            payload: query
                .get("data")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }));
    }

    None
}

/// Long-poll `getUpdates` until cancelled, handing each update to the
/// dispatcher on its own task.
pub async fn run_polling(
    client: Arc<TelegramClient>,
    dispatcher: Arc<Dispatcher>,
    poll_timeout_secs: u64,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut offset: i64 = 0;
    info!(poll_timeout_secs, "telegram polling started");

    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.get_updates(offset, poll_timeout_secs) => result,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!("telegram poll failed, retrying: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        for update in &updates {
            if let Some(id) = update.get("update_id").and_then(|v| v.as_i64()) {
                offset = offset.max(id + 1);
            }
            if let Some(event) = parse_update(update) {
                dispatcher.spawn_event(event);
            }
        }
    }

    info!("telegram polling stopped");
    Ok(())
}
