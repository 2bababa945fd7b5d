#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use kaonasi::agent::providers::RemoteModel;
use kaonasi::channel::{SendOptions, Transport};
use kaonasi::config::RoutingConfig;
use kaonasi::dispatch::{DispatchSettings, Dispatcher};
use kaonasi::store::PersonaStore;
use kaonasi::types::{Button, InboundText, MemoryEntry, MessageRef, Persona};

pub const BOT_HANDLE: &str = "kaonasi_bot";

/// Everything the dispatcher pushed at the messaging platform.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text {
        chat_id: i64,
        message_id: i64,
        text: String,
        force_reply: bool,
    },
    Buttons {
        chat_id: i64,
        text: String,
        rows: Vec<Vec<Button>>,
    },
    Private {
        user_id: i64,
        message_id: i64,
        text: String,
    },
    Typing {
        chat_id: i64,
    },
    Answer {
        callback_id: String,
        alert: Option<String>,
    },
}

/// Transport double that records every call.
pub struct RecordingTransport {
    log: Mutex<Vec<Outbound>>,
    next_id: AtomicI64,
    fail_force_reply_in_chat: AtomicBool,
    fail_private: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            fail_force_reply_in_chat: AtomicBool::new(false),
            fail_private: AtomicBool::new(false),
        })
    }

    pub fn fail_force_reply_in_chat(&self) {
        self.fail_force_reply_in_chat.store(true, Ordering::SeqCst);
    }

    pub fn fail_private(&self) {
        self.fail_private.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Outbound> {
        self.log.lock().unwrap().clone()
    }

    /// Plain texts sent to `chat_id`, in order.
    pub fn texts(&self, chat_id: i64) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Text { chat_id: c, text, .. } if c == chat_id => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, outbound: Outbound) {
        self.log.lock().unwrap().push(outbound);
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: SendOptions,
    ) -> anyhow::Result<MessageRef> {
        if opts.force_reply && self.fail_force_reply_in_chat.load(Ordering::SeqCst) {
            anyhow::bail!("bot was blocked in this chat");
        }
        let message_id = self.next_id();
        self.record(Outbound::Text {
            chat_id,
            message_id,
            text: text.to_string(),
            force_reply: opts.force_reply,
        });
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> anyhow::Result<MessageRef> {
        self.record(Outbound::Buttons {
            chat_id,
            text: text.to_string(),
            rows: rows.to_vec(),
        });
        Ok(MessageRef {
            chat_id,
            message_id: self.next_id(),
        })
    }

    async fn send_private(
        &self,
        user_id: i64,
        text: &str,
        _opts: SendOptions,
    ) -> anyhow::Result<MessageRef> {
        if self.fail_private.load(Ordering::SeqCst) {
            anyhow::bail!("user has not started a private chat");
        }
        let message_id = self.next_id();
        self.record(Outbound::Private {
            user_id,
            message_id,
            text: text.to_string(),
        });
        Ok(MessageRef {
            chat_id: user_id,
            message_id,
        })
    }

    async fn indicate_typing(&self, chat_id: i64) -> anyhow::Result<()> {
        self.record(Outbound::Typing { chat_id });
        Ok(())
    }

    async fn answer_button(&self, callback_id: &str, alert: Option<&str>) -> anyhow::Result<()> {
        self.record(Outbound::Answer {
            callback_id: callback_id.to_string(),
            alert: alert.map(String::from),
        });
        Ok(())
    }
}

/// Remote model double with canned answers.
#[derive(Default)]
pub struct ScriptedModel {
    scores: HashMap<String, f64>,
    reply: Option<String>,
    keywords: Vec<String>,
    /// `(persona name, short)` for every generation request.
    pub generations: Mutex<Vec<(String, bool)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(mut self, persona: &str, score: f64) -> Self {
        self.scores.insert(persona.to_string(), score);
        self
    }

    pub fn replying(mut self, reply: &str) -> Self {
        self.reply = Some(reply.to_string());
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }
}

#[async_trait]
impl RemoteModel for ScriptedModel {
    async fn score_relevance(&self, persona: &Persona, _message: &str) -> Option<f64> {
        self.scores.get(&persona.name).copied()
    }

    async fn generate_reply(
        &self,
        persona: &Persona,
        _message: &str,
        _history: &[MemoryEntry],
        short: bool,
    ) -> anyhow::Result<String> {
        self.generations
            .lock()
            .unwrap()
            .push((persona.name.clone(), short));
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => anyhow::bail!("remote model unavailable"),
        }
    }

    async fn extract_keywords(&self, _prompt: &str, max_count: usize) -> Vec<String> {
        self.keywords.iter().take(max_count).cloned().collect()
    }
}

pub fn dispatcher(
    store: Arc<dyn PersonaStore>,
    model: Option<Arc<dyn RemoteModel>>,
    transport: Arc<RecordingTransport>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        store,
        model,
        transport,
        RoutingConfig::default(),
        DispatchSettings::default().with_bot_handle(BOT_HANDLE),
    ))
}

pub fn text(chat_id: i64, sender_id: i64, message_id: i64, body: &str) -> InboundText {
    InboundText {
        chat_id,
        message_id,
        sender_id,
        sender_name: format!("user{sender_id}"),
        text: body.to_string(),
        reply_to: None,
    }
}

pub fn reply(chat_id: i64, sender_id: i64, body: &str, reply_to: i64) -> InboundText {
    InboundText {
        reply_to: Some(reply_to),
        ..text(chat_id, sender_id, reply_to + 1, body)
    }
}

pub fn persona(name: &str, keywords: &[&str]) -> Persona {
    Persona {
        id: format!("id-{}", name.to_lowercase()),
        name: name.to_string(),
        prompt: format!("You are {name}."),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}
