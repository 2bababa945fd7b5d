pub mod commands;
pub mod pending;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::providers::RemoteModel;
use crate::agent::{ReplyGenerator, ReplyMode};
use crate::channel::{SendOptions, Transport};
use crate::config::{DispatchConfig, RoutingConfig};
use crate::router::RelevanceRouter;
use crate::store::{PersonaStore, StoreError};
use crate::types::{Button, ButtonPress, InboundEvent, InboundText, MemoryEntry, Persona};
use commands::{Command, HELP_TEXT, SELECT_PERSONA_PREFIX, parse_add, parse_talk};
use pending::PendingSelections;

const NO_LONGER_AVAILABLE: &str = "That persona is no longer available.";

/// Personas per row in the `/talk` picker.
const BUTTONS_PER_ROW: usize = 3;

/// How an inbound text message is addressed. Modes are tried in the order
/// listed; the first match wins.
#[derive(Debug, Clone)]
pub enum Addressing {
    /// Reply to a persona-pick prompt the sender is waiting on.
    Pending { persona_id: String },
    Command(Command),
    /// `Name: text` where `Name` is an existing persona.
    Prefix { persona: Persona, text: String },
    /// The bot's @handle appears in the message.
    Mention { persona: Persona },
    Ambient { personas: Vec<Persona> },
    /// No personas exist; nothing to do.
    Ignore,
}

/// Split `Name: text`. The name is everything before the first colon on the
/// first line; the text is the rest of the message.
pub fn parse_prefix(text: &str) -> Option<(&str, &str)> {
    let first_line = text.lines().next()?;
    let colon = first_line.find(':')?;
    let name = first_line[..colon].trim();
    let body = text[colon + 1..].trim();
    if name.is_empty() || body.is_empty() {
        return None;
    }
    Some((name, body))
}

/// Outbound persona reply format.
pub fn format_reply(persona: &Persona, reply: &str) -> String {
    format!("({}): {reply}", persona.name)
}

fn one_line(err: &anyhow::Error) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Bot @handle without the `@`; mentions are ignored when unset.
    pub bot_handle: Option<String>,
    pub default_persona: String,
    pub pending_ttl: Duration,
    pub pending_capacity: usize,
    pub history_window: usize,
    pub keyword_count: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            bot_handle: None,
            default_persona: config.default_persona.clone(),
            pending_ttl: Duration::from_secs(config.pending_ttl_secs),
            pending_capacity: config.pending_capacity,
            history_window: config.history_window,
            keyword_count: config.keyword_count,
        }
    }

    pub fn with_bot_handle(mut self, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        let handle = handle.trim().trim_start_matches('@');
        self.bot_handle = (!handle.is_empty()).then(|| handle.to_string());
        self
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Generates a reply, records both sides in history, and sends it.
#[derive(Clone)]
struct Replier {
    store: Arc<dyn PersonaStore>,
    generator: ReplyGenerator,
    transport: Arc<dyn Transport>,
}

impl Replier {
    /// Generation happens before the user entry is appended, and the user
    /// entry before the bot entry.
    async fn respond(
        &self,
        chat_id: i64,
        persona: &Persona,
        text: &str,
        mode: ReplyMode,
    ) -> anyhow::Result<()> {
        let reply = self.generator.generate(persona, text, mode).await;
        self.store
            .append_history(&persona.id, MemoryEntry::user(text))
            .await?;
        self.store
            .append_history(&persona.id, MemoryEntry::bot(reply.clone()))
            .await?;
        self.transport
            .send_text(chat_id, &format_reply(persona, &reply), SendOptions::default())
            .await?;
        Ok(())
    }
}

/// Turns inbound events into persona replies.
pub struct Dispatcher {
    store: Arc<dyn PersonaStore>,
    model: Option<Arc<dyn RemoteModel>>,
    transport: Arc<dyn Transport>,
    replier: Replier,
    router: RelevanceRouter,
    pending: PendingSelections,
    settings: DispatchSettings,
    secondary_delay: Duration,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PersonaStore>,
        model: Option<Arc<dyn RemoteModel>>,
        transport: Arc<dyn Transport>,
        routing: RoutingConfig,
        settings: DispatchSettings,
    ) -> Self {
        let generator = ReplyGenerator::new(model.clone(), Arc::clone(&store))
            .with_history_window(settings.history_window);
        let replier = Replier {
            store: Arc::clone(&store),
            generator,
            transport: Arc::clone(&transport),
        };

        Self {
            secondary_delay: Duration::from_millis(routing.secondary_delay_ms),
            router: RelevanceRouter::new(model.clone(), routing),
            pending: PendingSelections::new(settings.pending_ttl, settings.pending_capacity),
            store,
            model,
            transport,
            replier,
            settings,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pending(&self) -> &PendingSelections {
        &self.pending
    }

    /// Handle an event on its own tracked task; errors are logged.
    pub fn spawn_event(self: &Arc<Self>, event: InboundEvent) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = this.handle_event(event).await {
                warn!("event handling failed: {e}");
            }
        });
    }

    pub async fn handle_event(&self, event: InboundEvent) -> anyhow::Result<()> {
        match event {
            InboundEvent::Text(msg) => self.handle_text(&msg).await,
            InboundEvent::Button(press) => self.handle_button(&press).await,
        }
    }

    /// Decide how a message is addressed.
    pub async fn classify(&self, msg: &InboundText) -> Result<Addressing, StoreError> {
        if let Some(selection) = self
            .pending
            .take_matching(msg.sender_id, msg.chat_id, msg.reply_to)
        {
            return Ok(Addressing::Pending {
                persona_id: selection.persona_id,
            });
        }

        if let Some(command) = Command::parse(&msg.text) {
            return Ok(Addressing::Command(command));
        }

        let personas = self.store.list_personas().await?;
        if personas.is_empty() {
            return Ok(Addressing::Ignore);
        }

        if let Some((name, body)) = parse_prefix(&msg.text) {
            if let Some(persona) = self.store.get_persona_by_name(name).await? {
                return Ok(Addressing::Prefix {
                    persona,
                    text: body.to_string(),
                });
            }
        }

        if self.mentions_bot(&msg.text) {
            let persona = match self
                .store
                .get_persona_by_name(&self.settings.default_persona)
                .await?
            {
                Some(persona) => persona,
                None => personas[0].clone(),
            };
            return Ok(Addressing::Mention { persona });
        }

        Ok(Addressing::Ambient { personas })
    }

    fn mentions_bot(&self, text: &str) -> bool {
        match &self.settings.bot_handle {
            Some(handle) => text
                .to_lowercase()
                .contains(&format!("@{}", handle.to_lowercase())),
            None => false,
        }
    }

    pub async fn handle_text(&self, msg: &InboundText) -> anyhow::Result<()> {
        let addressing = self.classify(msg).await?;
        debug!(chat_id = msg.chat_id, sender = %msg.sender_name, ?addressing, "classified message");

        match addressing {
            Addressing::Pending { persona_id } => match self.store.get_persona(&persona_id).await? {
                Some(persona) => self.respond_explicit(msg.chat_id, &persona, &msg.text).await,
                None => self.say(msg.chat_id, NO_LONGER_AVAILABLE).await,
            },
            Addressing::Command(command) => self.handle_command(msg, command).await,
            Addressing::Prefix { persona, text } => {
                self.respond_explicit(msg.chat_id, &persona, &text).await
            }
            Addressing::Mention { persona } => {
                self.respond_explicit(msg.chat_id, &persona, &msg.text).await
            }
            Addressing::Ambient { personas } => {
                self.route_ambient(msg, &personas).await;
                Ok(())
            }
            Addressing::Ignore => Ok(()),
        }
    }

    /// Ambient routing. Nothing here surfaces an error to the chat.
    async fn route_ambient(&self, msg: &InboundText, personas: &[Persona]) {
        let decision = self.router.route(personas, &msg.text).await;
        if decision.is_empty() {
            return;
        }

        // Secondary replies are scheduled before the main reply runs and
        // fire whatever its outcome.
        let due = Instant::now() + self.secondary_delay;
        for scored in &decision.secondary {
            self.schedule_secondary(msg.chat_id, scored.persona.clone(), msg.text.clone(), due);
        }

        if let Some(main) = decision.main {
            info!(persona = %main.persona.name, score = main.score, "main responder selected");
            self.typing(msg.chat_id).await;
            if let Err(e) = self
                .replier
                .respond(msg.chat_id, &main.persona, &msg.text, ReplyMode::Full)
                .await
            {
                warn!(persona = %main.persona.name, "main reply failed: {e}");
            }
        }
    }

    fn schedule_secondary(&self, chat_id: i64, persona: Persona, text: String, due: Instant) {
        debug!(persona = %persona.name, "scheduling secondary reply");
        let replier = self.replier.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(persona = %persona.name, "secondary reply cancelled");
                }
                _ = tokio::time::sleep_until(due) => {
                    if let Err(e) = replier.respond(chat_id, &persona, &text, ReplyMode::Short).await {
                        warn!(persona = %persona.name, "secondary reply dropped: {e}");
                    }
                }
            }
        });
    }

    /// Reply for a flow the user asked for; failures become one short line.
    async fn respond_explicit(&self, chat_id: i64, persona: &Persona, text: &str) -> anyhow::Result<()> {
        self.typing(chat_id).await;
        if let Err(e) = self
            .replier
            .respond(chat_id, persona, text, ReplyMode::Full)
            .await
        {
            warn!(persona = %persona.name, "addressed reply failed: {e}");
            let notice = match e.downcast_ref::<StoreError>() {
                Some(StoreError::NotFound(_)) => NO_LONGER_AVAILABLE.to_string(),
                _ => format!("Error: {}", one_line(&e)),
            };
            self.say(chat_id, &notice).await?;
        }
        Ok(())
    }

    async fn handle_command(&self, msg: &InboundText, command: Command) -> anyhow::Result<()> {
        let chat_id = msg.chat_id;
        match command {
            Command::Start => {
                self.say(chat_id, "Hi! The multi-persona bot is ready. /help")
                    .await
            }
            Command::Help => self.say(chat_id, HELP_TEXT).await,
            Command::List => {
                let personas = self.store.list_personas().await?;
                if personas.is_empty() {
                    return self.say(chat_id, "No personas yet. Add one with /add").await;
                }
                let lines: Vec<String> = personas
                    .iter()
                    .map(|p| format!("- {} (keywords: {})", p.name, p.keywords.join(", ")))
                    .collect();
                self.say(chat_id, &lines.join("\n")).await
            }
            Command::Add(payload) => self.add_persona(chat_id, &payload).await,
            Command::Talk(payload) => self.talk(chat_id, &payload).await,
            Command::Clear(payload) => {
                if payload.is_empty() {
                    return self.say(chat_id, "Usage: /clear name").await;
                }
                match self.store.clear_history(&payload).await {
                    Ok(()) => {
                        info!(persona = %payload, "memory cleared");
                        self.say(chat_id, &format!("Memory of \"{payload}\" cleared."))
                            .await
                    }
                    Err(e) => self.say(chat_id, &format!("Error: {e}")).await,
                }
            }
            Command::Unknown(word) => {
                debug!(command = %word, "ignoring unknown command");
                Ok(())
            }
        }
    }

    async fn add_persona(&self, chat_id: i64, payload: &str) -> anyhow::Result<()> {
        if payload.is_empty() {
            return self.say(chat_id, "Usage: /add name|prompt|kw1,kw2").await;
        }
        let Some(args) = parse_add(payload) else {
            return self
                .say(
                    chat_id,
                    "Both name and prompt are required: /add name|prompt|kw1,kw2",
                )
                .await;
        };

        let mut keywords = args.keywords;
        if keywords.is_empty() {
            if let Some(model) = &self.model {
                keywords = model
                    .extract_keywords(&args.prompt, self.settings.keyword_count)
                    .await;
                debug!(persona = %args.name, count = keywords.len(), "extracted keywords");
            }
        }

        match self
            .store
            .create_persona(&args.name, &args.prompt, keywords)
            .await
        {
            Ok(persona) => {
                info!(persona = %persona.name, id = %persona.id, "persona created");
                self.say(chat_id, &format!("Persona \"{}\" added.", persona.name))
                    .await
            }
            Err(e) => self.say(chat_id, &format!("Error: {e}")).await,
        }
    }

    async fn talk(&self, chat_id: i64, payload: &str) -> anyhow::Result<()> {
        if payload.is_empty() {
            let personas = self.store.list_personas().await?;
            if personas.is_empty() {
                return self
                    .say(chat_id, "No personas to choose from. Add one with /add")
                    .await;
            }
            let rows: Vec<Vec<Button>> = personas
                .chunks(BUTTONS_PER_ROW)
                .map(|row| {
                    row.iter()
                        .map(|p| Button {
                            label: p.name.clone(),
                            payload: format!("{SELECT_PERSONA_PREFIX}{}", p.id),
                        })
                        .collect()
                })
                .collect();
            self.transport
                .send_with_buttons(chat_id, "Pick a persona to send a message to:", &rows)
                .await?;
            return Ok(());
        }

        let Some((name, message)) = parse_talk(payload) else {
            return self.say(chat_id, "Usage: /talk name|message").await;
        };
        match self.store.get_persona_by_name(&name).await? {
            Some(persona) => self.respond_explicit(chat_id, &persona, &message).await,
            None => self.say(chat_id, "Persona not found.").await,
        }
    }

    pub async fn handle_button(&self, press: &ButtonPress) -> anyhow::Result<()> {
        let Some(persona_id) = press.payload.strip_prefix(SELECT_PERSONA_PREFIX) else {
            return self.transport.answer_button(&press.callback_id, None).await;
        };

        let Some(persona) = self.store.get_persona(persona_id).await? else {
            return self
                .transport
                .answer_button(&press.callback_id, Some("Persona not found"))
                .await;
        };

        if let Err(e) = self.transport.answer_button(&press.callback_id, None).await {
            debug!("answering button failed: {e}");
        }

        let prompt = format!("Write a message for {}", persona.name);
        let in_chat = match press.chat_id {
            Some(chat_id) => self
                .transport
                .send_text(chat_id, &prompt, SendOptions::force_reply())
                .await
                .map_err(|e| warn!(chat_id, "force-reply prompt failed: {e}"))
                .ok(),
            None => None,
        };

        self.pending.purge_expired();
        if let Some(sent) = in_chat {
            self.pending.insert(press.sender_id, persona.id, sent);
            return Ok(());
        }

        match self
            .transport
            .send_private(press.sender_id, &prompt, SendOptions::force_reply())
            .await
        {
            Ok(sent) => {
                self.pending.insert(press.sender_id, persona.id, sent);
                if let Some(chat_id) = press.chat_id {
                    self.say(chat_id, "I sent you a private message, reply there.")
                        .await?;
                }
            }
            Err(e) => {
                warn!(user = press.sender_id, "private prompt failed: {e}");
                if let Some(chat_id) = press.chat_id {
                    self.say(chat_id, "Could not request a message.").await?;
                }
            }
        }
        Ok(())
    }

    async fn say(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.transport
            .send_text(chat_id, text, SendOptions::default())
            .await?;
        Ok(())
    }

    async fn typing(&self, chat_id: i64) {
        if let Err(e) = self.transport.indicate_typing(chat_id).await {
            debug!(chat_id, "typing indicator failed: {e}");
        }
    }

    /// Wait for all in-flight handlers and deferred replies to finish.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel deferred replies that have not fired and wait for the rest.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("dispatcher stopped");
    }
}
