pub mod providers;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::PersonaStore;
use crate::types::Persona;
use providers::RemoteModel;

/// Entries of recent history handed to the remote model.
pub const DEFAULT_HISTORY_WINDOW: usize = 50;

/// Local reply used in short mode when the remote model is unavailable.
pub const SHORT_FALLBACK: &str = "Interesting.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Full,
    /// Secondary responders: prefer a terse reply.
    Short,
}

/// Produces a persona's reply to a message.
///
/// Tries the remote model first when one is configured and falls back to a
/// deterministic local template on any failure, so `generate` never fails.
#[derive(Clone)]
pub struct ReplyGenerator {
    model: Option<Arc<dyn RemoteModel>>,
    store: Arc<dyn PersonaStore>,
    history_window: usize,
}

impl ReplyGenerator {
    pub fn new(model: Option<Arc<dyn RemoteModel>>, store: Arc<dyn PersonaStore>) -> Self {
        Self {
            model,
            store,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub async fn generate(&self, persona: &Persona, message: &str, mode: ReplyMode) -> String {
        if let Some(model) = &self.model {
            let history = match self.store.get_history(&persona.id, self.history_window).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(persona = %persona.name, "history unavailable, generating without it: {e}");
                    Vec::new()
                }
            };

            match model
                .generate_reply(persona, message, &history, mode == ReplyMode::Short)
                .await
            {
                Ok(reply) => return reply,
                Err(e) => warn!(persona = %persona.name, "remote generation failed, using fallback: {e}"),
            }
        } else {
            debug!(persona = %persona.name, "no remote model configured, using local reply");
        }

        local_reply(persona, message, mode)
    }
}

/// Deterministic reply that needs no network.
pub fn local_reply(persona: &Persona, message: &str, mode: ReplyMode) -> String {
    match mode {
        ReplyMode::Short => SHORT_FALLBACK.to_string(),
        ReplyMode::Full => format!(
            "{} - I noticed: \"{message}\". What do you think?",
            persona.prompt
        ),
    }
}
