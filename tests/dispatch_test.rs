mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use common::{Outbound, RecordingTransport, ScriptedModel, dispatcher, reply, text};
use kaonasi::agent::providers::RemoteModel;
use kaonasi::dispatch::{Addressing, Dispatcher};
use kaonasi::store::{InMemoryStore, PersonaStore, StoreError};
use kaonasi::types::{ButtonPress, InboundEvent, MemoryEntry, Persona, Role};

const CHAT: i64 = -500;
const USER: i64 = 7;

/// Store whose personas can disappear after they were picked.
#[derive(Default)]
struct VanishingStore {
    inner: InMemoryStore,
    hide_personas: AtomicBool,
    reject_appends: AtomicBool,
}

#[async_trait]
impl PersonaStore for VanishingStore {
    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError> {
        self.inner.list_personas().await
    }

    async fn get_persona_by_name(&self, name: &str) -> Result<Option<Persona>, StoreError> {
        self.inner.get_persona_by_name(name).await
    }

    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, StoreError> {
        if self.hide_personas.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_persona(id).await
    }

    async fn create_persona(
        &self,
        name: &str,
        prompt: &str,
        keywords: Vec<String>,
    ) -> Result<Persona, StoreError> {
        self.inner.create_persona(name, prompt, keywords).await
    }

    async fn append_history(&self, persona_id: &str, entry: MemoryEntry) -> Result<(), StoreError> {
        if self.reject_appends.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound(persona_id.to_string()));
        }
        self.inner.append_history(persona_id, entry).await
    }

    async fn get_history(
        &self,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.inner.get_history(persona_id, limit).await
    }

    async fn clear_history(&self, persona_name: &str) -> Result<(), StoreError> {
        self.inner.clear_history(persona_name).await
    }
}

/// Pick Ada with a button and return the prompt's message id.
async fn pick_ada(
    d: &Arc<Dispatcher>,
    store: &VanishingStore,
    transport: &RecordingTransport,
) -> i64 {
    let ada = persona(&store.inner, "Ada").await;
    d.handle_event(press(&format!("select_persona:{}", ada.id)))
        .await
        .unwrap();
    prompt_message_id(&transport.log())
}

async fn store_with(personas: &[(&str, &str, &[&str])]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for (name, prompt, keywords) in personas {
        store
            .create_persona(name, prompt, keywords.iter().map(|k| k.to_string()).collect())
            .await
            .expect("create persona");
    }
    store
}

async fn persona(store: &InMemoryStore, name: &str) -> Persona {
    store
        .get_persona_by_name(name)
        .await
        .expect("lookup")
        .expect("persona exists")
}

async fn send(d: &Arc<Dispatcher>, body: &str) {
    d.handle_event(InboundEvent::Text(text(CHAT, USER, 1, body)))
        .await
        .expect("handle text");
}

fn press(payload: &str) -> InboundEvent {
    InboundEvent::Button(ButtonPress {
        callback_id: "cb-1".into(),
        chat_id: Some(CHAT),
        sender_id: USER,
        payload: payload.into(),
    })
}

fn prompt_message_id(log: &[Outbound]) -> i64 {
    log.iter()
        .find_map(|o| match o {
            Outbound::Text {
                message_id,
                force_reply: true,
                ..
            } => Some(*message_id),
            Outbound::Private { message_id, .. } => Some(*message_id),
            _ => None,
        })
        .expect("force-reply prompt was sent")
}

#[tokio::test]
async fn prefix_addresses_named_persona_case_insensitively() {
    let store = store_with(&[("Ada", "You are Ada.", &[]), ("Bob", "You are Bob.", &[])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    send(&d, "ada: how are engines?").await;

    assert_eq!(
        transport.texts(CHAT),
        vec!["(Ada): You are Ada. - I noticed: \"how are engines?\". What do you think?"]
    );
    assert!(transport.log().contains(&Outbound::Typing { chat_id: CHAT }));

    let ada = persona(&store, "Ada").await;
    let history = store.get_history(&ada.id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "how are engines?");
    assert_eq!(history[1].role, Role::Bot);

    let bob = persona(&store, "Bob").await;
    assert!(store.get_history(&bob.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_prefix_falls_through_to_ambient() {
    let store = store_with(&[("Ada", "You are Ada.", &["engines"])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store, None, transport.clone());

    let addressing = d.classify(&text(CHAT, USER, 1, "Zed: hello")).await.unwrap();
    assert!(matches!(addressing, Addressing::Ambient { .. }));

    send(&d, "Zed: hello").await;
    d.wait_idle().await;
    assert!(transport.texts(CHAT).is_empty());
}

#[tokio::test]
async fn mention_uses_default_persona_then_first() {
    let store = store_with(&[("Kaonasi", "You are the host.", &[]), ("Ada", "You are Ada.", &[])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store, None, transport.clone());

    send(&d, "hey @Kaonasi_Bot what's new").await;
    let texts = transport.texts(CHAT);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("(Kaonasi): "));

    let store = store_with(&[("Zoe", "You are Zoe.", &[]), ("Ada", "You are Ada.", &[])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store, None, transport.clone());

    send(&d, "@kaonasi_bot anyone?").await;
    let texts = transport.texts(CHAT);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("(Ada): "));
}

#[tokio::test]
async fn nothing_happens_without_personas() {
    let transport = RecordingTransport::new();
    let d = dispatcher(Arc::new(InMemoryStore::new()), None, transport.clone());

    send(&d, "@kaonasi_bot hello").await;
    send(&d, "cats and dogs").await;
    d.wait_idle().await;

    assert!(transport.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ambient_main_replies_now_secondary_after_delay() {
    // "I love my cat": Cats scores 1.0 (main), Pets 0.5 (secondary), Fish 0.
    let store = store_with(&[
        ("Pets", "You are Pets.", &["cat", "dog"]),
        ("Cats", "You are Cats.", &["cat"]),
        ("Fish", "You are Fish.", &["fish"]),
    ])
    .await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());
    let start = Instant::now();

    send(&d, "I love my cat").await;

    let texts = transport.texts(CHAT);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("(Cats): "));

    d.wait_idle().await;
    assert!(start.elapsed() >= Duration::from_millis(1500));

    let texts = transport.texts(CHAT);
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[1], "(Pets): Interesting.");

    let fish = persona(&store, "Fish").await;
    assert!(store.get_history(&fish.id, 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn secondary_only_when_nobody_reaches_main() {
    let store = store_with(&[("Pets", "You are Pets.", &["cat", "dog"])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store, None, transport.clone());

    send(&d, "my cat is asleep").await;
    assert!(transport.texts(CHAT).is_empty());
    assert!(!transport.log().contains(&Outbound::Typing { chat_id: CHAT }));

    d.wait_idle().await;
    assert_eq!(transport.texts(CHAT), vec!["(Pets): Interesting."]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_deferred_replies() {
    let store = store_with(&[
        ("Pets", "You are Pets.", &["cat", "dog"]),
        ("Cats", "You are Cats.", &["cat"]),
    ])
    .await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    send(&d, "I love my cat").await;
    d.shutdown().await;

    let texts = transport.texts(CHAT);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("(Cats): "));

    let pets = persona(&store, "Pets").await;
    assert!(store.get_history(&pets.id, 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_scores_and_short_mode_for_secondaries() {
    let store = store_with(&[("Ada", "You are Ada.", &[]), ("Bob", "You are Bob.", &[])]).await;
    let model = Arc::new(
        ScriptedModel::new()
            .with_score("Ada", 0.9)
            .with_score("Bob", 0.45)
            .replying("remote says hi"),
    );
    let transport = RecordingTransport::new();
    let d = dispatcher(store, Some(model.clone() as Arc<dyn RemoteModel>), transport.clone());

    send(&d, "anything at all").await;
    d.wait_idle().await;

    assert_eq!(
        transport.texts(CHAT),
        vec!["(Ada): remote says hi", "(Bob): remote says hi"]
    );
    let generations = model.generations.lock().unwrap().clone();
    assert_eq!(
        generations,
        vec![("Ada".to_string(), false), ("Bob".to_string(), true)]
    );
}

#[tokio::test]
async fn remote_failure_falls_back_to_local_reply() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let model: Arc<dyn RemoteModel> = Arc::new(ScriptedModel::new());
    let transport = RecordingTransport::new();
    let d = dispatcher(store, Some(model), transport.clone());

    send(&d, "Ada: ping").await;
    assert_eq!(
        transport.texts(CHAT),
        vec!["(Ada): You are Ada. - I noticed: \"ping\". What do you think?"]
    );
}

#[tokio::test]
async fn button_pick_then_reply_reaches_persona() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let ada = persona(&store, "Ada").await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    d.handle_event(press(&format!("select_persona:{}", ada.id)))
        .await
        .unwrap();

    let log = transport.log();
    assert!(log.contains(&Outbound::Answer {
        callback_id: "cb-1".into(),
        alert: None
    }));
    assert_eq!(transport.texts(CHAT), vec!["Write a message for Ada"]);
    assert_eq!(d.pending().len(), 1);

    // A message that does not reply to the prompt leaves the pick in place.
    send(&d, "unrelated chatter").await;
    assert_eq!(d.pending().len(), 1);

    let prompt_id = prompt_message_id(&log);
    d.handle_event(InboundEvent::Text(reply(CHAT, USER, "/help", prompt_id)))
        .await
        .unwrap();

    assert!(d.pending().is_empty());
    let texts = transport.texts(CHAT);
    assert_eq!(
        texts.last().unwrap(),
        "(Ada): You are Ada. - I noticed: \"/help\". What do you think?"
    );
    assert_eq!(store.get_history(&ada.id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn button_pick_falls_back_to_private_chat() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let ada = persona(&store, "Ada").await;
    let transport = RecordingTransport::new();
    transport.fail_force_reply_in_chat();
    let d = dispatcher(store, None, transport.clone());

    d.handle_event(press(&format!("select_persona:{}", ada.id)))
        .await
        .unwrap();

    assert_eq!(
        transport.texts(CHAT),
        vec!["I sent you a private message, reply there."]
    );
    let prompt_id = prompt_message_id(&transport.log());

    // The private chat id is the user id.
    d.handle_event(InboundEvent::Text(reply(USER, USER, "hi Ada", prompt_id)))
        .await
        .unwrap();
    let private = transport.texts(USER);
    assert_eq!(private.len(), 1);
    assert!(private[0].starts_with("(Ada): "));
}

#[tokio::test]
async fn button_pick_reports_when_no_prompt_can_be_sent() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let ada = persona(&store, "Ada").await;
    let transport = RecordingTransport::new();
    transport.fail_force_reply_in_chat();
    transport.fail_private();
    let d = dispatcher(store, None, transport.clone());

    d.handle_event(press(&format!("select_persona:{}", ada.id)))
        .await
        .unwrap();

    assert_eq!(transport.texts(CHAT), vec!["Could not request a message."]);
    assert!(d.pending().is_empty());
}

#[tokio::test]
async fn button_with_unknown_persona_or_payload() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store, None, transport.clone());

    d.handle_event(press("select_persona:missing")).await.unwrap();
    d.handle_event(press("something_else")).await.unwrap();

    assert_eq!(
        transport.log(),
        vec![
            Outbound::Answer {
                callback_id: "cb-1".into(),
                alert: Some("Persona not found".into())
            },
            Outbound::Answer {
                callback_id: "cb-1".into(),
                alert: None
            },
        ]
    );
    assert!(d.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_pick_is_not_honored() {
    let store = store_with(&[("Ada", "You are Ada.", &[])]).await;
    let ada = persona(&store, "Ada").await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    d.handle_event(press(&format!("select_persona:{}", ada.id)))
        .await
        .unwrap();
    let prompt_id = prompt_message_id(&transport.log());

    tokio::time::advance(Duration::from_secs(121)).await;
    d.handle_event(InboundEvent::Text(reply(CHAT, USER, "late reply", prompt_id)))
        .await
        .unwrap();
    d.wait_idle().await;

    assert_eq!(transport.texts(CHAT), vec!["Write a message for Ada"]);
    assert!(store.get_history(&ada.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn add_list_talk_and_clear_commands() {
    let store = Arc::new(InMemoryStore::new());
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    send(&d, "/add Ada|You are Ada.|math, engines").await;
    send(&d, "/add ada|Another Ada").await;
    send(&d, "/add Bob").await;
    send(&d, "/list").await;
    send(&d, "/talk Ada|hello").await;
    send(&d, "/talk Zed|hello").await;
    send(&d, "/clear Ada").await;
    send(&d, "/clear Zed").await;

    let texts = transport.texts(CHAT);
    assert_eq!(texts[0], "Persona \"Ada\" added.");
    assert!(texts[1].starts_with("Error: "));
    assert_eq!(
        texts[2],
        "Both name and prompt are required: /add name|prompt|kw1,kw2"
    );
    assert_eq!(texts[3], "- Ada (keywords: math, engines)");
    assert_eq!(
        texts[4],
        "(Ada): You are Ada. - I noticed: \"hello\". What do you think?"
    );
    assert_eq!(texts[5], "Persona not found.");
    assert_eq!(texts[6], "Memory of \"Ada\" cleared.");
    assert!(texts[7].starts_with("Error: "));

    let ada = persona(&store, "Ada").await;
    assert!(store.get_history(&ada.id, 10).await.unwrap().is_empty());
    assert_eq!(store.count().await, 1);
}

#[tokio::test]
async fn talk_without_arguments_offers_buttons_in_rows_of_three() {
    let store = store_with(&[
        ("Ada", "a", &[]),
        ("bob", "b", &[]),
        ("Cy", "c", &[]),
        ("Dee", "d", &[]),
    ])
    .await;
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    send(&d, "/talk").await;

    let rows = transport
        .log()
        .into_iter()
        .find_map(|o| match o {
            Outbound::Buttons { rows, .. } => Some(rows),
            _ => None,
        })
        .expect("button list sent");
    assert_eq!(rows.len(), 2);
    let labels: Vec<&str> = rows.iter().flatten().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["Ada", "Cy", "Dee", "bob"]);

    let bob = persona(&store, "bob").await;
    assert_eq!(rows[1][0].payload, format!("select_persona:{}", bob.id));
}

#[tokio::test]
async fn add_extracts_keywords_when_remote_is_configured() {
    let store = Arc::new(InMemoryStore::new());
    let model: Arc<dyn RemoteModel> =
        Arc::new(ScriptedModel::new().with_keywords(&["history", "maps"]));
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), Some(model), transport.clone());

    send(&d, "/add Ada|You love old maps.").await;

    let ada = persona(&store, "Ada").await;
    assert_eq!(ada.keywords, vec!["history", "maps"]);
}

#[tokio::test]
async fn commands_work_without_personas_and_unknown_ones_are_ignored() {
    let transport = RecordingTransport::new();
    let d = dispatcher(Arc::new(InMemoryStore::new()), None, transport.clone());

    send(&d, "/start").await;
    send(&d, "/list@kaonasi_bot").await;
    send(&d, "/talk").await;
    send(&d, "/frobnicate").await;

    assert_eq!(
        transport.texts(CHAT),
        vec![
            "Hi! The multi-persona bot is ready. /help",
            "No personas yet. Add one with /add",
            "No personas to choose from. Add one with /add",
        ]
    );
}

#[tokio::test]
async fn picked_persona_missing_at_reply_time() {
    let store = Arc::new(VanishingStore::default());
    store.create_persona("Ada", "You are Ada.", vec![]).await.unwrap();
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    let prompt_id = pick_ada(&d, &store, &transport).await;
    store.hide_personas.store(true, Ordering::SeqCst);

    d.handle_event(InboundEvent::Text(reply(CHAT, USER, "still there?", prompt_id)))
        .await
        .unwrap();

    assert_eq!(
        transport.texts(CHAT),
        vec!["Write a message for Ada", "That persona is no longer available."]
    );
    assert!(d.pending().is_empty());
}

#[tokio::test]
async fn persona_removed_before_history_write() {
    let store = Arc::new(VanishingStore::default());
    store.create_persona("Ada", "You are Ada.", vec![]).await.unwrap();
    let transport = RecordingTransport::new();
    let d = dispatcher(store.clone(), None, transport.clone());

    let prompt_id = pick_ada(&d, &store, &transport).await;
    store.reject_appends.store(true, Ordering::SeqCst);

    d.handle_event(InboundEvent::Text(reply(CHAT, USER, "hello Ada", prompt_id)))
        .await
        .unwrap();

    assert_eq!(
        transport.texts(CHAT),
        vec!["Write a message for Ada", "That persona is no longer available."]
    );
}
