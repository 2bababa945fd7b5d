pub mod sqlite;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::types::{MemoryEntry, Persona};

pub use sqlite::SqliteStore;

/// Maximum number of memory entries retained per persona.
pub const HISTORY_CEILING: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("persona \"{0}\" already exists")]
    DuplicateName(String),

    #[error("persona \"{0}\" not found")]
    NotFound(String),

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("storage error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Persona records plus per-persona bounded history.
///
/// All mutation of history (append, trim, clear) goes through this trait.
/// Implementations must make the ceiling trim atomic with the append that
/// triggered it.
#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// All personas in canonical order (see [`canonical_cmp`]).
    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError>;

    /// Case-insensitive lookup.
    async fn get_persona_by_name(&self, name: &str) -> Result<Option<Persona>, StoreError>;

    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, StoreError>;

    /// Fails with [`StoreError::DuplicateName`] if the normalized name is taken.
    async fn create_persona(
        &self,
        name: &str,
        prompt: &str,
        keywords: Vec<String>,
    ) -> Result<Persona, StoreError>;

    /// Append and trim to [`HISTORY_CEILING`].
    async fn append_history(&self, persona_id: &str, entry: MemoryEntry)
    -> Result<(), StoreError>;

    /// Most recent `limit` entries, oldest first.
    async fn get_history(
        &self,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError>;

    async fn clear_history(&self, persona_name: &str) -> Result<(), StoreError>;
}

/// Case-folded form used for uniqueness and lookup.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Canonical persona order: the raw name compared byte by byte, which is
/// SQLite's `BINARY` collation. Uppercase sorts before lowercase.
pub fn canonical_cmp(a: &Persona, b: &Persona) -> std::cmp::Ordering {
    a.name.cmp(&b.name)
}

/// Reject blank names and prompts before touching storage.
pub fn validate_new_persona(name: &str, prompt: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::EmptyField("name"));
    }
    if prompt.trim().is_empty() {
        return Err(StoreError::EmptyField("prompt"));
    }
    Ok(())
}

fn clean_keywords(keywords: Vec<String>) -> Vec<String> {
    keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// In-process persona store. Same semantics as [`SqliteStore`], nothing
/// survives a restart.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by normalized name.
    personas: HashMap<String, Persona>,
    history: HashMap<String, VecDeque<MemoryEntry>>,
}

impl Inner {
    fn by_id(&self, id: &str) -> Option<&Persona> {
        self.personas.values().find(|p| p.id == id)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Number of personas currently stored.
    pub async fn count(&self) -> usize {
        self.inner.read().await.personas.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersonaStore for InMemoryStore {
    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError> {
        let inner = self.inner.read().await;
        let mut personas: Vec<Persona> = inner.personas.values().cloned().collect();
        personas.sort_by(canonical_cmp);
        Ok(personas)
    }

    async fn get_persona_by_name(&self, name: &str) -> Result<Option<Persona>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.personas.get(&normalize_name(name)).cloned())
    }

    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.by_id(id).cloned())
    }

    async fn create_persona(
        &self,
        name: &str,
        prompt: &str,
        keywords: Vec<String>,
    ) -> Result<Persona, StoreError> {
        validate_new_persona(name, prompt)?;
        let key = normalize_name(name);

        let mut inner = self.inner.write().await;
        if inner.personas.contains_key(&key) {
            return Err(StoreError::DuplicateName(name.trim().to_string()));
        }

        let persona = Persona {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            prompt: prompt.trim().to_string(),
            keywords: clean_keywords(keywords),
        };
        inner.personas.insert(key, persona.clone());
        Ok(persona)
    }

    async fn append_history(
        &self,
        persona_id: &str,
        entry: MemoryEntry,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.by_id(persona_id).is_none() {
            return Err(StoreError::NotFound(persona_id.to_string()));
        }

        let entries = inner.history.entry(persona_id.to_string()).or_default();
        entries.push_back(entry);
        // Trim under the same write guard as the push.
        if entries.len() > HISTORY_CEILING {
            let surplus = entries.len() - HISTORY_CEILING;
            entries.drain(..surplus);
        }
        Ok(())
    }

    async fn get_history(
        &self,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(match inner.history.get(persona_id) {
            Some(entries) => {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        })
    }

    async fn clear_history(&self, persona_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let id = inner
            .personas
            .get(&normalize_name(persona_name))
            .map(|p| p.id.clone())
            .ok_or_else(|| StoreError::NotFound(persona_name.trim().to_string()))?;
        inner.history.remove(&id);
        Ok(())
    }
}
