use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::{
    HISTORY_CEILING, PersonaStore, StoreError, clean_keywords, normalize_name,
    validate_new_persona,
};
use crate::types::{MemoryEntry, Persona, Role};

/// SQLite-backed persona store.
///
/// One connection behind a mutex; every call runs on the blocking pool.
/// Because the mutex serializes all statements, an append and its trim
/// always run as one unit per store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        migrate(&conn)?;

        info!(path = %path.display(), "opened persona database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("storage task failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

         CREATE TABLE IF NOT EXISTS personas (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL,
             name_key TEXT UNIQUE NOT NULL,
             prompt TEXT NOT NULL,
             keywords TEXT NOT NULL DEFAULT '[]'
         );

         CREATE TABLE IF NOT EXISTS memory (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             persona_id TEXT NOT NULL,
             role TEXT NOT NULL,
             text TEXT NOT NULL,
             ts TEXT NOT NULL,
             FOREIGN KEY(persona_id) REFERENCES personas(id) ON DELETE CASCADE
         );
         CREATE INDEX IF NOT EXISTS idx_memory_persona ON memory(persona_id);",
    )
}

struct PersonaRow {
    id: String,
    name: String,
    prompt: String,
    keywords: String,
}

impl PersonaRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            prompt: row.get(2)?,
            keywords: row.get(3)?,
        })
    }

    fn into_persona(self) -> Persona {
        Persona {
            id: self.id,
            name: self.name,
            prompt: self.prompt,
            keywords: serde_json::from_str(&self.keywords).unwrap_or_default(),
        }
    }
}

fn find_by_key(conn: &Connection, key: &str) -> Result<Option<Persona>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, name, prompt, keywords FROM personas WHERE name_key = ?1",
            params![key],
            PersonaRow::from_row,
        )
        .optional()?;
    Ok(row.map(PersonaRow::into_persona))
}

fn persona_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM personas WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn parse_entry(role: String, text: String, ts: String) -> Result<MemoryEntry, StoreError> {
    let role: Role = role
        .parse()
        .map_err(|e: anyhow::Error| StoreError::Backend(e.to_string()))?;
    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map_err(|e| StoreError::Backend(format!("bad timestamp {ts}: {e}")))?
        .with_timezone(&Utc);
    Ok(MemoryEntry {
        role,
        text,
        timestamp,
    })
}

#[async_trait]
impl PersonaStore for SqliteStore {
    async fn list_personas(&self) -> Result<Vec<Persona>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, prompt, keywords FROM personas ORDER BY name")?;
            let rows = stmt.query_map([], PersonaRow::from_row)?;
            let personas = rows
                .map(|r| r.map(PersonaRow::into_persona))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(personas)
        })
        .await
    }

    async fn get_persona_by_name(&self, name: &str) -> Result<Option<Persona>, StoreError> {
        let key = normalize_name(name);
        self.with_connection(move |conn| find_by_key(conn, &key))
            .await
    }

    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, prompt, keywords FROM personas WHERE id = ?1",
                    params![id],
                    PersonaRow::from_row,
                )
                .optional()?;
            Ok(row.map(PersonaRow::into_persona))
        })
        .await
    }

    async fn create_persona(
        &self,
        name: &str,
        prompt: &str,
        keywords: Vec<String>,
    ) -> Result<Persona, StoreError> {
        validate_new_persona(name, prompt)?;
        let persona = Persona {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            prompt: prompt.trim().to_string(),
            keywords: clean_keywords(keywords),
        };
        let keywords_json = serde_json::to_string(&persona.keywords)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.with_connection(move |conn| {
            let key = normalize_name(&persona.name);
            let tx = conn.transaction()?;
            if find_by_key(&tx, &key)?.is_some() {
                return Err(StoreError::DuplicateName(persona.name));
            }
            tx.execute(
                "INSERT INTO personas (id, name, name_key, prompt, keywords)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![persona.id, persona.name, key, persona.prompt, keywords_json],
            )?;
            tx.commit()?;
            Ok(persona)
        })
        .await
    }

    async fn append_history(
        &self,
        persona_id: &str,
        entry: MemoryEntry,
    ) -> Result<(), StoreError> {
        let persona_id = persona_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            if !persona_exists(&tx, &persona_id)? {
                return Err(StoreError::NotFound(persona_id));
            }

            tx.execute(
                "INSERT INTO memory (persona_id, role, text, ts) VALUES (?1, ?2, ?3, ?4)",
                params![
                    persona_id,
                    entry.role.as_str(),
                    entry.text,
                    entry.timestamp.to_rfc3339()
                ],
            )?;

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM memory WHERE persona_id = ?1",
                params![persona_id],
                |row| row.get(0),
            )?;
            let ceiling = HISTORY_CEILING as i64;
            if count > ceiling {
                tx.execute(
                    "DELETE FROM memory WHERE id IN (
                         SELECT id FROM memory WHERE persona_id = ?1 ORDER BY id ASC LIMIT ?2
                     )",
                    params![persona_id, count - ceiling],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_history(
        &self,
        persona_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        let persona_id = persona_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, text, ts FROM memory
                 WHERE persona_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![persona_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut entries = rows
                .map(|r| {
                    let (role, text, ts) = r?;
                    parse_entry(role, text, ts)
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            // Newest-first from the query; callers want oldest first.
            entries.reverse();
            Ok(entries)
        })
        .await
    }

    async fn clear_history(&self, persona_name: &str) -> Result<(), StoreError> {
        let name = persona_name.trim().to_string();
        self.with_connection(move |conn| {
            let persona =
                find_by_key(conn, &normalize_name(&name))?.ok_or(StoreError::NotFound(name))?;
            conn.execute(
                "DELETE FROM memory WHERE persona_id = ?1",
                params![persona.id],
            )?;
            Ok(())
        })
        .await
    }
}
