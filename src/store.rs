use crate::providers::OwnerType;
use crate::sessions::{Creator, Interaction, InteractionState, Session, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence for sessions and their interactions. Every method is a single
/// store call; the gateway never spans a transaction across them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts the session and any interactions it already carries.
    async fn create_session(&self, session: &Session) -> Result<(), String>;
    /// Loads a session with its interactions in order.
    async fn get_session(&self, id: &str) -> Result<Option<Session>, String>;
    async fn update_session(&self, session: &Session) -> Result<(), String>;
    async fn create_interaction(&self, interaction: &Interaction) -> Result<(), String>;
    async fn update_interaction(&self, interaction: &Interaction) -> Result<(), String>;
    async fn delete_interactions(&self, session_id: &str, ids: &[String]) -> Result<(), String>;
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: &Session) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&session.id) {
            return Err(format!("session {} already exists", session.id));
        }
        guard.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .get_mut(&session.id)
            .ok_or_else(|| format!("session {} not found", session.id))?;
        let interactions = std::mem::take(&mut stored.interactions);
        *stored = session.clone();
        stored.interactions = interactions;
        Ok(())
    }

    async fn create_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .get_mut(&interaction.session_id)
            .ok_or_else(|| format!("session {} not found", interaction.session_id))?;
        stored.interactions.push(interaction.clone());
        Ok(())
    }

    async fn update_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .get_mut(&interaction.session_id)
            .and_then(|s| s.interactions.iter_mut().find(|i| i.id == interaction.id))
            .ok_or_else(|| format!("interaction {} not found", interaction.id))?;
        *stored = interaction.clone();
        Ok(())
    }

    async fn delete_interactions(&self, session_id: &str, ids: &[String]) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.get_mut(session_id) {
            session.interactions.retain(|i| !ids.contains(&i.id));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL,
                owner_type TEXT NOT NULL,
                model_name TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL DEFAULT '',
                parent_app TEXT NOT NULL DEFAULT '',
                organization_id TEXT NOT NULL DEFAULT '',
                generation_id INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                generation_id INTEGER NOT NULL DEFAULT 0,
                creator TEXT NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('waiting', 'complete', 'error')),
                prompt_message TEXT NOT NULL DEFAULT '',
                response_message TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                finished INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scheduled_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interactions_session ON interactions(session_id, position)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    async fn list_interactions(&self, session_id: &str) -> Result<Vec<Interaction>, String> {
        let rows = sqlx::query(
            r#"SELECT id, session_id, generation_id, creator, state, prompt_message,
                      response_message, error, finished, created_at, updated_at, scheduled_at,
                      completed_at, duration_ms, prompt_tokens, completion_tokens, total_tokens,
                      metadata_json
               FROM interactions WHERE session_id = ? ORDER BY position ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_interaction).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: &Session) -> Result<(), String> {
        let metadata_json = serde_json::to_string(&session.metadata).map_err(|e| e.to_string())?;
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO sessions (id, name, owner, owner_type, model_name, provider, parent_app,
                                     organization_id, generation_id, metadata_json, created_at,
                                     updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.owner)
        .bind(session.owner_type.as_str())
        .bind(&session.model_name)
        .bind(&session.provider)
        .bind(&session.parent_app)
        .bind(&session.organization_id)
        .bind(session.generation_id)
        .bind(&metadata_json)
        .bind(session.created.to_rfc3339())
        .bind(session.updated.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        for interaction in &session.interactions {
            insert_interaction(&mut tx, interaction).await?;
        }
        tx.commit().await.map_err(|e| e.to_string())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, String> {
        let row = sqlx::query(
            r#"SELECT id, name, owner, owner_type, model_name, provider, parent_app,
                      organization_id, generation_id, metadata_json, created_at, updated_at
               FROM sessions WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };

        let owner_type_raw: String = row.try_get("owner_type").map_err(|e| e.to_string())?;
        let metadata_json: String = row.try_get("metadata_json").map_err(|e| e.to_string())?;
        let mut session = Session {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            owner: row.try_get("owner").map_err(|e| e.to_string())?,
            owner_type: OwnerType::from_str(&owner_type_raw)
                .ok_or_else(|| format!("invalid owner_type: {owner_type_raw}"))?,
            model_name: row.try_get("model_name").map_err(|e| e.to_string())?,
            provider: row.try_get("provider").map_err(|e| e.to_string())?,
            parent_app: row.try_get("parent_app").map_err(|e| e.to_string())?,
            organization_id: row.try_get("organization_id").map_err(|e| e.to_string())?,
            generation_id: row.try_get("generation_id").map_err(|e| e.to_string())?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            created: parse_ts(&row, "created_at")?,
            updated: parse_ts(&row, "updated_at")?,
            interactions: Vec::new(),
        };
        session.interactions = self.list_interactions(&session.id).await?;
        Ok(Some(session))
    }

    async fn update_session(&self, session: &Session) -> Result<(), String> {
        let metadata_json = serde_json::to_string(&session.metadata).map_err(|e| e.to_string())?;
        let result = sqlx::query(
            r#"UPDATE sessions SET name = ?, model_name = ?, provider = ?, parent_app = ?,
                                   organization_id = ?, generation_id = ?, metadata_json = ?,
                                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&session.name)
        .bind(&session.model_name)
        .bind(&session.provider)
        .bind(&session.parent_app)
        .bind(&session.organization_id)
        .bind(session.generation_id)
        .bind(&metadata_json)
        .bind(Utc::now().to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Err(format!("session {} not found", session.id));
        }
        Ok(())
    }

    async fn create_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        let mut conn = self.pool.acquire().await.map_err(|e| e.to_string())?;
        insert_interaction(&mut conn, interaction).await
    }

    async fn update_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        let metadata_json =
            serde_json::to_string(&interaction.metadata).map_err(|e| e.to_string())?;
        let result = sqlx::query(
            r#"UPDATE interactions SET state = ?, response_message = ?, error = ?, finished = ?,
                                       updated_at = ?, completed_at = ?, duration_ms = ?,
                                       prompt_tokens = ?, completion_tokens = ?,
                                       total_tokens = ?, metadata_json = ?
               WHERE id = ? AND session_id = ?"#,
        )
        .bind(interaction.state.as_str())
        .bind(&interaction.response_message)
        .bind(&interaction.error)
        .bind(if interaction.finished { 1 } else { 0 })
        .bind(interaction.updated.to_rfc3339())
        .bind(interaction.completed.map(|t| t.to_rfc3339()))
        .bind(interaction.duration_ms)
        .bind(interaction.usage.prompt_tokens as i64)
        .bind(interaction.usage.completion_tokens as i64)
        .bind(interaction.usage.total_tokens as i64)
        .bind(&metadata_json)
        .bind(&interaction.id)
        .bind(&interaction.session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Err(format!("interaction {} not found", interaction.id));
        }
        Ok(())
    }

    async fn delete_interactions(&self, session_id: &str, ids: &[String]) -> Result<(), String> {
        for id in ids {
            sqlx::query("DELETE FROM interactions WHERE session_id = ? AND id = ?")
                .bind(session_id)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

async fn insert_interaction(
    conn: &mut SqliteConnection,
    interaction: &Interaction,
) -> Result<(), String> {
    let metadata_json =
        serde_json::to_string(&interaction.metadata).map_err(|e| e.to_string())?;
    sqlx::query(
        r#"INSERT INTO interactions (id, session_id, position, generation_id, creator, state,
                                     prompt_message, response_message, error, finished,
                                     created_at, updated_at, scheduled_at, completed_at,
                                     duration_ms, prompt_tokens, completion_tokens,
                                     total_tokens, metadata_json)
           VALUES (?, ?,
                   (SELECT COALESCE(MAX(position), -1) + 1 FROM interactions WHERE session_id = ?),
                   ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&interaction.id)
    .bind(&interaction.session_id)
    .bind(&interaction.session_id)
    .bind(interaction.generation_id)
    .bind(interaction.creator.as_str())
    .bind(interaction.state.as_str())
    .bind(&interaction.prompt_message)
    .bind(&interaction.response_message)
    .bind(&interaction.error)
    .bind(if interaction.finished { 1 } else { 0 })
    .bind(interaction.created.to_rfc3339())
    .bind(interaction.updated.to_rfc3339())
    .bind(interaction.scheduled.map(|t| t.to_rfc3339()))
    .bind(interaction.completed.map(|t| t.to_rfc3339()))
    .bind(interaction.duration_ms)
    .bind(interaction.usage.prompt_tokens as i64)
    .bind(interaction.usage.completion_tokens as i64)
    .bind(interaction.usage.total_tokens as i64)
    .bind(&metadata_json)
    .execute(&mut *conn)
    .await
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn row_to_interaction(row: &sqlx::sqlite::SqliteRow) -> Result<Interaction, String> {
    let creator_raw: String = row.try_get("creator").map_err(|e| e.to_string())?;
    let state_raw: String = row.try_get("state").map_err(|e| e.to_string())?;
    let metadata_json: String = row.try_get("metadata_json").map_err(|e| e.to_string())?;
    Ok(Interaction {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        session_id: row.try_get("session_id").map_err(|e| e.to_string())?,
        generation_id: row.try_get("generation_id").map_err(|e| e.to_string())?,
        creator: Creator::from_str(&creator_raw)
            .ok_or_else(|| format!("invalid creator: {creator_raw}"))?,
        state: InteractionState::from_str(&state_raw)
            .ok_or_else(|| format!("invalid state: {state_raw}"))?,
        prompt_message: row.try_get("prompt_message").map_err(|e| e.to_string())?,
        response_message: row.try_get("response_message").map_err(|e| e.to_string())?,
        error: row.try_get("error").map_err(|e| e.to_string())?,
        finished: row.try_get::<i32, _>("finished").map_err(|e| e.to_string())? == 1,
        created: parse_ts(row, "created_at")?,
        updated: parse_ts(row, "updated_at")?,
        scheduled: parse_opt_ts(row, "scheduled_at")?,
        completed: parse_opt_ts(row, "completed_at")?,
        duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
        usage: Usage {
            prompt_tokens: row.try_get::<i64, _>("prompt_tokens").unwrap_or(0).max(0) as u64,
            completion_tokens: row.try_get::<i64, _>("completion_tokens").unwrap_or(0).max(0)
                as u64,
            total_tokens: row.try_get::<i64, _>("total_tokens").unwrap_or(0).max(0) as u64,
        },
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn parse_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn parse_opt_ts(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| e.to_string())
    })
    .transpose()
}
