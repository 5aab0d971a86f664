use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

/// An assistant configured on an app (project). The first assistant is the
/// app's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub rag_source_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub organization_id: String,
    pub assistants: Vec<AssistantConfig>,
    pub created_at: DateTime<Utc>,
}

impl App {
    /// Picks the assistant by id, or the default one when no id is given.
    pub fn assistant(&self, assistant_id: Option<&str>) -> Option<&AssistantConfig> {
        match assistant_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .assistants
                .iter()
                .find(|a| a.id == id || a.name == id),
            None => self.assistants.first(),
        }
    }
}

#[derive(Clone)]
pub struct AppStore {
    pool: Pool<Sqlite>,
}

impl AppStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                organization_id TEXT NOT NULL DEFAULT '',
                assistants_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    pub async fn create_app(
        &self,
        owner: &str,
        organization_id: &str,
        assistants: Vec<AssistantConfig>,
    ) -> Result<App, String> {
        let id = format!("app_{}", uuid::Uuid::new_v4().to_string().replace("-", ""));
        let now = Utc::now();
        let assistants_json = serde_json::to_string(&assistants).map_err(|e| e.to_string())?;
        sqlx::query(
            "INSERT INTO apps (id, owner, organization_id, assistants_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner)
        .bind(organization_id)
        .bind(&assistants_json)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(App {
            id,
            owner: owner.to_string(),
            organization_id: organization_id.to_string(),
            assistants,
            created_at: now,
        })
    }

    pub async fn get_app(&self, id: &str) -> Result<Option<App>, String> {
        let row = sqlx::query(
            "SELECT id, owner, organization_id, assistants_json, created_at FROM apps WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let assistants_json: String = row.try_get("assistants_json").map_err(|e| e.to_string())?;
        let created_at: String = row.try_get("created_at").map_err(|e| e.to_string())?;
        Ok(Some(App {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            owner: row.try_get("owner").map_err(|e| e.to_string())?,
            organization_id: row.try_get("organization_id").map_err(|e| e.to_string())?,
            assistants: serde_json::from_str(&assistants_json).map_err(|e| e.to_string())?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc),
        }))
    }
}
