use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

/// Ids minted by the store carry this prefix; a provider hint starting with
/// it is looked up by id rather than by name.
pub const ENDPOINT_ID_PREFIX: &str = "prov_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    User,
    Org,
    System,
}

impl OwnerType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "org" => Some(Self::Org),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Org => "org",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Global,
    User,
    Org,
}

impl EndpointType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "user" => Some(Self::User),
            "org" => Some(Self::Org),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Org => "org",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub owner: String,
    pub owner_type: OwnerType,
    pub endpoint_type: EndpointType,
    pub billing_enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Set for endpoints synthesized from environment configuration.
    #[serde(default)]
    pub builtin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderEndpoint {
    /// Organization id to propagate with the request, empty unless the
    /// endpoint is organization-owned.
    pub fn organization_id(&self) -> &str {
        if self.owner_type == OwnerType::Org {
            &self.owner
        } else {
            ""
        }
    }

    pub fn masked(mut self) -> Self {
        if !self.api_key.is_empty() {
            self.api_key = "********".to_string();
        }
        self
    }
}

/// Which slice of the endpoint table a lookup may see.
#[derive(Debug, Clone, Copy)]
pub enum EndpointScope<'a> {
    Organization(&'a str),
    /// The caller's own endpoints plus global ones.
    Personal(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSelector<'a> {
    Id(&'a str),
    Name(&'a str),
}

impl<'a> EndpointSelector<'a> {
    pub fn parse(hint: &'a str) -> Self {
        if hint.starts_with(ENDPOINT_ID_PREFIX) {
            Self::Id(hint)
        } else {
            Self::Name(hint)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointInput {
    pub id: Option<String>,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub owner: String,
    pub owner_type: OwnerType,
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub billing_enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Clone)]
pub struct ProviderStore {
    pool: Pool<Sqlite>,
}

const ENDPOINT_COLUMNS: &str = "id, name, base_url, api_key, owner, owner_type, endpoint_type, \
     billing_enabled, models_json, headers_json, created_at, updated_at";

impl ProviderStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS provider_endpoints (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL DEFAULT '',
                owner_type TEXT NOT NULL CHECK (owner_type IN ('user', 'org', 'system')),
                endpoint_type TEXT NOT NULL CHECK (endpoint_type IN ('global', 'user', 'org')),
                billing_enabled INTEGER NOT NULL DEFAULT 0,
                models_json TEXT NOT NULL DEFAULT '[]',
                headers_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_provider_endpoints_owner ON provider_endpoints(owner, owner_type)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_endpoint(
        &self,
        input: CreateEndpointInput,
    ) -> Result<ProviderEndpoint, String> {
        if input.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if input.base_url.trim().is_empty() {
            return Err("base_url is required".to_string());
        }
        let id = input.id.unwrap_or_else(|| {
            format!(
                "{ENDPOINT_ID_PREFIX}{}",
                uuid::Uuid::new_v4().to_string().replace("-", "")
            )
        });
        let now = Utc::now();
        let models_json = serde_json::to_string(&input.models).map_err(|e| e.to_string())?;
        let headers_json = serde_json::to_string(&input.headers).map_err(|e| e.to_string())?;

        sqlx::query(
            r#"INSERT INTO provider_endpoints (id, name, base_url, api_key, owner, owner_type,
                                               endpoint_type, billing_enabled, models_json,
                                               headers_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.base_url)
        .bind(&input.api_key)
        .bind(&input.owner)
        .bind(input.owner_type.as_str())
        .bind(input.endpoint_type.as_str())
        .bind(if input.billing_enabled { 1 } else { 0 })
        .bind(&models_json)
        .bind(&headers_json)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(ProviderEndpoint {
            id,
            name: input.name,
            base_url: input.base_url,
            api_key: input.api_key,
            owner: input.owner,
            owner_type: input.owner_type,
            endpoint_type: input.endpoint_type,
            billing_enabled: input.billing_enabled,
            models: input.models,
            headers: input.headers,
            builtin: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Finds a single endpoint within `scope`. For a personal scope the
    /// caller's own record wins over a global one with the same name.
    pub async fn get_endpoint(
        &self,
        scope: EndpointScope<'_>,
        selector: EndpointSelector<'_>,
    ) -> Result<Option<ProviderEndpoint>, String> {
        let (key_column, key) = match selector {
            EndpointSelector::Id(id) => ("id", id),
            EndpointSelector::Name(name) => ("name", name),
        };
        let row = match scope {
            EndpointScope::Organization(org_id) => {
                sqlx::query(&format!(
                    "SELECT {ENDPOINT_COLUMNS} FROM provider_endpoints
                     WHERE {key_column} = ? AND owner = ? AND owner_type = 'org'
                     LIMIT 1"
                ))
                .bind(key)
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await
            }
            EndpointScope::Personal(user_id) => {
                sqlx::query(&format!(
                    "SELECT {ENDPOINT_COLUMNS} FROM provider_endpoints
                     WHERE {key_column} = ?
                       AND ((owner = ? AND owner_type = 'user') OR endpoint_type = 'global')
                     ORDER BY CASE WHEN owner = ? AND owner_type = 'user' THEN 0 ELSE 1 END,
                              created_at ASC
                     LIMIT 1"
                ))
                .bind(key)
                .bind(user_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| e.to_string())?;

        row.map(|row| row_to_endpoint(&row)).transpose()
    }

    pub async fn list_endpoints(
        &self,
        scope: EndpointScope<'_>,
    ) -> Result<Vec<ProviderEndpoint>, String> {
        let rows = match scope {
            EndpointScope::Organization(org_id) => {
                sqlx::query(&format!(
                    "SELECT {ENDPOINT_COLUMNS} FROM provider_endpoints
                     WHERE owner = ? AND owner_type = 'org'
                     ORDER BY name ASC"
                ))
                .bind(org_id)
                .fetch_all(&self.pool)
                .await
            }
            EndpointScope::Personal(user_id) => {
                sqlx::query(&format!(
                    "SELECT {ENDPOINT_COLUMNS} FROM provider_endpoints
                     WHERE (owner = ? AND owner_type = 'user') OR endpoint_type = 'global'
                     ORDER BY name ASC"
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_endpoint).collect()
    }
}

fn row_to_endpoint(row: &sqlx::sqlite::SqliteRow) -> Result<ProviderEndpoint, String> {
    let owner_type_raw: String = row.try_get("owner_type").map_err(|e| e.to_string())?;
    let owner_type = OwnerType::from_str(&owner_type_raw)
        .ok_or_else(|| format!("invalid owner_type: {owner_type_raw}"))?;
    let endpoint_type_raw: String = row.try_get("endpoint_type").map_err(|e| e.to_string())?;
    let endpoint_type = EndpointType::from_str(&endpoint_type_raw)
        .ok_or_else(|| format!("invalid endpoint_type: {endpoint_type_raw}"))?;
    let models_json: String = row.try_get("models_json").map_err(|e| e.to_string())?;
    let headers_json: String = row.try_get("headers_json").map_err(|e| e.to_string())?;

    Ok(ProviderEndpoint {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        base_url: row.try_get("base_url").map_err(|e| e.to_string())?,
        api_key: row.try_get("api_key").map_err(|e| e.to_string())?,
        owner: row.try_get("owner").map_err(|e| e.to_string())?,
        owner_type,
        endpoint_type,
        billing_enabled: row
            .try_get::<i32, _>("billing_enabled")
            .map_err(|e| e.to_string())?
            == 1,
        models: serde_json::from_str(&models_json).unwrap_or_default(),
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        builtin: false,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn parse_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}
