use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
    /// Signed nano-dollar string balance.
    pub balance_nano_usd: String,
    /// Unlimited balance bypass flag.
    pub balance_unlimited: bool,
}

#[derive(Debug, Clone)]
pub struct UserBalance {
    pub user_id: String,
    pub balance_nano_usd: i128,
    pub balance_unlimited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingErrorKind {
    NotFound,
    InsufficientBalance,
    InvalidStoredBalance,
    Internal,
}

#[derive(Debug, Clone)]
pub struct BillingError {
    pub kind: BillingErrorKind,
    pub message: String,
}

impl BillingError {
    fn new(kind: BillingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                balance_nano_usd TEXT NOT NULL DEFAULT '0',
                balance_unlimited INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS organization_members (
                organization_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                created_at TEXT NOT NULL,
                PRIMARY KEY (organization_id, user_id)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    fn hash_secret(secret: &str) -> Result<String, String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| e.to_string())
    }

    fn verify_secret(secret: &str, hash: &str) -> Result<bool, String> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| e.to_string())?;
        Ok(Argon2::default()
            .verify_password(secret.as_bytes(), &parsed_hash)
            .is_ok())
    }

    pub async fn create_user(&self, username: &str) -> Result<User, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO users (id, username, created_at, enabled, balance_nano_usd, balance_unlimited)
               VALUES (?, ?, ?, 1, '0', 0)"#,
        )
        .bind(&id)
        .bind(username)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(User {
            id,
            username: username.to_string(),
            created_at: now,
            enabled: true,
            balance_nano_usd: "0".to_string(),
            balance_unlimited: false,
        })
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            "SELECT id, username, created_at, enabled, balance_nano_usd, balance_unlimited FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.map(|row| row_to_user(&row)).transpose()
    }

    /// Overwrites the stored balance. Used by operator tooling and tests; the
    /// gateway itself never charges.
    pub async fn set_balance(
        &self,
        user_id: &str,
        balance_nano_usd: &str,
        balance_unlimited: bool,
    ) -> Result<(), String> {
        parse_nano_usd(balance_nano_usd)?;
        sqlx::query("UPDATE users SET balance_nano_usd = ?, balance_unlimited = ? WHERE id = ?")
            .bind(balance_nano_usd)
            .bind(if balance_unlimited { 1 } else { 0 })
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn create_api_key(
        &self,
        user_id: &str,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ApiKey, String), String> {
        let id = uuid::Uuid::new_v4().to_string();
        let key = format!("sk-{}", uuid::Uuid::new_v4().to_string().replace("-", ""));
        let key_prefix = key[..12].to_string();
        let key_hash = Self::hash_secret(&key)?;
        let now = Utc::now();

        sqlx::query(
            r#"INSERT INTO api_keys (id, user_id, name, key_prefix, key_hash, created_at, expires_at, enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, 1)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(name)
        .bind(&key_prefix)
        .bind(&key_hash)
        .bind(now.to_rfc3339())
        .bind(expires_at.map(|e| e.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let api_key = ApiKey {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            key_prefix,
            key_hash,
            created_at: now,
            expires_at,
            enabled: true,
        };
        Ok((api_key, key))
    }

    pub async fn validate_api_key(&self, key: &str) -> Result<Option<(ApiKey, User)>, String> {
        if key.len() < 12 {
            return Ok(None);
        }
        let prefix = &key[..12];

        let rows = sqlx::query(
            "SELECT id, user_id, name, key_prefix, key_hash, created_at, expires_at, enabled FROM api_keys WHERE key_prefix = ?",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        for row in rows {
            let api_key = row_to_api_key(&row)?;
            if !api_key.enabled {
                continue;
            }
            if let Some(expires_at) = api_key.expires_at {
                if expires_at < Utc::now() {
                    continue;
                }
            }
            if !Self::verify_secret(key, &api_key.key_hash)? {
                continue;
            }
            let Some(user) = self.get_user_by_id(&api_key.user_id).await? else {
                return Ok(None);
            };
            if !user.enabled {
                return Ok(None);
            }
            return Ok(Some((api_key, user)));
        }
        Ok(None)
    }

    pub async fn add_org_member(
        &self,
        organization_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO organization_members (organization_id, user_id, role, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (organization_id, user_id) DO UPDATE SET role = excluded.role"#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_org_membership(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRole>, String> {
        let row = sqlx::query(
            "SELECT role FROM organization_members WHERE organization_id = ? AND user_id = ?",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let role: String = row.try_get("role").map_err(|e| e.to_string())?;
        Ok(MemberRole::from_str(&role))
    }

    pub async fn get_user_balance(&self, user_id: &str) -> Result<Option<UserBalance>, String> {
        let row =
            sqlx::query("SELECT id, balance_nano_usd, balance_unlimited FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let balance_raw: String = row
            .try_get("balance_nano_usd")
            .unwrap_or_else(|_| "0".to_string());
        let balance_nano_usd = parse_nano_usd(&balance_raw)?;
        Ok(Some(UserBalance {
            user_id: row.try_get("id").map_err(|e| e.to_string())?,
            balance_nano_usd,
            balance_unlimited: row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1,
        }))
    }

    pub async fn ensure_user_can_spend(&self, user_id: &str) -> Result<(), BillingError> {
        let Some(balance) = self.get_user_balance(user_id).await.map_err(|e| {
            if e.starts_with("invalid balance") {
                BillingError::new(BillingErrorKind::InvalidStoredBalance, e)
            } else {
                BillingError::new(BillingErrorKind::Internal, e)
            }
        })?
        else {
            return Err(BillingError::new(
                BillingErrorKind::NotFound,
                "user not found",
            ));
        };

        if balance.balance_unlimited {
            return Ok(());
        }
        if balance.balance_nano_usd <= 0 {
            return Err(BillingError::new(
                BillingErrorKind::InsufficientBalance,
                "insufficient balance",
            ));
        }
        Ok(())
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(|e| e.to_string())?)?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        balance_nano_usd: row
            .try_get("balance_nano_usd")
            .map_err(|e| e.to_string())?,
        balance_unlimited: row
            .try_get::<i32, _>("balance_unlimited")
            .map_err(|e| e.to_string())?
            == 1,
    })
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    let expires_at: Option<String> = row.try_get("expires_at").map_err(|e| e.to_string())?;
    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
        key_hash: row.try_get("key_hash").map_err(|e| e.to_string())?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(|e| e.to_string())?)?,
        expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

pub fn parse_nano_usd(value: &str) -> Result<i128, String> {
    value
        .trim()
        .parse::<i128>()
        .map_err(|_| format!("invalid balance value: {value}"))
}
