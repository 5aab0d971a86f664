use crate::error::{AppError, AppResult};
use crate::users::UserStore;
use axum::http::{HeaderMap, StatusCode};

pub const ORG_HEADER: &str = "x-org-id";

/// The authenticated caller of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub api_key_id: Option<String>,
    /// Organization the caller is acting for, from `X-Org-ID`. Membership is
    /// not verified here; the resolver checks it when it matters.
    pub organization_id: Option<String>,
}

#[derive(Clone)]
pub struct AuthState;

impl AuthState {
    pub fn new() -> Self {
        Self
    }

    /// Authenticate a database API key.
    pub async fn authenticate_token(&self, token: &str, user_store: &UserStore) -> Option<Principal> {
        if !token.starts_with("sk-") || token.len() < 12 {
            return None;
        }
        match user_store.validate_api_key(token).await {
            Ok(Some((api_key, user))) => Some(Principal {
                user_id: user.id,
                api_key_id: Some(api_key.id),
                organization_id: None,
            }),
            Ok(None) => None,
            Err(err) => {
                tracing::error!("api key lookup failed: {err}");
                None
            }
        }
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        user_store: &UserStore,
    ) -> AppResult<Principal> {
        let token = bearer_token(headers)?;
        let mut principal = self
            .authenticate_token(token, user_store)
            .await
            .ok_or_else(|| {
                AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token")
            })?;
        principal.organization_id = header_value(headers, ORG_HEADER);
        Ok(principal)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing auth"))?;
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid auth"))
}

/// Reads a header as a trimmed, non-empty string.
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
