//! Provider endpoint resolution.
//!
//! Order, first match wins:
//! 1. an app assistant's configured provider (no fall-through when the
//!    assistant has none);
//! 2. an explicit hint while acting for an organization: membership is
//!    checked and only that organization's endpoints are searched;
//! 3. the caller's own endpoints, then global ones;
//! 4. a built-in provider synthesized from the environment.
//!
//! A missing hint becomes the default built-in name, but only at the top
//! level; the organization branch is never entered without an explicit hint.

use crate::apps::{App, AssistantConfig};
use crate::auth::Principal;
use crate::config::BuiltinProviders;
use crate::error::AppError;
use crate::providers::{
    EndpointScope, EndpointSelector, EndpointType, OwnerType, ProviderEndpoint, ProviderStore,
};
use crate::users::UserStore;
use axum::http::StatusCode;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("provider not found: {provider}")]
    NotFound { provider: String },
    #[error("organization membership required for {organization_id}")]
    MembershipRequired { organization_id: String },
    #[error("built-in provider {provider} is not configured: {reason}")]
    BuiltinNotConfigured { provider: String, reason: String },
    #[error("no provider configured for assistant {assistant}")]
    NoProviderConfigured { assistant: String },
    #[error("provider lookup failed for {provider}: {message}")]
    Store { provider: String, message: String },
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        let message = err.to_string();
        match err {
            ResolveError::NotFound { .. } => {
                AppError::new(StatusCode::NOT_FOUND, "provider_not_found", message)
            }
            ResolveError::MembershipRequired { .. } => {
                AppError::new(StatusCode::FORBIDDEN, "forbidden", message)
                    .with_type("permission_error")
            }
            ResolveError::BuiltinNotConfigured { .. } => {
                AppError::internal("provider_not_configured", message)
            }
            ResolveError::NoProviderConfigured { .. } => {
                AppError::internal("no_provider_configured", message)
            }
            ResolveError::Store { .. } => AppError::internal("provider_store_error", message),
        }
    }
}

/// The assistant a request runs under, when it addresses an app.
#[derive(Debug, Clone, Copy)]
pub struct AssistantScope<'a> {
    pub app: &'a App,
    pub assistant: &'a AssistantConfig,
}

#[derive(Clone)]
pub struct Resolver {
    providers: ProviderStore,
    users: UserStore,
    builtins: Arc<BuiltinProviders>,
}

impl Resolver {
    pub fn new(providers: ProviderStore, users: UserStore, builtins: Arc<BuiltinProviders>) -> Self {
        Self {
            providers,
            users,
            builtins,
        }
    }

    pub fn builtins(&self) -> &BuiltinProviders {
        &self.builtins
    }

    pub async fn resolve(
        &self,
        principal: &Principal,
        assistant: Option<AssistantScope<'_>>,
        hint: Option<&str>,
    ) -> Result<ProviderEndpoint, ResolveError> {
        if let Some(scope) = assistant {
            let provider = scope.assistant.provider.trim();
            if provider.is_empty() {
                return Err(ResolveError::NoProviderConfigured {
                    assistant: scope.assistant.id.clone(),
                });
            }
            if !scope.app.organization_id.is_empty() {
                // Org-owned apps may still name a built-in provider.
                return match self
                    .resolve_for_organization(principal, &scope.app.organization_id, provider)
                    .await
                {
                    Err(ResolveError::NotFound { .. }) => self.builtin_endpoint(provider),
                    other => other,
                };
            }
            return self.resolve_personal(principal, provider).await;
        }

        let explicit = hint.map(str::trim).filter(|h| !h.is_empty());
        match (explicit, principal.organization_id.as_deref()) {
            (Some(provider), Some(org_id)) => {
                self.resolve_for_organization(principal, org_id, provider)
                    .await
            }
            (Some(provider), None) => self.resolve_personal(principal, provider).await,
            (None, _) => {
                let default = self.builtins.default_provider.clone();
                self.resolve_personal(principal, &default).await
            }
        }
    }

    async fn resolve_for_organization(
        &self,
        principal: &Principal,
        org_id: &str,
        provider: &str,
    ) -> Result<ProviderEndpoint, ResolveError> {
        self.authorize_member(principal, org_id).await?;
        let found = self
            .providers
            .get_endpoint(
                EndpointScope::Organization(org_id),
                EndpointSelector::parse(provider),
            )
            .await
            .map_err(|message| ResolveError::Store {
                provider: provider.to_string(),
                message,
            })?;
        found.ok_or_else(|| ResolveError::NotFound {
            provider: provider.to_string(),
        })
    }

    async fn resolve_personal(
        &self,
        principal: &Principal,
        provider: &str,
    ) -> Result<ProviderEndpoint, ResolveError> {
        let found = self
            .providers
            .get_endpoint(
                EndpointScope::Personal(&principal.user_id),
                EndpointSelector::parse(provider),
            )
            .await
            .map_err(|message| ResolveError::Store {
                provider: provider.to_string(),
                message,
            })?;
        if let Some(endpoint) = found {
            return Ok(endpoint);
        }
        self.builtin_endpoint(provider)
    }

    async fn authorize_member(
        &self,
        principal: &Principal,
        org_id: &str,
    ) -> Result<(), ResolveError> {
        match self.users.get_org_membership(org_id, &principal.user_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                tracing::warn!(
                    user_id = %principal.user_id,
                    organization_id = %org_id,
                    "caller is not a member of the organization"
                );
                Err(ResolveError::MembershipRequired {
                    organization_id: org_id.to_string(),
                })
            }
            Err(message) => Err(ResolveError::Store {
                provider: String::new(),
                message,
            }),
        }
    }

    /// Synthesizes the endpoint for a built-in provider from environment
    /// configuration.
    pub fn builtin_endpoint(&self, provider: &str) -> Result<ProviderEndpoint, ResolveError> {
        let Some(cfg) = self.builtins.get(provider) else {
            return Err(ResolveError::NotFound {
                provider: provider.to_string(),
            });
        };
        let api_key = cfg
            .current_api_key()
            .map_err(|reason| ResolveError::BuiltinNotConfigured {
                provider: provider.to_string(),
                reason,
            })?;
        let now = Utc::now();
        Ok(ProviderEndpoint {
            id: cfg.name.clone(),
            name: cfg.name.clone(),
            base_url: cfg.base_url.clone(),
            api_key,
            owner: "system".to_string(),
            owner_type: OwnerType::System,
            endpoint_type: EndpointType::Global,
            billing_enabled: self.builtins.billing_enabled,
            models: Vec::new(),
            headers: HashMap::new(),
            builtin: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Every endpoint the caller may route to: the caller's own and global
    /// database endpoints plus configured built-ins not shadowed by a
    /// database endpoint of the same name. User endpoints sort first, then
    /// global ones, each by name.
    pub async fn accessible_endpoints(
        &self,
        principal: &Principal,
    ) -> Result<Vec<ProviderEndpoint>, String> {
        let mut out = self
            .providers
            .list_endpoints(EndpointScope::Personal(&principal.user_id))
            .await?;
        let builtins: Vec<ProviderEndpoint> = self
            .builtins
            .configured()
            .filter(|cfg| !out.iter().any(|e| e.name == cfg.name))
            .filter_map(|cfg| self.builtin_endpoint(&cfg.name).ok())
            .collect();
        out.extend(builtins);
        out.sort_by(|a, b| {
            let rank = |e: &ProviderEndpoint| u8::from(e.endpoint_type != EndpointType::User);
            rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }
}
