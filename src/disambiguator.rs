use crate::auth::Principal;
use crate::providers::ProviderEndpoint;
use crate::resolver::Resolver;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CatalogEntry {
    models: Vec<String>,
    fetched_at: Instant,
}

/// Model lists fetched from upstream providers, keyed by provider name and
/// the owner who fetched them. Expired entries read as absent.
#[derive(Clone)]
pub struct ModelCatalog {
    inner: Arc<RwLock<HashMap<(String, String), CatalogEntry>>>,
    ttl: Duration,
}

impl ModelCatalog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn store(&self, provider: &str, owner_id: &str, models: Vec<String>) {
        let mut guard = self.inner.write().await;
        guard.insert(
            (provider.to_string(), owner_id.to_string()),
            CatalogEntry {
                models,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn cached(&self, provider: &str, owner_id: &str) -> Option<Vec<String>> {
        let guard = self.inner.read().await;
        guard
            .get(&(provider.to_string(), owner_id.to_string()))
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.models.clone())
    }

    async fn lists(&self, provider: &str, owner_id: &str, model: &str) -> bool {
        let guard = self.inner.read().await;
        guard
            .get(&(provider.to_string(), owner_id.to_string()))
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .is_some_and(|entry| entry.models.iter().any(|m| m == model))
    }
}

/// Outcome of splitting a raw model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disambiguation {
    /// Provider implied by the model string, if any.
    pub provider: Option<String>,
    pub model: String,
}

impl Disambiguation {
    fn unchanged(model: &str) -> Self {
        Self {
            provider: None,
            model: model.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Disambiguator {
    catalog: ModelCatalog,
    resolver: Resolver,
}

impl Disambiguator {
    pub fn new(catalog: ModelCatalog, resolver: Resolver) -> Self {
        Self { catalog, resolver }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn disambiguate(
        &self,
        principal: &Principal,
        model: &str,
    ) -> Result<Disambiguation, String> {
        if !model.contains('/') {
            return Ok(Disambiguation::unchanged(model));
        }
        let candidates = self.resolver.accessible_endpoints(principal).await?;
        Ok(disambiguate_among(&self.catalog, &candidates, &principal.user_id, model).await)
    }
}

/// A full-string catalog hit on exactly one provider beats prefix parsing;
/// otherwise a prefix naming a known provider is split off.
pub async fn disambiguate_among(
    catalog: &ModelCatalog,
    candidates: &[ProviderEndpoint],
    owner_id: &str,
    model: &str,
) -> Disambiguation {
    if !model.contains('/') {
        return Disambiguation::unchanged(model);
    }

    let mut listing: BTreeSet<&str> = BTreeSet::new();
    for endpoint in candidates {
        let static_hit = endpoint.models.iter().any(|m| m == model);
        if static_hit || catalog.lists(&endpoint.name, owner_id, model).await {
            listing.insert(endpoint.name.as_str());
        }
    }
    if listing.len() == 1 {
        if let Some(provider) = listing.into_iter().next() {
            return Disambiguation {
                provider: Some(provider.to_string()),
                model: model.to_string(),
            };
        }
    } else if listing.len() > 1 {
        tracing::debug!(model, providers = ?listing, "model listed by several providers");
    }

    if let Some((prefix, rest)) = model.split_once('/') {
        if !prefix.is_empty() && candidates.iter().any(|e| e.name == prefix) {
            return Disambiguation {
                provider: Some(prefix.to_string()),
                model: rest.to_string(),
            };
        }
    }
    Disambiguation::unchanged(model)
}
