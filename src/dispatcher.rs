use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::providers::ProviderEndpoint;
use crate::upstream::{self, ChunkStream, UpstreamCallError, UpstreamErrorKind};
use crate::users::{BillingErrorKind, UserStore};
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Blocking,
    Streaming,
}

impl DispatchMode {
    pub fn from_stream_flag(stream: bool) -> Self {
        if stream { Self::Streaming } else { Self::Blocking }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Streaming => "streaming",
        }
    }
}

pub enum Dispatched {
    Completion(Value),
    Stream(ChunkStream),
}

/// Sends completion requests to a resolved endpoint on behalf of a caller.
#[derive(Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
    users: UserStore,
    upstream_timeout_ms: u64,
}

impl Dispatcher {
    pub fn new(http: reqwest::Client, users: UserStore, upstream_timeout_ms: u64) -> Self {
        Self {
            http,
            users,
            upstream_timeout_ms,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Balance gate. Runs before anything is written for the request.
    pub async fn ensure_can_spend(
        &self,
        user_id: &str,
        endpoint: &ProviderEndpoint,
    ) -> AppResult<()> {
        if !endpoint.billing_enabled {
            return Ok(());
        }
        match self.users.ensure_user_can_spend(user_id).await {
            Ok(()) => Ok(()),
            Err(err) => match err.kind {
                BillingErrorKind::InsufficientBalance => {
                    tracing::debug!(user_id, provider = %endpoint.name, "insufficient balance");
                    Err(AppError::new(
                        StatusCode::PAYMENT_REQUIRED,
                        "insufficient_balance",
                        "insufficient balance",
                    ))
                }
                BillingErrorKind::NotFound => Err(AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "user not found",
                )),
                BillingErrorKind::InvalidStoredBalance | BillingErrorKind::Internal => {
                    tracing::error!(user_id, "balance check failed: {}", err.message);
                    Err(AppError::internal("internal_error", err.message))
                }
            },
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        endpoint: &ProviderEndpoint,
        request: &Value,
        mode: DispatchMode,
    ) -> Result<Dispatched, UpstreamCallError> {
        match mode {
            DispatchMode::Blocking => self
                .complete(ctx, endpoint, request)
                .await
                .map(Dispatched::Completion),
            DispatchMode::Streaming => self
                .stream(ctx, endpoint, request)
                .await
                .map(Dispatched::Stream),
        }
    }

    pub async fn complete(
        &self,
        ctx: &RequestContext,
        endpoint: &ProviderEndpoint,
        request: &Value,
    ) -> Result<Value, UpstreamCallError> {
        let started = Instant::now();
        let body = prepare_request(request.clone(), DispatchMode::Blocking);
        let result =
            upstream::call_chat_completion(&self.http, endpoint, &body, self.upstream_timeout_ms)
                .await;
        observe(ctx, endpoint, DispatchMode::Blocking, started, result.as_ref().err());
        result
    }

    /// Opens the upstream stream. Errors here happen before any chunk arrived.
    pub async fn stream(
        &self,
        ctx: &RequestContext,
        endpoint: &ProviderEndpoint,
        request: &Value,
    ) -> Result<ChunkStream, UpstreamCallError> {
        let started = Instant::now();
        let body = prepare_request(request.clone(), DispatchMode::Streaming);
        let result = upstream::open_chat_stream(&self.http, endpoint, &body).await;
        observe(ctx, endpoint, DispatchMode::Streaming, started, result.as_ref().err());
        result
    }
}

fn observe(
    ctx: &RequestContext,
    endpoint: &ProviderEndpoint,
    mode: DispatchMode,
    started: Instant,
    err: Option<&UpstreamCallError>,
) {
    metrics::histogram!(
        "relaygate_request_duration_seconds",
        "provider" => endpoint.name.clone(),
        "mode" => mode.as_str()
    )
    .record(started.elapsed().as_secs_f64());

    if let Some(err) = err {
        record_upstream_error(&endpoint.name, err);
        tracing::warn!(
            owner_id = %ctx.owner_id(),
            organization_id = %ctx.organization_id(),
            session_id = %ctx.session_id(),
            interaction_id = %ctx.interaction_id(),
            provider = %endpoint.name,
            request_bytes = ctx.original_request().len(),
            "upstream call failed: {}",
            err.message
        );
    }
}

pub fn record_upstream_error(provider: &str, err: &UpstreamCallError) {
    let kind = match err.kind {
        UpstreamErrorKind::Network => "network",
        UpstreamErrorKind::Http => "http",
    };
    metrics::counter!(
        "relaygate_upstream_errors_total",
        "provider" => provider.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Pins the `stream` flag to the dispatch mode and leaves every other field
/// as the caller sent it.
pub fn prepare_request(mut request: Value, mode: DispatchMode) -> Value {
    if let Some(obj) = request.as_object_mut() {
        match mode {
            DispatchMode::Streaming => {
                obj.insert("stream".to_string(), Value::Bool(true));
            }
            DispatchMode::Blocking => {
                obj.remove("stream");
                obj.remove("stream_options");
            }
        }
    }
    request
}

pub fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    let status = err
        .status
        .filter(|s| s.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = err.code.unwrap_or_else(|| "upstream_error".to_string());
    AppError::new(status, code, err.message).with_type("upstream_error")
}

/// Text of the first choice of a blocking completion.
pub fn completion_text(completion: &Value) -> String {
    completion
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
