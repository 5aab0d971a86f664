use crate::app::AppState;
use crate::auth::header_value;
use crate::dispatcher::DispatchMode;
use crate::error::{AppError, AppResult};
use crate::handlers::{PROVIDER_HEADER, record_request};
use crate::providers::ProviderEndpoint;
use crate::upstream::join_url;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

pub const DEFAULT_PROVIDER: &str = "anthropic";

/// Inbound headers never forwarded upstream.
const STRIPPED_HEADERS: [&str; 11] = [
    "authorization",
    "x-api-key",
    "api-key",
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    PROVIDER_HEADER,
    crate::auth::ORG_HEADER,
    "x-request-id",
];

pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let principal = state.auth.authenticate(&headers, &state.user_store).await?;
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;
    let model = parsed
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let stream = parsed
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let endpoint = match header_value(&headers, PROVIDER_HEADER) {
        Some(hint) => {
            state
                .resolver
                .resolve(&principal, None, Some(hint.as_str()))
                .await?
        }
        None => {
            let mut personal = principal.clone();
            personal.organization_id = None;
            state
                .resolver
                .resolve(&personal, None, Some(DEFAULT_PROVIDER))
                .await?
        }
    };
    state
        .dispatcher
        .ensure_can_spend(&principal.user_id, &endpoint)
        .await?;

    record_request("messages", DispatchMode::from_stream_flag(stream));
    metrics::counter!(
        "relaygate_proxy_requests_total",
        "provider" => endpoint.name.clone(),
        "model" => metrics_model_name(&model).to_string()
    )
    .increment(1);
    tracing::debug!(
        owner_id = %principal.user_id,
        provider = %endpoint.name,
        model = %model,
        stream,
        "forwarding messages request"
    );

    let url = join_url(&endpoint.base_url, "/v1/messages");
    let upstream_headers = forward_headers(&headers, &endpoint);
    let resp = state
        .dispatcher
        .http()
        .post(url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            metrics::counter!(
                "relaygate_upstream_errors_total",
                "provider" => endpoint.name.clone(),
                "kind" => "network"
            )
            .increment(1);
            tracing::warn!(provider = %endpoint.name, "messages upstream unreachable: {err}");
            AppError::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", err.to_string())
                .with_type("upstream_error")
        })?;

    let status = resp.status();
    let mut out = Response::builder().status(status);
    for name in [header::CONTENT_TYPE, header::CACHE_CONTROL] {
        if let Some(value) = resp.headers().get(&name) {
            out = out.header(name, value.clone());
        }
    }
    for (name, value) in resp.headers() {
        if name.as_str().starts_with("anthropic-") || name.as_str() == "request-id" {
            out = out.header(name.clone(), value.clone());
        }
    }
    out.body(Body::from_stream(resp.bytes_stream()))
        .map_err(|err| AppError::internal("response_build_failed", err.to_string()))
}

/// Caller headers minus credentials and routing headers, plus the
/// endpoint's extra headers and its key as `x-api-key` unless an extra header
/// already set one.
fn forward_headers(inbound: &HeaderMap, endpoint: &ProviderEndpoint) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    for (name, value) in &endpoint.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(provider = %endpoint.name, header = %name, "skipping invalid endpoint header");
            continue;
        };
        out.insert(name, value);
    }
    if !out.contains_key("x-api-key") && !endpoint.api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&endpoint.api_key) {
            out.insert(HeaderName::from_static("x-api-key"), value);
        }
    }
    if !out.contains_key(header::CONTENT_TYPE) {
        out.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    out
}

/// Model name without a trailing 8-digit release date (`-20250219` or
/// `@20250219`).
pub fn metrics_model_name(model: &str) -> &str {
    let bytes = model.as_bytes();
    let n = bytes.len();
    if n > 9 && matches!(bytes[n - 9], b'-' | b'@') && bytes[n - 8..].iter().all(u8::is_ascii_digit)
    {
        return &model[..n - 9];
    }
    model
}
