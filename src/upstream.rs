use crate::providers::ProviderEndpoint;
use axum::http::StatusCode;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Parsed `chat.completion.chunk` objects, ending at the upstream `[DONE]`.
pub type ChunkStream = BoxStream<'static, Result<Value, UpstreamCallError>>;

pub async fn call_chat_completion(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    body: &Value,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = post_json(client, endpoint, "/v1/chat/completions", body, Some(timeout_ms)).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    serde_json::from_str(&text)
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string()))
}

pub async fn open_chat_stream(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    body: &Value,
) -> Result<ChunkStream, UpstreamCallError> {
    let resp = post_json(client, endpoint, "/v1/chat/completions", body, None).await?;
    let stream = resp
        .bytes_stream()
        .eventsource()
        .take_while(|ev| {
            let done = matches!(ev, Ok(event) if event.data.trim() == "[DONE]");
            futures_util::future::ready(!done)
        })
        .filter_map(|ev| async move {
            match ev {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(parse_chunk(&event.data)),
                Err(err) => Some(Err(UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    None,
                    err.to_string(),
                ))),
            }
        });
    Ok(stream.boxed())
}

pub async fn list_models(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    timeout_ms: u64,
) -> Result<Vec<String>, UpstreamCallError> {
    let req = client
        .get(join_url(&endpoint.base_url, "/v1/models"))
        .timeout(std::time::Duration::from_millis(timeout_ms));
    let resp = send(apply_endpoint_auth(req, endpoint)).await?;
    let status = resp.status();
    let value: Value = resp.json().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })?;
    let ids = value
        .get("data")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ids)
}

async fn post_json(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    path: &str,
    body: &Value,
    timeout_ms: Option<u64>,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client.post(join_url(&endpoint.base_url, path)).json(body);
    if let Some(timeout_ms) = timeout_ms {
        req = req.timeout(std::time::Duration::from_millis(timeout_ms));
    }
    send(apply_endpoint_auth(req, endpoint)).await
}

fn apply_endpoint_auth(
    mut req: reqwest::RequestBuilder,
    endpoint: &ProviderEndpoint,
) -> reqwest::RequestBuilder {
    if !endpoint.api_key.is_empty() {
        req = req.bearer_auth(&endpoint.api_key);
    }
    for (k, v) in &endpoint.headers {
        req = req.header(k.as_str(), v.as_str());
    }
    req
}

async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

fn parse_chunk(data: &str) -> Result<Value, UpstreamCallError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Http, None, err.to_string()))?;
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(UpstreamCallError::new(UpstreamErrorKind::Http, None, message)
            .with_code(extract_error_code(data)));
    }
    Ok(value)
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
