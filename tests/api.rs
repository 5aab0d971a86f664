use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::response::Sse;
use axum::response::sse::Event;
use axum::routing::{get, post};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use relaygate::apps::AssistantConfig;
use relaygate::config::{BuiltinProviderConfig, BuiltinProviders};
use relaygate::providers::{CreateEndpointInput, EndpointType, OwnerType};
use relaygate::relay::CANCELLED_MESSAGE;
use relaygate::sessions::{Interaction, InteractionState, Session};
use relaygate::store::{SessionStore, SqliteSessionStore};
use relaygate::users::MemberRole;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const FAILING_MODEL: &str = "fail-model";
/// Streams two content chunks, then an error event.
const BROKEN_STREAM_MODEL: &str = "broken-stream";
/// Streams one content chunk and then never finishes.
const STALLING_MODEL: &str = "stall-model";
const MAX_BODY_BYTES: usize = 64 * 1024;

type Captured = Arc<Mutex<Vec<(String, String)>>>;

struct TestContext {
    router: axum::Router,
    auth_header: String,
    broke_auth_header: String,
    user_id: String,
    state: relaygate::app::AppState,
    counters: Arc<Counters>,
    captured: Captured,
    _temp_dir: TempDir,
}

#[derive(Default)]
struct Counters {
    sessions_created: AtomicUsize,
    interaction_updates: AtomicUsize,
}

/// Session store that counts writes before handing them to sqlite.
struct CountingStore {
    inner: SqliteSessionStore,
    counters: Arc<Counters>,
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn create_session(&self, session: &Session) -> Result<(), String> {
        self.counters.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_session(session).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, String> {
        self.inner.get_session(id).await
    }

    async fn update_session(&self, session: &Session) -> Result<(), String> {
        self.inner.update_session(session).await
    }

    async fn create_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        self.inner.create_interaction(interaction).await
    }

    async fn update_interaction(&self, interaction: &Interaction) -> Result<(), String> {
        self.counters
            .interaction_updates
            .fetch_add(1, Ordering::SeqCst);
        self.inner.update_interaction(interaction).await
    }

    async fn delete_interactions(&self, session_id: &str, ids: &[String]) -> Result<(), String> {
        self.inner.delete_interactions(session_id, ids).await
    }
}

fn capture(captured: &Captured, name: &str, headers: &HeaderMap) {
    if let Some(v) = headers.get(name).and_then(|h| h.to_str().ok()) {
        if let Ok(mut lock) = captured.lock() {
            lock.push((name.to_string(), v.to_string()));
        }
    }
}

fn last_user_text(body: &Value) -> String {
    body.get("messages")
        .and_then(|v| v.as_array())
        .and_then(|msgs| {
            msgs.iter()
                .rev()
                .find(|m| m.get("role").and_then(|v| v.as_str()) == Some("user"))
        })
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn stream_chunk(model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }]
    })
}

async fn start_upstream() -> (SocketAddr, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));

    async fn chat(
        axum::extract::State(captured): axum::extract::State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        capture(&captured, "authorization", &headers);
        let system = body
            .get("messages")
            .and_then(|v| v.get(0))
            .filter(|m| m.get("role").and_then(|v| v.as_str()) == Some("system"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str());
        if let (Some(system), Ok(mut lock)) = (system, captured.lock()) {
            lock.push(("system".to_string(), system.to_string()));
        }
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("mock")
            .to_string();
        if model == FAILING_MODEL {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": { "code": "mock_failure", "message": "upstream exploded" }
                })),
            )
                .into_response();
        }

        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            let content = |piece: &str| -> Result<Event, Infallible> {
                Ok(Event::default()
                    .data(stream_chunk(&model, json!({ "content": piece }), None).to_string()))
            };
            if model == BROKEN_STREAM_MODEL {
                let events = vec![
                    content("Hel"),
                    content("lo"),
                    Ok(Event::default().data(
                        json!({ "error": { "code": "mock_cut", "message": "stream broke" } })
                            .to_string(),
                    )),
                    Ok(Event::default().data("[DONE]")),
                ];
                return Sse::new(futures_util::stream::iter(events)).into_response();
            }
            if model == STALLING_MODEL {
                let events = vec![content("Hel")];
                return Sse::new(
                    futures_util::stream::iter(events).chain(futures_util::stream::pending()),
                )
                .into_response();
            }

            let mut events: Vec<Result<Event, Infallible>> = Vec::new();
            for piece in ["Hello", " ", "World"] {
                events.push(content(piece));
            }
            let mut last = stream_chunk(&model, json!({}), Some("stop"));
            last["usage"] = json!({
                "prompt_tokens": 3,
                "completion_tokens": 2,
                "total_tokens": 5
            });
            events.push(Ok(Event::default().data(last.to_string())));
            events.push(Ok(Event::default().data("[DONE]")));
            return Sse::new(futures_util::stream::iter(events)).into_response();
        }

        Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 0,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": format!("echo:{}", last_user_text(&body))
                },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10 }
        }))
        .into_response()
    }

    async fn models() -> Json<Value> {
        Json(json!({
            "object": "list",
            "data": [
                { "id": "gpt-4o", "object": "model" },
                { "id": "meta/llama-3", "object": "model" }
            ]
        }))
    }

    async fn messages(headers: HeaderMap, Json(body): Json<Value>) -> axum::response::Response {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null)
        };
        (
            [
                ("anthropic-ratelimit-requests-remaining", "10"),
                ("x-mock-internal", "hidden"),
            ],
            Json(json!({
                "type": "message",
                "model": body.get("model").cloned().unwrap_or(Value::Null),
                "seen": {
                    "x-api-key": header("x-api-key"),
                    "authorization": header("authorization"),
                    "anthropic-version": header("anthropic-version")
                }
            })),
        )
            .into_response()
    }

    let router = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/v1/models", get(models))
        .route("/v1/messages", post(messages))
        .with_state(Arc::clone(&captured));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, captured)
}

fn builtin(name: &str, base_url: String, key: &str) -> BuiltinProviderConfig {
    BuiltinProviderConfig {
        name: name.to_string(),
        base_url,
        api_key: Some(key.to_string()),
        api_key_file: None,
    }
}

async fn setup() -> TestContext {
    let (upstream_addr, captured) = start_upstream().await;

    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("relaygate.db");
    let runtime = relaygate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        max_body_bytes: MAX_BODY_BYTES,
        models_cache_ttl: Duration::from_secs(300),
        max_interactions: 20,
        upstream_timeout_ms: 5_000,
        builtins: BuiltinProviders {
            default_provider: "openai".to_string(),
            billing_enabled: true,
            providers: vec![
                builtin(
                    "openai",
                    format!("http://{upstream_addr}/v1"),
                    "sk-upstream-openai",
                ),
                builtin(
                    "anthropic",
                    format!("http://{upstream_addr}"),
                    "sk-ant-upstream",
                ),
            ],
        },
    };

    let pool = relaygate::app::open_pool(&runtime).await.expect("open pool");
    let counters = Arc::new(Counters::default());
    let store = CountingStore {
        inner: SqliteSessionStore::new(pool.clone())
            .await
            .expect("session store"),
        counters: Arc::clone(&counters),
    };
    let state = relaygate::app::load_state_with_sessions(runtime, pool, Arc::new(store))
        .await
        .expect("load state");

    let user = state
        .user_store
        .create_user("tenant-1")
        .await
        .expect("create user");
    state
        .user_store
        .set_balance(&user.id, "1000000000", false)
        .await
        .expect("fund user");
    let (_, token) = state
        .user_store
        .create_api_key(&user.id, "test-key", None)
        .await
        .expect("create api key");

    let broke = state
        .user_store
        .create_user("tenant-broke")
        .await
        .expect("create broke user");
    let (_, broke_token) = state
        .user_store
        .create_api_key(&broke.id, "broke-key", None)
        .await
        .expect("create broke api key");

    TestContext {
        router: relaygate::app::build_app(state.clone()),
        auth_header: format!("Bearer {token}"),
        broke_auth_header: format!("Bearer {broke_token}"),
        user_id: user.id,
        state,
        counters,
        captured,
        _temp_dir: temp_dir,
    }
}

async fn send(ctx: &TestContext, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn post_as(
    ctx: &TestContext,
    auth: &str,
    path: &str,
    extra: &[(&str, &str)],
    body: Value,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, auth);
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    send(ctx, builder.body(Body::from(body.to_string())).unwrap()).await
}

async fn json_post(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, String) {
    let (status, _, body) = post_as(ctx, &ctx.auth_header, path, &[], body).await;
    (status, body)
}

async fn json_get(ctx: &TestContext, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(ctx, req).await;
    (status, body)
}

fn data_lines(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect()
}

fn chat_body(model: &str, prompt: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
        "stream": stream
    })
}

async fn wait_for_final(ctx: &TestContext, session_id: &str) -> Interaction {
    for _ in 0..40 {
        let session = ctx
            .state
            .sessions
            .get_session(session_id)
            .await
            .expect("load session")
            .expect("session exists");
        if let Some(last) = session.interactions.last() {
            if last.finished {
                return last.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("interaction in {session_id} was never finalized");
}

fn captured_values(ctx: &TestContext, name: &str) -> Vec<String> {
    ctx.captured
        .lock()
        .unwrap()
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
        .collect()
}

#[tokio::test]
async fn auth_required_for_gateway_endpoints() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(chat_body("gpt-4o", "hi", false).to_string()))
        .unwrap();
    let (status, _, body) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "unauthorized");

    let (status, _, _) = post_as(
        &ctx,
        "Bearer sk-not-a-real-key-000",
        "/v1/chat/completions",
        &[],
        chat_body("gpt-4o", "hi", false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn blocking_completion_is_keyed_by_session_and_recorded() {
    let ctx = setup().await;
    let (status, body) =
        json_post(&ctx, "/v1/chat/completions", chat_body("gpt-4o", "ping", false)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let session_id = parsed["id"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("ses_"));
    assert_eq!(parsed["choices"][0]["message"]["content"], "echo:ping");

    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Complete);
    assert_eq!(interaction.response_message, "echo:ping");
    assert_eq!(interaction.usage.total_tokens, 10);
    assert_eq!(
        captured_values(&ctx, "authorization"),
        vec!["Bearer sk-upstream-openai".to_string()]
    );

    let session = ctx
        .state
        .sessions
        .get_session(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.owner, ctx.user_id);
    assert_eq!(session.provider, "openai");
    assert_eq!(session.name, "ping");
}

#[tokio::test]
async fn pretty_flag_indents_blocking_response() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions?pretty=true",
        chat_body("gpt-4o", "ping", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\n  \"choices\""), "{body}");

    let (_, compact) =
        json_post(&ctx, "/v1/chat/completions", chat_body("gpt-4o", "ping", false)).await;
    assert!(!compact.contains('\n'));
}

#[tokio::test]
async fn streaming_completion_relays_chunks_and_records_text() {
    let ctx = setup().await;
    let (status, headers, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[],
        chat_body("gpt-4o", "say hello", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
    assert!(headers.contains_key("x-interaction-id"));

    let lines = data_lines(&body);
    assert!(lines.len() >= 5, "{body}");
    assert_eq!(lines.last().copied(), Some("[DONE]"));

    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    let session_id = first["id"].as_str().unwrap().to_string();
    for line in &lines[..lines.len() - 1] {
        let chunk: Value = serde_json::from_str(line).unwrap();
        assert_eq!(chunk["id"], session_id.as_str());
    }

    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Complete);
    assert_eq!(interaction.response_message, "Hello World");
    assert_eq!(interaction.usage.total_tokens, 5);
    assert_eq!(
        interaction.id,
        headers["x-interaction-id"].to_str().unwrap()
    );
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_open_failure_emits_error_and_finalizes_once() {
    let ctx = setup().await;
    let (status, _, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[],
        chat_body(FAILING_MODEL, "boom", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let lines = data_lines(&body);
    assert_eq!(lines.last().copied(), Some("[DONE]"));
    let first: Value = serde_json::from_str(lines[0]).unwrap();
    let session_id = first["id"].as_str().unwrap().to_string();
    let error = lines
        .iter()
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .find(|v| v.get("error").is_some())
        .expect("error chunk");
    assert!(
        error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("upstream exploded")
    );

    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Error);
    assert!(interaction.error.contains("upstream exploded"));
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_text_and_ends_with_error() {
    let ctx = setup().await;
    let (status, _, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[],
        chat_body(BROKEN_STREAM_MODEL, "break", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let lines = data_lines(&body);
    assert_eq!(lines.len(), 5, "{body}");
    let chunks: Vec<Value> = lines[..4]
        .iter()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(chunks[2]["choices"][0]["delta"]["content"], "lo");
    assert_eq!(chunks[3]["error"]["message"], "stream broke");
    assert_eq!(lines[4], "[DONE]");

    let session_id = chunks[0]["id"].as_str().unwrap().to_string();
    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Error);
    assert_eq!(interaction.error, "stream broke");
    assert_eq!(interaction.response_message, "Hello");
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_disconnect_mid_stream_finalizes_once_as_cancelled() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(chat_body(STALLING_MODEL, "wait", true).to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = resp.into_body();
    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.contains("\"content\":\"Hel\"") {
            let frame = body.frame().await.expect("stream ended early").unwrap();
            if let Some(data) = frame.data_ref() {
                seen.push_str(&String::from_utf8_lossy(data));
            }
        }
    })
    .await
    .expect("first content chunk");
    drop(body);

    let first: Value = serde_json::from_str(data_lines(&seen)[0]).unwrap();
    let session_id = first["id"].as_str().unwrap().to_string();
    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Error);
    assert_eq!(interaction.error, CANCELLED_MESSAGE);
    assert_eq!(interaction.response_message, "Hel");
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocking_upstream_failure_maps_to_server_error() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        chat_body(FAILING_MODEL, "boom", false),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "mock_failure");
    assert_eq!(parsed["error"]["type"], "upstream_error");
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn insufficient_balance_is_rejected_before_anything_is_written() {
    let ctx = setup().await;
    let (status, _, body) = post_as(
        &ctx,
        &ctx.broke_auth_header,
        "/v1/chat/completions",
        &[],
        chat_body("gpt-4o", "hi", true),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "insufficient_balance");
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 0);
    assert!(captured_values(&ctx, "authorization").is_empty());
}

#[tokio::test]
async fn org_provider_header_routes_to_org_endpoint() {
    let ctx = setup().await;
    let base_url = ctx
        .state
        .resolver
        .builtins()
        .get("openai")
        .unwrap()
        .base_url
        .clone();
    ctx.state
        .provider_store
        .create_endpoint(CreateEndpointInput {
            id: None,
            name: "team-openai".to_string(),
            base_url,
            api_key: "sk-org-key".to_string(),
            owner: "org-1".to_string(),
            owner_type: OwnerType::Org,
            endpoint_type: EndpointType::Org,
            billing_enabled: false,
            models: Vec::new(),
            headers: HashMap::new(),
        })
        .await
        .expect("create org endpoint");
    ctx.state
        .user_store
        .add_org_member("org-1", &ctx.user_id, MemberRole::Member)
        .await
        .expect("add member");

    let (status, _, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[("x-org-id", "org-1"), ("x-provider", "team-openai")],
        chat_body("gpt-4o", "org hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let session = ctx
        .state
        .sessions
        .get_session(parsed["id"].as_str().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.provider, "team-openai");
    assert_eq!(session.organization_id, "org-1");
    assert_eq!(
        captured_values(&ctx, "authorization"),
        vec!["Bearer sk-org-key".to_string()]
    );

    // The same name is invisible outside the organization.
    let (status, _, _) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[("x-provider", "team-openai")],
        chat_body("gpt-4o", "personal", false),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn org_scope_requires_membership() {
    let ctx = setup().await;
    let (status, _, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/chat/completions",
        &[("x-org-id", "org-elsewhere"), ("x-provider", "openai")],
        chat_body("gpt-4o", "hi", false),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "permission_error");
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn model_listing_fills_catalog_used_for_disambiguation() {
    let ctx = setup().await;
    assert!(
        ctx.state
            .disambiguator
            .catalog()
            .cached("openai", &ctx.user_id)
            .await
            .is_none()
    );

    let (status, body) = json_get(&ctx, "/v1/models").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let ids: Vec<&str> = parsed["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "meta/llama-3"]);
    assert_eq!(parsed["data"][0]["owned_by"], "openai");

    let cached = ctx
        .state
        .disambiguator
        .catalog()
        .cached("openai", &ctx.user_id)
        .await
        .expect("catalog populated");
    assert_eq!(cached.len(), 2);

    // A slash model listed by exactly one provider keeps its full name.
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        chat_body("meta/llama-3", "hi", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["model"], "meta/llama-3");
}

#[tokio::test]
async fn provider_prefix_selects_builtin_and_is_stripped() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        chat_body("openai/gpt-4o-mini", "hi", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["model"], "gpt-4o-mini");
}

#[tokio::test]
async fn app_assistant_drives_provider_model_and_system_prompt() {
    let ctx = setup().await;
    let app = ctx
        .state
        .app_store
        .create_app(
            &ctx.user_id,
            "",
            vec![AssistantConfig {
                id: "asst-1".to_string(),
                name: "helper".to_string(),
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                system_prompt: "answer briefly".to_string(),
                rag_source_id: "rag-1".to_string(),
            }],
        )
        .await
        .expect("create app");

    let (status, body) = json_post(
        &ctx,
        &format!("/v1/chat/completions?app_id={}", app.id),
        json!({ "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["model"], "gpt-4o-mini");
    assert_eq!(captured_values(&ctx, "system"), vec!["answer briefly".to_string()]);

    let session = ctx
        .state
        .sessions
        .get_session(parsed["id"].as_str().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.parent_app, app.id);
    assert_eq!(session.metadata.assistant_id, "asst-1");
    assert_eq!(session.metadata.rag_source_id, "rag-1");

    // Apps belong to their owner.
    let (status, _, _) = post_as(
        &ctx,
        &ctx.broke_auth_header,
        &format!("/v1/chat/completions?app_id={}", app.id),
        &[],
        json!({ "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn provider_listing_masks_keys() {
    let ctx = setup().await;
    ctx.state
        .provider_store
        .create_endpoint(CreateEndpointInput {
            id: None,
            name: "mine".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "sk-personal-secret".to_string(),
            owner: ctx.user_id.clone(),
            owner_type: OwnerType::User,
            endpoint_type: EndpointType::User,
            billing_enabled: false,
            models: vec!["tiny".to_string()],
            headers: HashMap::new(),
        })
        .await
        .expect("create endpoint");

    let (status, body) = json_get(&ctx, "/api/v1/provider-endpoints").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(!body.contains("sk-personal-secret"));
    assert!(!body.contains("sk-upstream-openai"));
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let names: Vec<&str> = parsed
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names, vec!["mine", "anthropic", "openai"]);
    for endpoint in parsed.as_array().unwrap() {
        assert_eq!(endpoint["api_key"], "********");
    }
}

#[tokio::test]
async fn session_chat_blocking_then_continuation() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/v1/sessions/chat",
        json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "first question" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let session_id = parsed["id"].as_str().unwrap().to_string();
    assert_eq!(
        parsed["choices"][0]["message"]["content"],
        "echo:first question"
    );

    let (status, body) = json_post(
        &ctx,
        "/api/v1/sessions/chat",
        json!({
            "session_id": session_id,
            "messages": [{ "role": "user", "content": "second question" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["id"], session_id.as_str());
    assert_eq!(
        parsed["choices"][0]["message"]["content"],
        "echo:second question"
    );

    let session = ctx
        .state
        .sessions
        .get_session(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.interactions.len(), 2);
    assert!(session.interactions.iter().all(|i| i.finished));
    assert_eq!(session.interactions[1].prompt_message, "second question");

    // Someone else may not continue the session.
    let (status, _, _) = post_as(
        &ctx,
        &ctx.broke_auth_header,
        "/api/v1/sessions/chat",
        &[],
        json!({
            "session_id": session_id,
            "messages": [{ "role": "user", "content": "hijack" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn session_chat_regenerate_starts_new_generation() {
    let ctx = setup().await;
    let (_, body) = json_post(
        &ctx,
        "/api/v1/sessions/chat",
        json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "draft" }]
        }),
    )
    .await;
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let session_id = parsed["id"].as_str().unwrap().to_string();

    let (status, body) = json_post(
        &ctx,
        "/api/v1/sessions/chat",
        json!({
            "session_id": session_id,
            "regenerate": true,
            "messages": [{ "role": "user", "content": "draft again" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let session = ctx
        .state
        .sessions
        .get_session(&session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.generation_id, 1);
    assert_eq!(session.interactions.len(), 1);
    assert_eq!(session.interactions[0].prompt_message, "draft again");
    assert_eq!(session.interactions[0].generation_id, 1);
}

#[tokio::test]
async fn session_chat_streams_through_bus() {
    let ctx = setup().await;
    let (status, headers, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/api/v1/sessions/chat",
        &[],
        json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{ "role": "user", "content": "stream please" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "text/event-stream");

    let lines = data_lines(&body);
    assert_eq!(lines.last().copied(), Some("[DONE]"));
    let chunks: Vec<Value> = lines[..lines.len() - 1]
        .iter()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello World");
    assert_eq!(
        chunks.last().unwrap()["choices"][0]["finish_reason"],
        "stop"
    );

    let session_id = chunks[0]["id"].as_str().unwrap().to_string();
    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Complete);
    assert_eq!(interaction.response_message, "Hello World");
    assert_eq!(ctx.state.bus.topic_count(), 0);
}

#[tokio::test]
async fn session_chat_stream_reports_upstream_failure_after_role_chunk() {
    let ctx = setup().await;
    let (status, _, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/api/v1/sessions/chat",
        &[],
        json!({
            "model": FAILING_MODEL,
            "stream": true,
            "messages": [{ "role": "user", "content": "stream please" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let lines = data_lines(&body);
    assert_eq!(lines.len(), 3, "{body}");
    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    let error: Value = serde_json::from_str(lines[1]).unwrap();
    assert!(
        error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("upstream exploded")
    );
    assert_eq!(lines[2], "[DONE]");

    let session_id = first["id"].as_str().unwrap().to_string();
    let interaction = wait_for_final(&ctx, &session_id).await;
    assert_eq!(interaction.state, InteractionState::Error);
    assert_eq!(ctx.counters.interaction_updates.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.state.bus.topic_count(), 0);
}

#[tokio::test]
async fn session_chat_rejects_invalid_messages() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/api/v1/sessions/chat",
        json!({
            "model": "gpt-4o",
            "messages": [{ "role": "assistant", "content": "not a question" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["error"]["param"], "messages");
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn messages_proxy_swaps_credentials_and_filters_headers() {
    let ctx = setup().await;
    let (status, headers, body) = post_as(
        &ctx,
        &ctx.auth_header,
        "/v1/messages",
        &[("anthropic-version", "2023-06-01")],
        json!({
            "model": "claude-3-7-sonnet-20250219",
            "max_tokens": 16,
            "messages": [{ "role": "user", "content": "hi" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["model"], "claude-3-7-sonnet-20250219");
    assert_eq!(parsed["seen"]["x-api-key"], "sk-ant-upstream");
    assert_eq!(parsed["seen"]["authorization"], Value::Null);
    assert_eq!(parsed["seen"]["anthropic-version"], "2023-06-01");
    assert_eq!(headers["anthropic-ratelimit-requests-remaining"], "10");
    assert!(!headers.contains_key("x-mock-internal"));
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn messages_proxy_respects_balance() {
    let ctx = setup().await;
    let (status, _, _) = post_as(
        &ctx,
        &ctx.broke_auth_header,
        "/v1/messages",
        &[],
        json!({ "model": "claude-sonnet-4", "messages": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let ctx = setup().await;
    let padding = "x".repeat(MAX_BODY_BYTES + 1);
    let body = chat_body("gpt-4o", &padding, false).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_LENGTH, body.len())
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(body))
        .unwrap();
    let (status, _, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(ctx.counters.sessions_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_id_is_propagated_and_metrics_render() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("GET")
        .uri("/metrics")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&ctx, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-request-id"], "req-123");
}
