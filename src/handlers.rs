use crate::app::AppState;
use crate::apps::{App, AssistantConfig};
use crate::auth::{Principal, header_value};
use crate::context::RequestContext;
use crate::dispatcher::{DispatchMode, upstream_error_to_app};
use crate::error::{AppError, AppResult};
use crate::providers::ProviderEndpoint;
use crate::relay::{self, RelayJob};
use crate::resolver::AssistantScope;
use crate::sessions::{Interaction, Session, session_name_from_prompt};
use crate::upstream;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const PROVIDER_HEADER: &str = "x-provider";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionQuery {
    pub app_id: Option<String>,
    pub assistant_id: Option<String>,
    pub rag_source_id: Option<String>,
    #[serde(default)]
    pub pretty: bool,
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    Query(query): Query<ChatCompletionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let principal = state.auth.authenticate(&headers, &state.user_store).await?;
    let mut request: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;
    if !request.is_object() {
        return Err(AppError::bad_request("request body must be a JSON object"));
    }
    let stream = request
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mode = DispatchMode::from_stream_flag(stream);
    let requested_model = request
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let app = load_app(&state, &principal, query.app_id.as_deref()).await?;
    let target = resolve_target(
        &state,
        &principal,
        app,
        query.assistant_id.as_deref(),
        header_value(&headers, PROVIDER_HEADER),
        &requested_model,
    )
    .await?;
    state
        .dispatcher
        .ensure_can_spend(&principal.user_id, &target.endpoint)
        .await?;

    request["model"] = Value::String(target.model.clone());
    let system_prompt = target.system_prompt().to_string();
    apply_system_prompt(&mut request, &system_prompt);
    let messages = request
        .get("messages")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let prompt = last_user_prompt(&messages);

    let mut session = Session::new(&principal.user_id, &target.model, &target.endpoint.name);
    session.name = session_name_from_prompt(&prompt);
    session.organization_id = target.endpoint.organization_id().to_string();
    session.metadata.stream = stream;
    session.metadata.system_prompt = system_prompt;
    session.metadata.rag_source_id = query
        .rag_source_id
        .clone()
        .or_else(|| target.assistant.as_ref().map(|a| a.rag_source_id.clone()))
        .unwrap_or_default();
    if let Some(app) = &target.app {
        session.parent_app = app.id.clone();
    }
    if let Some(assistant) = &target.assistant {
        session.metadata.assistant_id = assistant.id.clone();
    }
    let interaction = Interaction::waiting(&session.id, session.generation_id, &prompt);
    let interaction_id = interaction.id.clone();
    session.interactions.push(interaction);
    state.recorder.open_session(&session).await?;

    let ctx = RequestContext::new(
        principal.user_id.as_str(),
        target.endpoint.organization_id(),
        session.id.as_str(),
        interaction_id,
        body,
    );
    record_request("chat_completions", mode);
    tracing::debug!(
        owner_id = %ctx.owner_id(),
        session_id = %ctx.session_id(),
        interaction_id = %ctx.interaction_id(),
        provider = %target.endpoint.name,
        model = %target.model,
        "dispatching chat completion"
    );

    let job = RelayJob {
        dispatcher: state.dispatcher.clone(),
        recorder: state.recorder.clone(),
        model: target.model,
        endpoint: target.endpoint,
        request,
        ctx,
        session,
        token: CancellationToken::new(),
    };
    match mode {
        DispatchMode::Streaming => Ok(relay::direct_stream(job)),
        DispatchMode::Blocking => {
            let completion = relay::direct_blocking(job).await?;
            Ok(json_response(&completion, query.pretty))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelsQuery {
    pub provider: Option<String>,
}

pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let principal = state.auth.authenticate(&headers, &state.user_store).await?;
    let hint = query
        .provider
        .filter(|p| !p.trim().is_empty())
        .or_else(|| header_value(&headers, PROVIDER_HEADER));
    let endpoint = state
        .resolver
        .resolve(&principal, None, hint.as_deref())
        .await?;

    let catalog = state.disambiguator.catalog();
    let model_ids = if !endpoint.models.is_empty() {
        endpoint.models.clone()
    } else if let Some(cached) = catalog.cached(&endpoint.name, &principal.user_id).await {
        cached
    } else {
        let fetched = upstream::list_models(
            state.dispatcher.http(),
            &endpoint,
            state.runtime.upstream_timeout_ms,
        )
        .await
        .map_err(upstream_error_to_app)?;
        catalog
            .store(&endpoint.name, &principal.user_id, fetched.clone())
            .await;
        fetched
    };

    let data: Vec<Value> = model_ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": endpoint.name
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn list_provider_endpoints(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<ProviderEndpoint>>> {
    let principal = state.auth.authenticate(&headers, &state.user_store).await?;
    let endpoints = state
        .resolver
        .accessible_endpoints(&principal)
        .await
        .map_err(|err| AppError::internal("provider_store_error", err))?;
    Ok(Json(endpoints.into_iter().map(ProviderEndpoint::masked).collect()))
}

/// Endpoint and model a request will run against.
pub(crate) struct Target {
    pub endpoint: ProviderEndpoint,
    pub model: String,
    pub app: Option<App>,
    pub assistant: Option<AssistantConfig>,
}

impl Target {
    pub fn system_prompt(&self) -> &str {
        self.assistant
            .as_ref()
            .map(|a| a.system_prompt.as_str())
            .unwrap_or_default()
    }
}

/// Loads the addressed app and checks the caller may use it.
pub(crate) async fn load_app(
    state: &AppState,
    principal: &Principal,
    app_id: Option<&str>,
) -> AppResult<Option<App>> {
    let Some(app_id) = app_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    let app = state
        .app_store
        .get_app(app_id)
        .await
        .map_err(|err| AppError::internal("app_store_error", err))?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "app_not_found",
                format!("app not found: {app_id}"),
            )
        })?;

    let allowed = if app.organization_id.is_empty() {
        app.owner == principal.user_id
    } else {
        state
            .user_store
            .get_org_membership(&app.organization_id, &principal.user_id)
            .await
            .map_err(|err| AppError::internal("user_store_error", err))?
            .is_some()
    };
    if !allowed {
        tracing::warn!(
            user_id = %principal.user_id,
            app_id = %app.id,
            organization_id = %app.organization_id,
            "caller may not use app"
        );
        return Err(
            AppError::new(StatusCode::FORBIDDEN, "forbidden", "access to app denied")
                .with_type("permission_error"),
        );
    }
    Ok(Some(app))
}

/// Disambiguates the model string and resolves the provider endpoint. An
/// explicit provider hint or an app assistant skips disambiguation.
pub(crate) async fn resolve_target(
    state: &AppState,
    principal: &Principal,
    app: Option<App>,
    assistant_id: Option<&str>,
    explicit_hint: Option<String>,
    model: &str,
) -> AppResult<Target> {
    let assistant = match &app {
        Some(app) => Some(app.assistant(assistant_id).cloned().ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "assistant_not_found",
                format!("assistant not found in app {}", app.id),
            )
        })?),
        None => None,
    };

    let mut model = model.trim().to_string();
    if model.is_empty() {
        if let Some(assistant) = &assistant {
            model = assistant.model.trim().to_string();
        }
    }

    let mut hint = explicit_hint;
    let mut acting_as = principal.clone();
    if hint.is_none() && assistant.is_none() {
        let found = state
            .disambiguator
            .disambiguate(principal, &model)
            .await
            .map_err(|err| AppError::internal("provider_store_error", err))?;
        if let Some(provider) = found.provider {
            // Disambiguation only sees personal and global endpoints.
            acting_as.organization_id = None;
            hint = Some(provider);
            model = found.model;
        }
    }
    if model.is_empty() {
        return Err(AppError::bad_request("model is required").with_param("model"));
    }

    let scope = match (&app, &assistant) {
        (Some(app), Some(assistant)) => Some(AssistantScope { app, assistant }),
        _ => None,
    };
    let endpoint = state
        .resolver
        .resolve(&acting_as, scope, hint.as_deref())
        .await?;
    Ok(Target {
        endpoint,
        model,
        app,
        assistant,
    })
}

pub(crate) fn record_request(route: &'static str, mode: DispatchMode) {
    metrics::counter!(
        "relaygate_requests_total",
        "route" => route,
        "mode" => mode.as_str()
    )
    .increment(1);
}

/// Text of a chat message: plain string content, or the text parts of a
/// multi-part content array joined by newlines.
pub(crate) fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

pub(crate) fn last_user_prompt(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|v| v.as_str()) == Some("user"))
        .map(message_text)
        .unwrap_or_default()
}

pub(crate) fn apply_system_prompt(request: &mut Value, prompt: &str) {
    if prompt.trim().is_empty() {
        return;
    }
    let Some(obj) = request.as_object_mut() else {
        return;
    };
    let messages = obj
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(list) = messages.as_array_mut() {
        list.insert(0, json!({"role": "system", "content": prompt}));
    }
}

fn json_response(value: &Value, pretty: bool) -> Response {
    if !pretty {
        return Json(value).into_response();
    }
    match serde_json::to_string_pretty(value) {
        Ok(text) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            text,
        )
            .into_response(),
        Err(_) => Json(value).into_response(),
    }
}
