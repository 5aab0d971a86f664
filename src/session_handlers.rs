use crate::app::AppState;
use crate::auth::Principal;
use crate::context::RequestContext;
use crate::dispatcher::DispatchMode;
use crate::error::{AppError, AppResult};
use crate::handlers::{
    apply_system_prompt, load_app, message_text, record_request, resolve_target,
};
use crate::relay::{self, RelayJob};
use crate::sessions::{Interaction, Session, limit_interactions, session_name_from_prompt};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const ALLOWED_ROLES: [&str; 3] = ["user", "system", "assistant"];

#[derive(Debug, Default, Deserialize)]
pub struct SessionChatRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub interaction_id: String,
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl SessionChatRequest {
    fn last_message(&self) -> Option<&Value> {
        self.messages.last()
    }

    fn validate(&self) -> AppResult<()> {
        if self.messages.is_empty() {
            return Err(AppError::bad_request("messages must not be empty").with_param("messages"));
        }
        for message in &self.messages {
            let role = role_of(message);
            if !ALLOWED_ROLES.contains(&role) {
                return Err(AppError::bad_request(format!("invalid message role: {role:?}"))
                    .with_param("messages"));
            }
        }
        let needs_user_last = self.session_id.is_empty() || self.messages.len() > 1;
        if needs_user_last && self.last_message().map(role_of) != Some("user") {
            return Err(
                AppError::bad_request("last message must be from the user").with_param("messages")
            );
        }
        Ok(())
    }
}

fn role_of(message: &Value) -> &str {
    message
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

pub async fn start_chat_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let mut principal = state.auth.authenticate(&headers, &state.user_store).await?;
    let mut req: SessionChatRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("invalid request body: {err}")))?;
    req.validate()?;
    let mode = DispatchMode::from_stream_flag(req.stream);

    let existing = match req.session_id.trim() {
        "" => None,
        id => Some(load_owned_session(&state, &principal, id).await?),
    };
    if let Some(session) = &existing {
        if req.app_id.is_empty() {
            req.app_id = session.parent_app.clone();
        }
        if req.organization_id.is_empty() {
            req.organization_id = session.organization_id.clone();
        }
        if req.provider.is_empty() {
            req.provider = session.provider.clone();
        }
        if req.model.is_empty() {
            req.model = session.model_name.clone();
        }
    }
    if !req.organization_id.is_empty() {
        authorize_org(&state, &principal, &req.organization_id).await?;
        principal.organization_id = Some(req.organization_id.clone());
    }

    let app = load_app(&state, &principal, Some(req.app_id.as_str())).await?;
    let hint = Some(req.provider.trim().to_string()).filter(|p| !p.is_empty());
    let target = resolve_target(
        &state,
        &principal,
        app,
        Some(req.assistant_id.as_str()),
        hint,
        &req.model,
    )
    .await?;
    state
        .dispatcher
        .ensure_can_spend(&principal.user_id, &target.endpoint)
        .await?;

    let system_prompt = if req.system.trim().is_empty() {
        target.system_prompt().to_string()
    } else {
        req.system.clone()
    };
    let prompt = req.last_message().map(message_text).unwrap_or_default();

    let (mut session, interaction, upstream_messages) = match existing {
        None => {
            let mut session =
                Session::new(&principal.user_id, &target.model, &target.endpoint.name);
            session.name = session_name_from_prompt(&prompt);
            session.organization_id = req.organization_id.clone();
            session.metadata.stream = req.stream;
            session.metadata.system_prompt = system_prompt.clone();
            if let Some(app) = &target.app {
                session.parent_app = app.id.clone();
            }
            if let Some(assistant) = &target.assistant {
                session.metadata.assistant_id = assistant.id.clone();
                session.metadata.rag_source_id = assistant.rag_source_id.clone();
            }
            let interaction = Interaction::waiting(&session.id, session.generation_id, &prompt);
            session.interactions.push(interaction.clone());
            state.recorder.open_session(&session).await?;
            (session, interaction, req.messages.clone())
        }
        Some(mut session) => {
            rewind_session(&state, &mut session, &req).await?;
            session.model_name = target.model.clone();
            session.provider = target.endpoint.name.clone();
            session.updated = Utc::now();
            state
                .sessions
                .update_session(&session)
                .await
                .map_err(|err| AppError::internal("session_store_error", err))?;

            let history = limit_interactions(&session.interactions, state.runtime.max_interactions);
            let mut messages = history_messages(history);
            if let Some(last) = req.last_message() {
                messages.push(last.clone());
            }
            let interaction = Interaction::waiting(&session.id, session.generation_id, &prompt);
            state
                .recorder
                .append_interaction(&mut session, interaction.clone())
                .await?;
            (session, interaction, messages)
        }
    };

    let mut request = json!({
        "model": target.model,
        "messages": upstream_messages,
    });
    apply_system_prompt(&mut request, &system_prompt);

    let ctx = RequestContext::new(
        principal.user_id.as_str(),
        target.endpoint.organization_id(),
        session.id.as_str(),
        interaction.id.as_str(),
        body,
    );
    record_request("sessions_chat", mode);
    tracing::debug!(
        owner_id = %ctx.owner_id(),
        session_id = %ctx.session_id(),
        interaction_id = %ctx.interaction_id(),
        provider = %target.endpoint.name,
        generation_id = session.generation_id,
        "starting session exchange"
    );

    let token = CancellationToken::new();
    let subscription = state.bus.subscribe(ctx.owner_id(), ctx.session_id());
    let (ready_tx, ready_rx) = oneshot::channel();
    session.updated = Utc::now();
    let job = RelayJob {
        dispatcher: state.dispatcher.clone(),
        recorder: state.recorder.clone(),
        model: target.model.clone(),
        endpoint: target.endpoint,
        request,
        ctx,
        session: session.clone(),
        token: token.clone(),
    };
    relay::spawn_worker(job, state.bus.clone(), mode, ready_rx);
    // The subscription above is registered; the worker may call upstream.
    let _ = ready_tx.send(());

    match mode {
        DispatchMode::Streaming => Ok(relay::bus_stream(
            subscription,
            session.id.clone(),
            interaction.id.clone(),
            target.model,
            token,
        )),
        DispatchMode::Blocking => {
            let _guard = token.drop_guard();
            let finished = relay::await_interaction(subscription, &interaction.id).await?;
            Ok(Json(relay::completion_body(&session, &finished)).into_response())
        }
    }
}

async fn load_owned_session(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
) -> AppResult<Session> {
    let session = state
        .sessions
        .get_session(session_id)
        .await
        .map_err(|err| AppError::internal("session_store_error", err))?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "session_not_found",
                format!("session not found: {session_id}"),
            )
        })?;
    if session.owner != principal.user_id {
        tracing::warn!(
            user_id = %principal.user_id,
            session_id,
            "caller does not own session"
        );
        return Err(
            AppError::new(StatusCode::FORBIDDEN, "forbidden", "access to session denied")
                .with_type("permission_error"),
        );
    }
    Ok(session)
}

async fn authorize_org(state: &AppState, principal: &Principal, org_id: &str) -> AppResult<()> {
    let membership = state
        .user_store
        .get_org_membership(org_id, &principal.user_id)
        .await
        .map_err(|err| AppError::internal("user_store_error", err))?;
    if membership.is_none() {
        tracing::warn!(
            user_id = %principal.user_id,
            organization_id = org_id,
            "caller is not a member of the organization"
        );
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!("no access to organization {org_id}"),
        )
        .with_type("permission_error"));
    }
    Ok(())
}

/// Applies regenerate and edit requests to a stored session before the new
/// interaction is appended. A single message appends, dropping history first
/// when `regenerate` is set; several messages cut the session at
/// `interaction_id`. Both rewinds start a new generation.
async fn rewind_session(
    state: &AppState,
    session: &mut Session,
    req: &SessionChatRequest,
) -> AppResult<()> {
    let cut_at = if req.messages.len() == 1 {
        if !req.regenerate {
            return Ok(());
        }
        0
    } else {
        if req.interaction_id.trim().is_empty() {
            return Err(AppError::bad_request(
                "interaction_id is required for multiple messages",
            )
            .with_param("interaction_id"));
        }
        session
            .interactions
            .iter()
            .position(|i| i.id == req.interaction_id)
            .ok_or_else(|| {
                AppError::new(
                    StatusCode::NOT_FOUND,
                    "interaction_not_found",
                    format!("interaction not found: {}", req.interaction_id),
                )
            })?
    };

    let dropped: Vec<String> = session.interactions[cut_at..]
        .iter()
        .map(|i| i.id.clone())
        .collect();
    if !dropped.is_empty() {
        state
            .sessions
            .delete_interactions(&session.id, &dropped)
            .await
            .map_err(|err| AppError::internal("session_store_error", err))?;
    }
    session.interactions.truncate(cut_at);
    session.generation_id += 1;
    for interaction in &mut session.interactions {
        interaction.generation_id = session.generation_id;
        state
            .sessions
            .update_interaction(interaction)
            .await
            .map_err(|err| AppError::internal("session_store_error", err))?;
    }
    Ok(())
}

/// Prior exchanges replayed as chat messages.
fn history_messages(interactions: &[Interaction]) -> Vec<Value> {
    let mut out = Vec::with_capacity(interactions.len() * 2);
    for interaction in interactions {
        out.push(json!({"role": "user", "content": interaction.prompt_message}));
        if !interaction.response_message.is_empty() {
            out.push(json!({"role": "assistant", "content": interaction.response_message}));
        }
    }
    out
}
