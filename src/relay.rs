//! Relays upstream completions to the client and records the outcome.
//!
//! The direct relay reads the upstream stream itself. The bus relay splits
//! the work: a background worker calls upstream and publishes to the session
//! topic, while the request task subscribes and turns events into chunks.
//! Every request owns a `CancellationToken` that fires when the client goes
//! away, and each interaction is finalized exactly once.

use crate::bus::{BusError, EventBus, Subscription};
use crate::context::RequestContext;
use crate::dispatcher::{
    DispatchMode, Dispatched, Dispatcher, completion_text, record_upstream_error,
    upstream_error_to_app,
};
use crate::error::{AppError, AppResult};
use crate::events::SessionEvent;
use crate::providers::ProviderEndpoint;
use crate::recorder::{Outcome, Recorder};
use crate::sessions::{Interaction, InteractionState, Session, Usage};
use crate::upstream::ChunkStream;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const CANCELLED_MESSAGE: &str = "request cancelled";
pub const INTERACTION_ID_HEADER: &str = "x-interaction-id";
pub const DROPPED_EVENTS_MESSAGE: &str = "session events were dropped before delivery";

/// Everything needed to run one exchange against a resolved endpoint.
pub struct RelayJob {
    pub dispatcher: Dispatcher,
    pub recorder: Recorder,
    pub endpoint: ProviderEndpoint,
    pub request: Value,
    pub ctx: RequestContext,
    pub session: Session,
    /// Model name echoed in synthesized chunks.
    pub model: String,
    pub token: CancellationToken,
}

/// Cancels the request token when the response body is dropped.
struct GuardedStream<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub fn sse_response(
    rx: mpsc::Receiver<Event>,
    interaction_id: &str,
    token: CancellationToken,
) -> Response {
    let stream = GuardedStream {
        inner: ReceiverStream::new(rx),
        _guard: token.drop_guard(),
    };
    let mut resp = Sse::new(stream.map(Ok::<_, Infallible>)).into_response();
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Ok(value) = HeaderValue::from_str(interaction_id) {
        headers.insert(HeaderName::from_static(INTERACTION_ID_HEADER), value);
    }
    resp
}

pub fn chunk(id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason
        }]
    })
}

pub fn initial_chunk(id: &str, model: &str) -> Value {
    chunk(id, model, json!({"role": "assistant"}), None)
}

pub fn content_chunk(id: &str, model: &str, text: &str) -> Value {
    chunk(id, model, json!({"content": text}), None)
}

pub fn terminal_chunk(id: &str, model: &str, text: Option<&str>) -> Value {
    let delta = match text {
        Some(text) => json!({"content": text}),
        None => json!({}),
    };
    chunk(id, model, delta, Some("stop"))
}

pub fn error_chunk(message: &str) -> Value {
    json!({"error": {"message": message}})
}

fn data(value: &Value) -> Event {
    Event::default().data(value.to_string())
}

fn done() -> Event {
    Event::default().data("[DONE]")
}

async fn emit_error(tx: &mpsc::Sender<Event>, message: &str) {
    let _ = tx.send(data(&error_chunk(message))).await;
    let _ = tx.send(done()).await;
}

fn cancelled(partial: String) -> Outcome {
    Outcome::Error {
        error: CANCELLED_MESSAGE.to_string(),
        partial,
    }
}

fn delta_content(chunk: &Value) -> Option<&str> {
    chunk
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("delta"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
}

async fn finalize_logged(
    recorder: &Recorder,
    session: &mut Session,
    interaction_id: &str,
    outcome: Outcome,
) -> Option<Interaction> {
    match recorder.finalize(session, interaction_id, outcome).await {
        Ok(interaction) => Some(interaction),
        Err(err) => {
            tracing::error!(
                session_id = %session.id,
                interaction_id,
                "failed to finalize interaction: {err}"
            );
            None
        }
    }
}

/// Streams the upstream response straight to the client.
pub fn direct_stream(job: RelayJob) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let interaction_id = job.ctx.interaction_id().to_string();
    let token = job.token.clone();
    tokio::spawn(run_direct(job, tx));
    sse_response(rx, &interaction_id, token)
}

async fn run_direct(job: RelayJob, tx: mpsc::Sender<Event>) {
    let RelayJob {
        dispatcher,
        recorder,
        endpoint,
        request,
        ctx,
        mut session,
        model,
        token,
    } = job;
    let session_id = ctx.session_id().to_string();
    let _ = tx.send(data(&initial_chunk(&session_id, &model))).await;

    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        res = dispatcher.stream(&ctx, &endpoint, &request) => Some(res),
    };
    let outcome = match opened {
        None => cancelled(String::new()),
        Some(Err(err)) => {
            emit_error(&tx, &err.message).await;
            Outcome::Error {
                error: err.message,
                partial: String::new(),
            }
        }
        Some(Ok(stream)) => pump_direct(stream, &tx, &token, &session_id, &endpoint.name).await,
    };

    finalize_logged(&recorder, &mut session, ctx.interaction_id(), outcome).await;
    drop(tx);
}

async fn pump_direct(
    mut stream: ChunkStream,
    tx: &mpsc::Sender<Event>,
    token: &CancellationToken,
    session_id: &str,
    provider: &str,
) -> Outcome {
    let mut text = String::new();
    let mut usage = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return cancelled(text),
            next = stream.next() => next,
        };
        match next {
            None => {
                let _ = tx.send(done()).await;
                return Outcome::Complete {
                    response: text,
                    usage,
                };
            }
            Some(Ok(mut chunk)) => {
                if let Some(delta) = delta_content(&chunk) {
                    text.push_str(delta);
                }
                usage = Usage::from_openai(&chunk).or(usage);
                if let Some(obj) = chunk.as_object_mut() {
                    obj.insert("id".to_string(), Value::String(session_id.to_string()));
                }
                if tx.send(data(&chunk)).await.is_err() {
                    return cancelled(text);
                }
            }
            Some(Err(err)) => {
                record_upstream_error(provider, &err);
                tracing::warn!(session_id, provider, "upstream stream failed: {}", err.message);
                emit_error(tx, &err.message).await;
                return Outcome::Error {
                    error: err.message,
                    partial: text,
                };
            }
        }
    }
}

/// Runs a blocking exchange in its own task so the interaction is finalized
/// even when the client leaves early. Leaving cancels the upstream call and
/// records the exchange as cancelled. Returns the upstream completion with
/// its `id` replaced by the session id.
pub async fn direct_blocking(job: RelayJob) -> AppResult<Value> {
    let _guard = job.token.clone().drop_guard();
    tokio::spawn(run_blocking(job))
        .await
        .map_err(|err| AppError::internal("relay_task_failed", err.to_string()))?
}

async fn run_blocking(job: RelayJob) -> AppResult<Value> {
    let RelayJob {
        dispatcher,
        recorder,
        endpoint,
        request,
        ctx,
        mut session,
        token,
        ..
    } = job;
    let called = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        res = dispatcher.complete(&ctx, &endpoint, &request) => Some(res),
    };
    match called {
        None => {
            recorder
                .finalize(&mut session, ctx.interaction_id(), cancelled(String::new()))
                .await?;
            Err(AppError::new(
                axum::http::StatusCode::REQUEST_TIMEOUT,
                "request_cancelled",
                CANCELLED_MESSAGE,
            ))
        }
        Some(Err(err)) => {
            let outcome = Outcome::Error {
                error: err.message.clone(),
                partial: String::new(),
            };
            recorder
                .finalize(&mut session, ctx.interaction_id(), outcome)
                .await?;
            Err(upstream_error_to_app(err))
        }
        Some(Ok(mut completion)) => {
            let outcome = Outcome::Complete {
                response: completion_text(&completion),
                usage: Usage::from_openai(&completion),
            };
            recorder
                .finalize(&mut session, ctx.interaction_id(), outcome)
                .await?;
            if let Some(obj) = completion.as_object_mut() {
                obj.insert("id".to_string(), Value::String(session.id.clone()));
            }
            Ok(completion)
        }
    }
}

/// Starts the background worker of a bus-relayed exchange. The upstream call
/// waits for `ready`, which the request side sends once its subscription is
/// registered.
pub fn spawn_worker(
    job: RelayJob,
    bus: EventBus,
    mode: DispatchMode,
    ready: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_worker(job, bus, mode, ready))
}

async fn run_worker(
    job: RelayJob,
    bus: EventBus,
    mode: DispatchMode,
    ready: oneshot::Receiver<()>,
) {
    let RelayJob {
        dispatcher,
        recorder,
        endpoint,
        request,
        ctx,
        mut session,
        token,
        ..
    } = job;
    let owner = ctx.owner_id();
    let session_id = ctx.session_id();
    let interaction_id = ctx.interaction_id();

    let confirmed = tokio::select! {
        biased;
        _ = token.cancelled() => false,
        res = ready => res.is_ok(),
    };

    let outcome = if !confirmed {
        cancelled(String::new())
    } else {
        let called = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = dispatcher.dispatch(&ctx, &endpoint, &request, mode) => Some(res),
        };
        match called {
            None => cancelled(String::new()),
            Some(Err(err)) => Outcome::Error {
                error: err.message,
                partial: String::new(),
            },
            Some(Ok(Dispatched::Completion(completion))) => {
                let response = completion_text(&completion);
                if !response.is_empty() {
                    publish(
                        &bus,
                        owner,
                        session_id,
                        SessionEvent::WorkerFragment {
                            session_id: session_id.to_string(),
                            interaction_id: interaction_id.to_string(),
                            message: response.clone(),
                        },
                    );
                }
                Outcome::Complete {
                    response,
                    usage: Usage::from_openai(&completion),
                }
            }
            Some(Ok(Dispatched::Stream(stream))) => {
                pump_bus(stream, &bus, &ctx, &token, &endpoint.name).await
            }
        }
    };

    let mut error = match &outcome {
        Outcome::Error { error, .. } => Some(error.clone()),
        Outcome::Complete { .. } => None,
    };
    match recorder.finalize(&mut session, interaction_id, outcome).await {
        Ok(_) => publish(
            &bus,
            owner,
            session_id,
            SessionEvent::SessionSnapshot {
                session: Box::new(session.clone()),
            },
        ),
        Err(err) => {
            tracing::error!(session_id, interaction_id, "failed to finalize interaction: {err}");
            error.get_or_insert_with(|| err.to_string());
        }
    }
    publish(
        &bus,
        owner,
        session_id,
        SessionEvent::WorkerDone {
            session_id: session_id.to_string(),
            interaction_id: interaction_id.to_string(),
            error,
        },
    );
}

async fn pump_bus(
    mut stream: ChunkStream,
    bus: &EventBus,
    ctx: &RequestContext,
    token: &CancellationToken,
    provider: &str,
) -> Outcome {
    let mut text = String::new();
    let mut usage = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return cancelled(text),
            next = stream.next() => next,
        };
        match next {
            None => {
                return Outcome::Complete {
                    response: text,
                    usage,
                };
            }
            Some(Ok(chunk)) => {
                usage = Usage::from_openai(&chunk).or(usage);
                let Some(delta) = delta_content(&chunk).filter(|d| !d.is_empty()) else {
                    continue;
                };
                text.push_str(delta);
                publish(
                    bus,
                    ctx.owner_id(),
                    ctx.session_id(),
                    SessionEvent::WorkerFragment {
                        session_id: ctx.session_id().to_string(),
                        interaction_id: ctx.interaction_id().to_string(),
                        message: delta.to_string(),
                    },
                );
            }
            Some(Err(err)) => {
                record_upstream_error(provider, &err);
                tracing::warn!(
                    session_id = %ctx.session_id(),
                    provider,
                    "upstream stream failed: {}",
                    err.message
                );
                return Outcome::Error {
                    error: err.message,
                    partial: text,
                };
            }
        }
    }
}

fn publish(bus: &EventBus, owner: &str, session_id: &str, event: SessionEvent) {
    let kind = event.kind();
    if let Err(err) = bus.publish(owner, session_id, event) {
        tracing::debug!(session_id, event = kind, "event not delivered: {err}");
    }
}

/// Response text of a finished tool interaction on an app session.
fn tool_response(session: &Session) -> Option<&str> {
    if session.parent_app.is_empty() {
        return None;
    }
    let last = session.last_interaction()?;
    (last.finished && last.tool_id().is_some()).then_some(last.response_message.as_str())
}

/// Turns bus events for one interaction into SSE chunks. The subscription is
/// released when the relay task ends, whichever way it ends.
///
/// A subscriber that falls behind the bus buffer stops relaying fragments and
/// sends the unsent remainder from the final session snapshot instead. If no
/// snapshot arrives the stream ends with an error chunk.
pub fn bus_stream(
    mut sub: Subscription,
    session_id: String,
    interaction_id: String,
    model: String,
    token: CancellationToken,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let header_id = interaction_id.clone();
    let task_token = token.clone();
    tokio::spawn(async move {
        let _ = tx.send(data(&initial_chunk(&session_id, &model))).await;
        let mut sent = String::new();
        let mut lagged = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                ev = sub.recv() => ev,
            };
            match event {
                Ok(SessionEvent::WorkerFragment {
                    interaction_id: id,
                    message,
                    ..
                }) if id == interaction_id => {
                    if lagged {
                        continue;
                    }
                    if tx
                        .send(data(&content_chunk(&session_id, &model, &message)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    sent.push_str(&message);
                }
                Ok(SessionEvent::WorkerDone {
                    interaction_id: id,
                    error,
                    ..
                }) if id == interaction_id => {
                    match error {
                        None if lagged => emit_error(&tx, DROPPED_EVENTS_MESSAGE).await,
                        None => {
                            let _ = tx
                                .send(data(&terminal_chunk(&session_id, &model, None)))
                                .await;
                            let _ = tx.send(done()).await;
                        }
                        Some(message) => emit_error(&tx, &message).await,
                    }
                    break;
                }
                Ok(SessionEvent::SessionSnapshot { session }) => {
                    if let Some(text) = tool_response(&session) {
                        let _ = tx
                            .send(data(&terminal_chunk(&session_id, &model, Some(text))))
                            .await;
                        let _ = tx.send(done()).await;
                        break;
                    }
                    if !lagged {
                        continue;
                    }
                    let Some(finished) = session.interactions.iter().find(|i| {
                        i.id == interaction_id
                            && i.finished
                            && i.state == InteractionState::Complete
                    }) else {
                        continue;
                    };
                    let Some(rest) = finished.response_message.strip_prefix(sent.as_str()) else {
                        emit_error(&tx, DROPPED_EVENTS_MESSAGE).await;
                        break;
                    };
                    if !rest.is_empty()
                        && tx
                            .send(data(&content_chunk(&session_id, &model, rest)))
                            .await
                            .is_err()
                    {
                        break;
                    }
                    lagged = false;
                }
                Ok(_) => {}
                Err(BusError::Lagged { topic, skipped }) => {
                    tracing::warn!(topic = %topic, skipped, "session subscriber lagged");
                    lagged = true;
                }
                Err(err) => {
                    tracing::debug!(session_id = %session_id, "session subscription ended: {err}");
                    break;
                }
            }
        }
        drop(sub);
    });
    sse_response(rx, &header_id, token)
}

/// Waits on the bus until the interaction is finalized. Dropping the future
/// releases the subscription.
pub async fn await_interaction(
    mut sub: Subscription,
    interaction_id: &str,
) -> AppResult<Interaction> {
    loop {
        match sub.recv().await {
            Ok(SessionEvent::SessionSnapshot { session }) => {
                let finished = session
                    .interactions
                    .into_iter()
                    .find(|i| i.id == interaction_id && i.finished);
                if let Some(interaction) = finished {
                    if interaction.state == InteractionState::Error {
                        return Err(AppError::internal("upstream_error", interaction.error));
                    }
                    return Ok(interaction);
                }
            }
            Ok(SessionEvent::WorkerDone {
                interaction_id: id,
                error,
                ..
            }) if id == interaction_id => {
                let message =
                    error.unwrap_or_else(|| "session finished without a snapshot".to_string());
                return Err(AppError::internal("upstream_error", message));
            }
            Ok(_) => {}
            Err(BusError::Lagged { topic, skipped }) => {
                tracing::warn!(topic = %topic, skipped, "session subscriber lagged");
            }
            Err(err) => return Err(AppError::internal("session_bus_closed", err.to_string())),
        }
    }
}

/// Blocking response body for a finished interaction.
pub fn completion_body(session: &Session, interaction: &Interaction) -> Value {
    json!({
        "id": session.id,
        "object": "chat.completion",
        "created": interaction.created.timestamp(),
        "model": session.model_name,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": interaction.response_message},
            "finish_reason": "stop"
        }],
        "usage": interaction.usage
    })
}
