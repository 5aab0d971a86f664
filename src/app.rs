use crate::apps::AppStore;
use crate::auth::AuthState;
use crate::bus::EventBus;
use crate::config::{BuiltinProviders, env_nonempty};
use crate::disambiguator::{Disambiguator, ModelCatalog};
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::providers::ProviderStore;
use crate::recorder::Recorder;
use crate::resolver::Resolver;
use crate::store::{SessionStore, SqliteSessionStore};
use crate::users::UserStore;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub provider_store: ProviderStore,
    pub app_store: AppStore,
    pub sessions: Arc<dyn SessionStore>,
    pub recorder: Recorder,
    pub resolver: Resolver,
    pub disambiguator: Disambiguator,
    pub dispatcher: Dispatcher,
    pub bus: EventBus,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MODELS_CACHE_TTL_SECONDS: u64 = 300;
pub const MIN_MODELS_CACHE_TTL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_INTERACTIONS: usize = 20;
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub max_body_bytes: usize,
    pub models_cache_ttl: Duration,
    pub max_interactions: usize,
    pub upstream_timeout_ms: u64,
    pub builtins: BuiltinProviders,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen =
            env_nonempty("RELAYGATE_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_nonempty("RELAYGATE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        let max_body_bytes = parse_env("RELAYGATE_MAX_BODY_BYTES").unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let ttl_seconds = parse_env("RELAYGATE_MODELS_CACHE_TTL_SECONDS")
            .unwrap_or(DEFAULT_MODELS_CACHE_TTL_SECONDS)
            .max(MIN_MODELS_CACHE_TTL_SECONDS);
        let max_interactions =
            parse_env("RELAYGATE_MAX_INTERACTIONS").unwrap_or(DEFAULT_MAX_INTERACTIONS);
        let upstream_timeout_ms =
            parse_env("RELAYGATE_UPSTREAM_TIMEOUT_MS").unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);
        Self {
            listen,
            metrics_path,
            database_dsn,
            max_body_bytes,
            models_cache_ttl: Duration::from_secs(ttl_seconds),
            max_interactions,
            upstream_timeout_ms,
            builtins: BuiltinProviders::from_env(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_nonempty(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let pool = open_pool(&runtime).await?;
    let store = SqliteSessionStore::new(pool.clone())
        .await
        .map_err(|err| init_error("session_store_init_failed", err))?;
    load_state_with_sessions(runtime, pool, Arc::new(store)).await
}

/// Builds the state around a caller-supplied session store. The pool still
/// backs users, providers and apps.
pub async fn load_state_with_sessions(
    runtime: RuntimeConfig,
    pool: sqlx::Pool<sqlx::Sqlite>,
    sessions: Arc<dyn SessionStore>,
) -> AppResult<AppState> {
    let auth = AuthState::new();

    let http = reqwest::Client::builder()
        .user_agent("relaygate/0.1")
        .build()
        .map_err(|err| init_error("http_client_init_failed", err.to_string()))?;

    let user_store = UserStore::new(pool.clone())
        .await
        .map_err(|err| init_error("user_store_init_failed", err))?;
    let provider_store = ProviderStore::new(pool.clone())
        .await
        .map_err(|err| init_error("provider_store_init_failed", err))?;
    let app_store = AppStore::new(pool)
        .await
        .map_err(|err| init_error("app_store_init_failed", err))?;

    let metrics = init_metrics()?;

    let builtins = Arc::new(runtime.builtins.clone());
    let resolver = Resolver::new(provider_store.clone(), user_store.clone(), builtins);
    let disambiguator =
        Disambiguator::new(ModelCatalog::new(runtime.models_cache_ttl), resolver.clone());
    let dispatcher = Dispatcher::new(http, user_store.clone(), runtime.upstream_timeout_ms);
    let recorder = Recorder::new(sessions.clone());

    tracing::info!(
        default_provider = %runtime.builtins.default_provider,
        configured_builtins = runtime.builtins.configured().count(),
        "gateway state loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth,
        metrics,
        user_store,
        provider_store,
        app_store,
        sessions,
        recorder,
        resolver,
        disambiguator,
        dispatcher,
        bus: EventBus::default(),
    })
}

pub async fn open_pool(runtime: &RuntimeConfig) -> AppResult<sqlx::Pool<sqlx::Sqlite>> {
    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| init_error("database_init_failed", err))?;

    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| init_error("database_dsn_parse_failed", err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5)),
        )
        .await
        .map_err(|err| init_error("database_init_failed", err.to_string()))
}

fn init_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::internal(code, message)
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(init_error("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| init_error("metrics_init_failed", "metrics recorder not available"))
}

fn resolve_database_dsn() -> String {
    env_nonempty("RELAYGATE_DATABASE_DSN")
        .or_else(|| env_nonempty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/relaygate.db".to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let max_body_bytes = state.runtime.max_body_bytes;
    Router::<AppState>::new()
        .merge(build_openai_router(&metrics_path))
        .nest("/api", build_api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_openai_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/messages", post(crate::anthropic_proxy::create_messages))
        .route(metrics_path, get(crate::handlers::metrics))
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/sessions/chat",
            post(crate::session_handlers::start_chat_session),
        )
        .route(
            "/v1/provider-endpoints",
            get(crate::handlers::list_provider_endpoints),
        )
}
