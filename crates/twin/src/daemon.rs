use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::{Db, today};
use crate::error::{ErrorResponse, TwinError};
use crate::id::kind_info;
use crate::types::{AllocationStrategy, CreateRecordParams, EntityKind, KindCount};

type AppState = Arc<Mutex<Db>>;

pub struct DaemonConfig {
    pub port: u16,
    pub project_dir: PathBuf,
    pub strategy: AllocationStrategy,
}

struct AppError(TwinError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TwinError::Validation(_) => StatusCode::BAD_REQUEST,
            TwinError::NotFound { .. } => StatusCode::NOT_FOUND,
            TwinError::DuplicateId(_) | TwinError::MalformedId { .. } => StatusCode::CONFLICT,
            TwinError::Internal(_) | TwinError::Remote { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorResponse::from(&self.0);
        (status, Json(body)).into_response()
    }
}

impl From<TwinError> for AppError {
    fn from(err: TwinError) -> Self {
        AppError(err)
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    message: String,
    data: T,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        message: message.into(),
        data,
    })
}

fn lock(state: &AppState) -> Result<MutexGuard<'_, Db>, AppError> {
    state
        .lock()
        .map_err(|_| AppError(TwinError::Internal("database lock poisoned".into())))
}

fn parse_kind(raw: &str) -> Result<EntityKind, AppError> {
    raw.parse::<EntityKind>()
        .map_err(|e| AppError(TwinError::Validation(e)))
}

fn actor_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-twin-actor")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn resolve_actor(body_actor: Option<String>, headers: &HeaderMap) -> String {
    body_actor
        .or_else(|| actor_from_headers(headers))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn router(db: Db) -> Router {
    let state: AppState = Arc::new(Mutex::new(db));

    Router::new()
        .route("/status", get(status))
        .route("/kinds", get(list_kinds))
        .route("/records/{kind}", get(list_records).post(create_record))
        .route("/records/{kind}/next", get(next_id))
        .route(
            "/records/{kind}/{id}",
            get(get_record).patch(update_record),
        )
        .route("/records/{kind}/{id}/history", get(record_history))
        .with_state(state)
}

pub async fn start(config: DaemonConfig) -> Result<(), TwinError> {
    let db = Db::open(&config.project_dir, config.strategy)?;
    let app = router(db);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TwinError::Internal(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(
        port = config.port,
        strategy = %config.strategy,
        dir = %config.project_dir.display(),
        "twin daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TwinError::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

// --- Meta endpoints ---

#[derive(Serialize)]
struct StatusBody {
    strategy: AllocationStrategy,
    kinds: Vec<KindCount>,
}

async fn status(State(db): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let db = lock(&db)?;
    let body = StatusBody {
        strategy: db.strategy,
        kinds: db.kind_counts()?,
    };
    Ok(ok("status", body))
}

async fn list_kinds() -> impl IntoResponse {
    let today = today();
    let kinds: Vec<_> = EntityKind::ALL
        .into_iter()
        .map(|k| kind_info(k, today))
        .collect();
    ok(format!("{} kinds", kinds.len()), kinds)
}

// --- Record endpoints ---

#[derive(Deserialize)]
struct WriteBody {
    #[serde(default)]
    data: Value,
    actor: Option<String>,
}

fn write_body(body: Result<Json<WriteBody>, JsonRejection>) -> Result<WriteBody, AppError> {
    body.map(|Json(body)| body)
        .map_err(|e| AppError(TwinError::Validation(e.body_text())))
}

fn object_body(data: Value) -> Result<Map<String, Value>, AppError> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(AppError(TwinError::Validation(
            "`data` must be a JSON object".into(),
        ))),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_records(
    State(db): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let db = lock(&db)?;
    let records = db.list_records(kind, query.limit)?;
    Ok(ok(format!("{} {kind} records", records.len()), records))
}

async fn create_record(
    State(db): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Result<Json<WriteBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let body = write_body(body)?;
    let params = CreateRecordParams {
        kind,
        data: object_body(body.data)?,
        actor: resolve_actor(body.actor, &headers),
    };

    let db = lock(&db)?;
    let record = db.create_record(&params)?;
    Ok((
        StatusCode::CREATED,
        ok(format!("{kind} {} created", record.id), record),
    ))
}

#[derive(Serialize)]
struct NextId {
    kind: EntityKind,
    id: String,
}

async fn next_id(
    State(db): State<AppState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let db = lock(&db)?;
    let id = db.peek_id(kind, today())?;
    Ok(ok(format!("next {kind} identifier"), NextId { kind, id }))
}

async fn get_record(
    State(db): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let db = lock(&db)?;
    let record = db.get_record(kind, &id)?;
    Ok(ok(format!("{kind} {id}"), record))
}

async fn update_record(
    State(db): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<WriteBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let body = write_body(body)?;
    let patch = object_body(body.data)?;
    let actor = resolve_actor(body.actor, &headers);

    let db = lock(&db)?;
    let record = db.update_record(kind, &id, &patch, &actor)?;
    Ok(ok(format!("{kind} {id} updated"), record))
}

async fn record_history(
    State(db): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let kind = parse_kind(&kind)?;
    let db = lock(&db)?;
    let events = db.record_history(kind, &id)?;
    Ok(ok(format!("{} events", events.len()), events))
}
