// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// Model work is CPU-bound, so every engine call runs on the blocking pool.
//
// Engine errors map to status codes:
//   422  shape mismatch, empty advance, malformed payload
//   409  uninitialized track, stale session, out-of-order update
//   500  non-finite intermediate values, internal failures
//
// CORS is configured permissively; tighten `allow_origin` in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::engine::{new_session_id, views, Prediction};
use crate::error::EngineError;
use crate::types::{SessionId, TrackId, TrackMap};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/config", get(config))
        .route("/api/v1/sessions", post(initialize_session))
        .route(
            "/api/v1/sessions/:id",
            get(session_snapshot).delete(reset_session),
        )
        .route("/api/v1/sessions/:id/advance", post(advance_session))
        .route("/api/v1/predict", post(predict))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Engine(err) => match err {
                EngineError::ShapeMismatch { .. } | EngineError::EmptyAdvance { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::Uninitialized { .. }
                | EngineError::StaleSession { .. }
                | EngineError::OutOfOrder { .. } => StatusCode::CONFLICT,
                EngineError::NonFinite { .. } | EngineError::InvalidConfig(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::BadRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Engine(err) => match err {
                EngineError::ShapeMismatch { .. } => "shape_mismatch",
                EngineError::InvalidConfig(_) => "invalid_config",
                EngineError::Uninitialized { .. } => "uninitialized",
                EngineError::StaleSession { .. } => "stale_session",
                EngineError::OutOfOrder { .. } => "out_of_order",
                EngineError::EmptyAdvance { .. } => "empty_advance",
                EngineError::NonFinite { .. } => "non_finite",
            },
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(err) => write!(f, "{err}"),
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let (Self::Engine(EngineError::NonFinite { component }), Some(obj)) =
            (&self, body.as_object_mut())
        {
            obj.insert(
                "component".to_string(),
                serde_json::to_value(component).unwrap_or_default(),
            );
        }
        (self.status(), Json(body)).into_response()
    }
}

/// Record engine failures in the status log before answering.
fn logged(state: &AppState, err: ApiError) -> ApiError {
    if let ApiError::Engine(inner) = &err {
        warn!(error = %inner, kind = err.kind(), "engine call failed");
        state.push_error(inner.to_string(), Some(err.kind().to_string()));
    }
    err
}

/// Run CPU-bound engine work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("inference task failed: {e}")))?
}

// =============================================================================
// Payload conversion
// =============================================================================

/// `[batch][steps][features]`
type WindowRows = Vec<Vec<Vec<f64>>>;
/// `[batch][features]`
type BarRows = Vec<Vec<f64>>;

fn window_array(track: TrackId, rows: WindowRows) -> Result<Array3<f64>, ApiError> {
    let batch = rows.len();
    let steps = rows.first().map_or(0, Vec::len);
    let features = rows.first().and_then(|r| r.first()).map_or(0, Vec::len);
    if batch == 0 || steps == 0 || features == 0 {
        return Err(ApiError::BadRequest(format!("{track} window is empty")));
    }
    let mut flat = Vec::with_capacity(batch * steps * features);
    for row in rows {
        if row.len() != steps {
            return Err(EngineError::shape(format!("{track} window rows"), steps, row.len()).into());
        }
        for step in row {
            if step.len() != features {
                return Err(
                    EngineError::shape(format!("{track} feature count"), features, step.len()).into(),
                );
            }
            flat.extend(step);
        }
    }
    Array3::from_shape_vec((batch, steps, features), flat)
        .map_err(|e| ApiError::BadRequest(format!("{track} window: {e}")))
}

fn bar_array(track: TrackId, rows: BarRows) -> Result<Array2<f64>, ApiError> {
    let batch = rows.len();
    let features = rows.first().map_or(0, Vec::len);
    if batch == 0 || features == 0 {
        return Err(ApiError::BadRequest(format!("{track} bar is empty")));
    }
    let mut flat = Vec::with_capacity(batch * features);
    for row in rows {
        if row.len() != features {
            return Err(EngineError::shape(format!("{track} feature count"), features, row.len()).into());
        }
        flat.extend(row);
    }
    Array2::from_shape_vec((batch, features), flat)
        .map_err(|e| ApiError::BadRequest(format!("{track} bar: {e}")))
}

fn all_windows(mut windows: HashMap<TrackId, WindowRows>) -> Result<TrackMap<Array3<f64>>, ApiError> {
    TrackMap::try_from_fn(|track| {
        let rows = windows
            .remove(&track)
            .ok_or_else(|| ApiError::BadRequest(format!("missing window for track {track}")))?;
        window_array(track, rows)
    })
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status & config (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status())
}

async fn config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.config().clone())
}

// =============================================================================
// Sessions (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct InitializeRequest {
    #[serde(default)]
    session_id: Option<SessionId>,
    windows: HashMap<TrackId, WindowRows>,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    bars: HashMap<TrackId, BarRows>,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    windows: HashMap<TrackId, WindowRows>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: SessionId,
    as_of: DateTime<Utc>,
    prediction: Prediction,
}

async fn initialize_session(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitializeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = req.session_id.unwrap_or_else(new_session_id);
    let as_of = req.as_of.unwrap_or_else(Utc::now);
    let engine = state.engine.clone();
    let id = session_id.clone();

    let prediction = blocking(move || {
        let histories = all_windows(req.windows)?;
        Ok(engine.initialize_session(&id, views(&histories), as_of)?)
    })
    .await
    .map_err(|e| logged(&state, e))?;

    state.increment_version();
    info!(session = %session_id, "session initialized via API");
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id,
            as_of,
            prediction,
        }),
    ))
}

async fn advance_session(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<AdvanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let as_of = req.as_of.unwrap_or_else(Utc::now);
    let engine = state.engine.clone();
    let id = session_id.clone();

    let prediction = blocking(move || {
        let mut bars = req.bars;
        let owned = TrackMap::try_from_fn(|track| {
            bars.remove(&track).map(|rows| bar_array(track, rows)).transpose()
        })?;
        let bar_views = owned.as_ref().map(|_, bar| bar.as_ref().map(|b| b.view()));
        Ok(engine.advance(&id, bar_views, as_of)?)
    })
    .await
    .map_err(|e| logged(&state, e))?;

    state.increment_version();
    debug!(session = %session_id, "session advanced via API");
    Ok(Json(SessionResponse {
        session_id,
        as_of,
        prediction,
    }))
}

async fn reset_session(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.engine.reset_session(&session_id) {
        return Err(ApiError::NotFound(format!("unknown session {session_id:?}")));
    }
    state.increment_version();
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "reset": true,
    })))
}

async fn session_snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .session_snapshot(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown session {session_id:?}")))
}

// =============================================================================
// Stateless prediction (authenticated)
// =============================================================================

async fn predict(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let prediction = blocking(move || {
        let windows = all_windows(req.windows)?;
        Ok(engine.predict(views(&windows))?)
    })
    .await
    .map_err(|e| logged(&state, e))?;
    Ok(Json(prediction))
}

// =============================================================================
// Tests
// =============================================================================
