//! HTTP front end
//!
//! Provides REST API endpoints for:
//! - Script execution
//! - Btable listing
//! - Health checks

use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bql_engine::{Engine, EngineError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Mutex<Engine>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}

#[derive(Deserialize)]
pub struct QueryRequest {
    query: String,
}

#[derive(Serialize)]
pub struct QueryResponse {
    results: Vec<Value>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(execute_query))
        .route("/btables", get(list_btables))
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn serve(addr: &str, engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(AppState::new(engine));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("BQL server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Run `f` against the engine on the blocking pool; analysis can take seconds.
async fn with_engine<T, F>(state: AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Engine) -> Result<T, EngineError> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        let mut engine = state
            .engine
            .lock()
            .map_err(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "engine lock poisoned"))?;
        f(&mut engine).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

async fn execute_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    tracing::debug!(query = %req.query, "HTTP query");
    let results = with_engine(state, move |engine| engine.execute_script(&req.query)).await?;
    Ok(Json(QueryResponse {
        results: results.iter().map(|r| r.to_json()).collect(),
    }))
}

async fn list_btables(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    with_engine(state, |engine| engine.btables()).await.map(Json)
}

async fn health_check() -> &'static str {
    "OK"
}
