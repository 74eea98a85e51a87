use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;

/// Liveness probe. Always returns 200 once the process is serving traffic.
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ap-intake",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe. Verifies the database pool can serve a connection.
pub async fn ready(State(pool): State<Arc<PgPool>>) -> (StatusCode, Json<Value>) {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool.as_ref()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "error": e.to_string() })),
        ),
    }
}
