use axum::{routing::get, Json, Router};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{auth::dto::MessageResponse, state::AppState};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(welcome))
        .route("/api/status", get(status))
}

pub async fn welcome() -> Json<MessageResponse> {
    Json(MessageResponse::new("Welcome to Nudge Server API"))
}

pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "Server is running",
        timestamp: OffsetDateTime::now_utc(),
    })
}
