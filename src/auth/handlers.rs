use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::{debug, instrument};

use crate::{
    auth::{
        dto::{MessageResponse, RegisterRequest, RegisterResponse},
        services::{RegistrationOutcome, RegistrationRequest, RegistrationService, ValidationFailure},
    },
    state::AppState,
};

const UNREADABLE_BODY: &str =
    "Request body must be a JSON object with string fields username, email, and password.";

pub fn auth_routes() -> Router<AppState> {
    Router::new().route("/auth/register", post(register))
}

#[instrument(skip(service, payload))]
pub async fn register(
    State(service): State<RegistrationService>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> RegistrationOutcome {
    let request = match payload {
        Ok(Json(body)) => RegistrationRequest::from(body),
        Err(rejection) => {
            // The rejection text can quote the submitted values; keep it out of logs.
            debug!(status = %rejection.status(), "unreadable registration body");
            return RegistrationOutcome::ValidationFailed(ValidationFailure::Rejected(vec![
                UNREADABLE_BODY.to_string(),
            ]));
        }
    };
    service.register(request).await
}

impl IntoResponse for RegistrationOutcome {
    fn into_response(self) -> Response {
        match self {
            RegistrationOutcome::Created(user) => (
                StatusCode::CREATED,
                Json(RegisterResponse {
                    message: "User registered successfully. Proceed to login.",
                    user,
                }),
            )
                .into_response(),
            RegistrationOutcome::ValidationFailed(ValidationFailure::Rejected(errors)) => (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse {
                    errors: Some(errors),
                    ..MessageResponse::new("Validation failed.")
                }),
            )
                .into_response(),
            RegistrationOutcome::ValidationFailed(failure) => (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse::new(failure.to_string())),
            )
                .into_response(),
            RegistrationOutcome::Conflict(field) => (
                StatusCode::CONFLICT,
                Json(MessageResponse {
                    field: Some(field),
                    ..MessageResponse::new(format!("The {field} is already registered."))
                }),
            )
                .into_response(),
            RegistrationOutcome::ServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageResponse::new("Server error during registration.")),
            )
                .into_response(),
        }
    }
}
