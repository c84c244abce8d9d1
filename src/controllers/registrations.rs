use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::error::ApiError;
use crate::models::{Registration, SeatId};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/find-registration", post(find_registration))
        .route("/check-in", post(check_in))
}

/* ---------- helpers ---------- */

// Первое сообщение из ошибок валидатора
fn validation_message(errors: &validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .values()
        .flat_map(|errs| errs.iter())
        .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
        .unwrap_or_else(|| errors.to_string())
}

fn parse_body<T: Validate>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    let Json(req) = payload.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    req.validate()
        .map_err(|errors| ApiError::Validation(validation_message(&errors)))?;
    Ok(req)
}

/* ---------- FIND ---------- */

// POST /find-registration
#[derive(Debug, Deserialize, Validate)]
struct FindRegistrationRequest {
    #[serde(default)]
    #[validate(
        required(message = "Code is required."),
        length(min = 1, message = "Code is required.")
    )]
    code: Option<String>,
}

/// Запись регистрации в том виде, в каком её видит клиент.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationData {
    registration_code: String,
    checked_in: bool,
    sname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    seat1: Option<SeatId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seat2: Option<SeatId>,
    seats: Vec<SeatId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check_in_timestamp: Option<DateTime<Utc>>,
}

impl From<Registration> for RegistrationData {
    fn from(r: Registration) -> Self {
        RegistrationData {
            seat1: r.seat(0).cloned(),
            seat2: r.seat(1).cloned(),
            registration_code: r.registration_code,
            checked_in: r.checked_in,
            sname: r.sname,
            seats: r.seats,
            check_in_timestamp: r.check_in_timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
struct FindRegistrationResponse {
    data: RegistrationData,
    doc_id: Uuid,
}

async fn find_registration(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FindRegistrationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    let code = req.code.unwrap_or_default();

    let registration = state
        .store
        .find_by_code(&code)
        .await?
        .ok_or_else(|| ApiError::NotFound("Registration code not found.".to_string()))?;

    if registration.checked_in {
        tracing::info!("find_registration: code {} already used", code);
        return Err(ApiError::AlreadyCheckedIn {
            name: registration.sname,
            seats: registration.seats,
        });
    }

    let doc_id = registration.id;
    Ok((
        StatusCode::OK,
        Json(FindRegistrationResponse { data: registration.into(), doc_id }),
    ))
}

/* ---------- CHECK-IN ---------- */

// POST /check-in
#[derive(Debug, Deserialize, Validate)]
struct CheckInRequest {
    #[serde(default)]
    #[validate(
        required(message = "Document ID is required."),
        length(min = 1, message = "Document ID is required.")
    )]
    doc_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckInResponse {
    message: &'static str,
    seat1: Option<SeatId>,
    seat2: Option<SeatId>,
    seats: Vec<SeatId>,
}

async fn check_in(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CheckInRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    let doc_id = req.doc_id.unwrap_or_default();

    // Невалидный id документа - такой регистрации просто нет
    let registration_id = Uuid::parse_str(doc_id.trim())
        .map_err(|_| ApiError::NotFound("Registration not found.".to_string()))?;

    let allocation = state.allocator.check_in(registration_id).await?;

    Ok((
        StatusCode::OK,
        Json(CheckInResponse {
            message: "Check-in successful!",
            seat1: allocation.seats.first().cloned(),
            seat2: allocation.seats.get(1).cloned(),
            seats: allocation.seats,
        }),
    ))
}
