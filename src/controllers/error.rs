//! Перевод ошибок домена в HTTP-ответы `{ "message": ... }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::models::SeatId;
use crate::services::allocator::CheckInError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    /// Нет обязательного поля или тело не разобрать -> 400
    Validation(String),
    /// Регистрация не найдена -> 404
    NotFound(String),
    /// Код уже использован -> 409, с именем и местами для показа на стойке
    AlreadyCheckedIn { name: String, seats: Vec<SeatId> },
    /// Всё остальное (зал заполнен, ошибки хранилища) -> 500
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seats: Option<Vec<SeatId>>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyCheckedIn { .. } => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CheckInError> for ApiError {
    fn from(err: CheckInError) -> Self {
        match err {
            CheckInError::NotFound(_) => ApiError::NotFound("Registration not found.".to_string()),
            CheckInError::AlreadyCheckedIn { name, seats } => ApiError::AlreadyCheckedIn { name, seats },
            CheckInError::Store(e) => e.into(),
            other @ (CheckInError::Exhausted { .. } | CheckInError::Contention { .. }) => {
                tracing::warn!("check-in rejected: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!("store error: {:?}", err);
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::AlreadyCheckedIn { name, seats } => {
                let listed: Vec<String> = seats.iter().map(|s| s.to_string()).collect();
                ErrorBody {
                    message: format!("Code already used for {}. Seats: {}", name, listed.join(", ")),
                    name: Some(name),
                    seats: Some(seats),
                }
            }
            ApiError::Validation(message) | ApiError::NotFound(message) | ApiError::Internal(message) => {
                ErrorBody { message, name: None, seats: None }
            }
        };

        (status, Json(body)).into_response()
    }
}
