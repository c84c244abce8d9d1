use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use crate::models::SeatId;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/get-seat-status", get(get_seat_status))
}

#[derive(Debug, Serialize)]
struct SeatStatusResponse {
    allocated_seats: Vec<SeatId>,
    allocated_count: u64,
    // Результат сверки курсора и выданных мест
    consistent: bool,
    duplicates: Vec<SeatId>,
}

// GET /get-seat-status
async fn get_seat_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.status.status().await?;

    let consistent = status.is_consistent();
    let duplicates = status.duplicate_seats();
    if !consistent {
        tracing::warn!(
            "get_seat_status: cursor {} vs {} attached seats, {} duplicates",
            status.allocated_count,
            status.allocated_seats.len(),
            duplicates.len()
        );
    }

    Ok((
        StatusCode::OK,
        Json(SeatStatusResponse {
            allocated_seats: status.allocated_seats,
            allocated_count: status.allocated_count,
            consistent,
            duplicates,
        }),
    ))
}
