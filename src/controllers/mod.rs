pub mod error;
pub mod registrations;
pub mod status;

use axum::Router;
use std::sync::Arc;

pub use error::ApiError;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(registrations::routes())
        .merge(status::routes())
}
