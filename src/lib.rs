pub mod config;
pub mod database;
pub mod models;
pub mod controllers;
pub mod services;
pub mod store;

use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, services::ServeFile, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{StoreBackend, Venue, VenueConfig};
use crate::services::allocator::{AllocationPolicy, SeatAllocator};
use crate::services::seat_map::build_seat_map;
use crate::services::status::StatusReporter;
use crate::store::{MemoryStore, PgStore, Store};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub config: crate::config::Config,
    pub store: Arc<dyn Store>,
    pub allocator: SeatAllocator,
    pub status: StatusReporter,
}

impl AppState {
    pub async fn new(config: crate::config::Config) -> anyhow::Result<Arc<Self>> {
        let venue = VenueConfig::load(config.venue.path.as_deref())
            .context("Failed to load venue configuration")?
            .validate()
            .context("Invalid venue configuration")?;

        let store: Arc<dyn Store> = match config.store.backend {
            StoreBackend::Postgres => {
                let db = crate::database::Database::connect(config.database_url()?, config.store.pool_size)
                    .await
                    .context("Failed to connect to database")?;
                db.migrate().await.context("Failed to run migrations")?;
                Arc::new(PgStore::new(&db))
            }
            StoreBackend::Memory => {
                warn!("Using in-memory store: registrations and seat cursor are lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        if let Some(path) = &config.store.seed_file {
            crate::services::seed::seed_from_file(store.as_ref(), path).await?;
        }

        Self::with_store(config, store, venue).await
    }

    /// Собирает состояние поверх готового хранилища и провалидированного зала.
    pub async fn with_store(
        config: crate::config::Config,
        store: Arc<dyn Store>,
        venue: Venue,
    ) -> anyhow::Result<Arc<Self>> {
        for warning in &venue.warnings {
            warn!("Venue {}: {}", venue.version, warning);
        }

        let seat_map = Arc::new(build_seat_map(&venue.geometry, &venue.reserved));
        info!(
            "Generated seat map for venue {} with {} available seats (fingerprint {})",
            venue.version,
            seat_map.len(),
            seat_map.fingerprint()
        );

        let policy = AllocationPolicy {
            seats_per_registration: venue.seats_per_registration,
            max_attempts: config.allocator.max_attempts,
            backoff: Duration::from_millis(config.allocator.backoff_ms),
        };
        let allocator = SeatAllocator::new(store.clone(), seat_map, policy);
        allocator
            .bind_seat_map()
            .await
            .context("Allocation cursor does not match the configured venue")?;

        Ok(Arc::new(Self {
            status: StatusReporter::new(store.clone()),
            config,
            store,
            allocator,
        }))
    }
}

/// Главный роутер приложения.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route_service("/", ServeFile::new(&state.config.app.index_file))
        .route("/health", get(|| async { "OK" }))
        .merge(crate::controllers::routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
