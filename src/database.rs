//! Подключение к PostgreSQL: пул, миграции и строка курсора.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use crate::store::postgres::ALLOCATOR_ID;
use crate::store::StoreError;

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!("Database connected (pool size {})", pool_size);
        Ok(Database { pool })
    }

    /// Накатывает миграции и гарантирует строку `allocator_state`.
    ///
    /// Транзакция check-in блокирует эту строку через `FOR UPDATE`, поэтому
    /// к первому check-in она обязана существовать.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        let created = sqlx::query(
            r#"
            INSERT INTO allocator_state (id, next_seat_index)
            VALUES ($1, 0)
            ON CONFLICT (id) DO NOTHING
            "#
        )
        .bind(ALLOCATOR_ID)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if created > 0 {
            info!("Created allocator state row '{}'", ALLOCATOR_ID);
        }
        info!("Migrations completed");
        Ok(())
    }
}
