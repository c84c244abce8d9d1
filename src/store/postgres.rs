//! PostgreSQL-хранилище.
//!
//! Транзакция check-in берёт `FOR UPDATE` сначала на строку регистрации,
//! потом на строку `allocator_state`. Порядок блокировок одинаковый для всех
//! check-in, поэтому взаимных блокировок между ними нет; ошибки сериализации
//! и deadlock (40001 / 40P01) всё равно отдаются как `Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{AllocationSnapshot, Store, StoreError, StoreTx};
use crate::database::Database;
use crate::models::{Registration, SeatId};

pub(crate) const ALLOCATOR_ID: &str = "seat_allocator";

const REGISTRATION_COLUMNS: &str =
    "id, registration_code, sname, checked_in, seats, check_in_timestamp";

// Структура для результата из БД
#[derive(sqlx::FromRow)]
struct RegistrationRow {
    id: Uuid,
    registration_code: String,
    sname: String,
    checked_in: bool,
    seats: Vec<String>,
    check_in_timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = StoreError;

    fn try_from(row: RegistrationRow) -> Result<Self, Self::Error> {
        let seats = row
            .seats
            .iter()
            .map(|s| {
                s.parse::<SeatId>()
                    .map_err(|e| StoreError::Corrupt(format!("registration {}: {}", row.id, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Registration {
            id: row.id,
            registration_code: row.registration_code,
            sname: row.sname,
            checked_in: row.checked_in,
            seats,
            check_in_timestamp: row.check_in_timestamp,
        })
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    let retryable = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "40001" || code == "40P01")
        .unwrap_or(false);

    if retryable {
        StoreError::Conflict
    } else {
        StoreError::Database(err)
    }
}

fn cursor_from_db(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative cursor {}", value)))
}

// Без строки `FOR UPDATE` ничего не блокирует, и два check-in прочитали бы
// одинаковый курсор. Такую базу считаем испорченной, а не начинаем с 0.
fn locked_cursor(value: Option<i64>) -> Result<u64, StoreError> {
    match value {
        Some(value) => cursor_from_db(value),
        None => Err(StoreError::Corrupt(format!(
            "allocator_state row '{}' is missing",
            ALLOCATOR_ID
        ))),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool.clone() }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(PgStoreTx { tx: Some(tx) }))
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Registration>, StoreError> {
        let row = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {} FROM registrations WHERE registration_code = $1 LIMIT 1",
            REGISTRATION_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Registration::try_from).transpose()
    }

    async fn get_registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        let row = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {} FROM registrations WHERE id = $1",
            REGISTRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Registration::try_from).transpose()
    }

    async fn allocation_snapshot(&self) -> Result<AllocationSnapshot, StoreError> {
        // REPEATABLE READ: оба запроса видят один и тот же снимок базы
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let rows = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {} FROM registrations WHERE checked_in ORDER BY check_in_timestamp, id",
            REGISTRATION_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;

        let cursor = sqlx::query_scalar::<_, i64>(
            "SELECT next_seat_index FROM allocator_state WHERE id = $1"
        )
        .bind(ALLOCATOR_ID)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        Ok(AllocationSnapshot {
            registrations: rows
                .into_iter()
                .map(Registration::try_from)
                .collect::<Result<_, _>>()?,
            cursor: cursor_from_db(cursor.unwrap_or(0))?,
        })
    }

    async fn cursor(&self) -> Result<u64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT next_seat_index FROM allocator_state WHERE id = $1"
        )
        .bind(ALLOCATOR_ID)
        .fetch_optional(&self.pool)
        .await?;

        cursor_from_db(value.unwrap_or(0))
    }

    async fn insert_registration(&self, registration: Registration) -> Result<bool, StoreError> {
        let seats: Vec<String> = registration.seats.iter().map(|s| s.to_string()).collect();
        let inserted = sqlx::query(
            r#"
            INSERT INTO registrations (id, registration_code, sname, checked_in, seats, check_in_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (registration_code) DO NOTHING
            "#
        )
        .bind(registration.id)
        .bind(&registration.registration_code)
        .bind(&registration.sname)
        .bind(registration.checked_in)
        .bind(seats)
        .bind(registration.check_in_timestamp)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    async fn seat_map_fingerprint(&self) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, Option<String>>(
            "SELECT seat_map_fingerprint FROM allocator_state WHERE id = $1"
        )
        .bind(ALLOCATOR_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    async fn set_seat_map_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO allocator_state (id, next_seat_index, seat_map_fingerprint)
            VALUES ($1, 0, $2)
            ON CONFLICT (id) DO UPDATE SET seat_map_fingerprint = EXCLUDED.seat_map_fingerprint
            "#
        )
        .bind(ALLOCATOR_ID)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgStoreTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgStoreTx {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn registration(&mut self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        let tx = self.open()?;
        let row = sqlx::query_as::<_, RegistrationRow>(&format!(
            "SELECT {} FROM registrations WHERE id = $1 FOR UPDATE",
            REGISTRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;

        row.map(Registration::try_from).transpose()
    }

    async fn cursor(&mut self) -> Result<u64, StoreError> {
        let tx = self.open()?;
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT next_seat_index FROM allocator_state WHERE id = $1 FOR UPDATE"
        )
        .bind(ALLOCATOR_ID)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;

        locked_cursor(value)
    }

    async fn assign_seats(
        &mut self,
        id: Uuid,
        seats: &[SeatId],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let seats: Vec<String> = seats.iter().map(|s| s.to_string()).collect();
        let tx = self.open()?;
        let updated = sqlx::query(
            r#"
            UPDATE registrations
            SET checked_in = TRUE, seats = $2, check_in_timestamp = $3
            WHERE id = $1
            "#
        )
        .bind(id)
        .bind(seats)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(classify)?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::MissingRegistration(id));
        }
        Ok(())
    }

    async fn set_cursor(&mut self, next: u64) -> Result<(), StoreError> {
        let next = i64::try_from(next)
            .map_err(|_| StoreError::Corrupt(format!("cursor {} does not fit BIGINT", next)))?;
        let tx = self.open()?;
        sqlx::query(
            r#"
            INSERT INTO allocator_state (id, next_seat_index)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET next_seat_index = EXCLUDED.next_seat_index
            "#
        )
        .bind(ALLOCATOR_ID)
        .bind(next)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_cursor_is_corrupt() {
        assert!(matches!(cursor_from_db(-2), Err(StoreError::Corrupt(_))));
        assert_eq!(cursor_from_db(42).unwrap(), 42);
    }

    #[test]
    fn missing_allocator_row_is_not_a_zero_cursor() {
        assert!(matches!(locked_cursor(None), Err(StoreError::Corrupt(_))));
        assert_eq!(locked_cursor(Some(6)).unwrap(), 6);
    }

    #[test]
    fn row_with_bad_seat_is_corrupt() {
        let row = RegistrationRow {
            id: Uuid::new_v4(),
            registration_code: "R-1".to_string(),
            sname: "Ada".to_string(),
            checked_in: true,
            seats: vec!["A-31".to_string(), "garbage".to_string()],
            check_in_timestamp: None,
        };
        assert!(matches!(Registration::try_from(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn non_database_errors_are_not_conflicts() {
        assert!(!classify(sqlx::Error::RowNotFound).is_conflict());
    }
}
