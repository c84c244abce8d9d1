//! Хранилище регистраций и курсора выдачи мест.
//!
//! Всё общее изменяемое состояние живёт здесь, а не в процессе: курсор
//! `next_seat_index` и записи регистраций меняются только внутри транзакции
//! [`StoreTx`]. От реализации требуется:
//! - снимок (snapshot) прочитанных в транзакции записей;
//! - `commit` проходит, только если никто не изменил прочитанные записи,
//!   иначе [`StoreError::Conflict`];
//! - незакоммиченная транзакция при drop просто отбрасывается.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Registration, SeatId};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("concurrent modification detected, transaction aborted")]
    Conflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("transaction is already finished")]
    TransactionClosed,
    #[error("registration {0} does not exist")]
    MissingRegistration(Uuid),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Конфликт можно повторить целиком новой транзакцией, остальное - нет.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

/// Согласованный срез выдачи: регистрации с `checked_in = true` и курсор,
/// прочитанные вместе, без промежуточных commit между ними.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationSnapshot {
    pub registrations: Vec<Registration>,
    pub cursor: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Открывает транзакцию check-in.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Поиск регистрации по коду (вне транзакции).
    async fn find_by_code(&self, code: &str) -> Result<Option<Registration>, StoreError>;

    async fn get_registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError>;

    /// Отмеченные регистрации и курсор из одного снимка.
    async fn allocation_snapshot(&self) -> Result<AllocationSnapshot, StoreError>;

    /// Текущее значение курсора, 0 если его ещё нет.
    async fn cursor(&self) -> Result<u64, StoreError>;

    /// Добавляет регистрацию; `false`, если такой код уже есть.
    async fn insert_registration(&self, registration: Registration) -> Result<bool, StoreError>;

    /// Отпечаток seat map, в который указывает курсор.
    async fn seat_map_fingerprint(&self) -> Result<Option<String>, StoreError>;

    async fn set_seat_map_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn registration(&mut self, id: Uuid) -> Result<Option<Registration>, StoreError>;

    async fn cursor(&mut self) -> Result<u64, StoreError>;

    /// Помечает регистрацию как checked-in и прикрепляет места.
    async fn assign_seats(
        &mut self,
        id: Uuid,
        seats: &[SeatId],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_cursor(&mut self, next: u64) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
