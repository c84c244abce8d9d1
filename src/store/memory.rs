//! In-memory хранилище с оптимистичными транзакциями.
//!
//! Каждая запись версионирована. Транзакция запоминает версии прочитанного,
//! копит записи у себя и на commit под одной write-блокировкой проверяет,
//! что версии не изменились. Если изменились - [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AllocationSnapshot, Store, StoreError, StoreTx};
use crate::models::{Registration, SeatId};

#[derive(Debug, Clone, Default)]
struct Versioned<T> {
    value: T,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    registrations: BTreeMap<Uuid, Versioned<Registration>>,
    codes: HashMap<String, Uuid>,
    cursor: Versioned<u64>,
    fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Выставляет курсор в обход транзакций (для импорта состояния и тестов).
    pub async fn set_cursor(&self, value: u64) {
        let mut state = self.state.write().await;
        state.cursor.value = value;
        state.cursor.version += 1;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            snapshots: HashMap::new(),
            cursor_read: None,
            cursor_write: None,
            finished: false,
        }))
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Registration>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .get(code)
            .and_then(|id| state.registrations.get(id))
            .map(|r| r.value.clone()))
    }

    async fn get_registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        let state = self.state.read().await;
        Ok(state.registrations.get(&id).map(|r| r.value.clone()))
    }

    async fn allocation_snapshot(&self) -> Result<AllocationSnapshot, StoreError> {
        // Одна блокировка на оба чтения: commit применяет места и курсор тоже под одной
        let state = self.state.read().await;
        let registrations = state
            .registrations
            .values()
            .filter(|r| r.value.checked_in)
            .map(|r| r.value.clone())
            .collect();
        Ok(AllocationSnapshot { registrations, cursor: state.cursor.value })
    }

    async fn cursor(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.cursor.value)
    }

    async fn insert_registration(&self, registration: Registration) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.codes.contains_key(&registration.registration_code) {
            return Ok(false);
        }
        state
            .codes
            .insert(registration.registration_code.clone(), registration.id);
        state.registrations.insert(
            registration.id,
            Versioned { value: registration, version: 1 },
        );
        Ok(true)
    }

    async fn seat_map_fingerprint(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.fingerprint.clone())
    }

    async fn set_seat_map_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.state.write().await.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}

pub struct MemoryTx {
    state: Arc<RwLock<State>>,
    // id -> (версия при чтении, локальная копия с изменениями)
    snapshots: HashMap<Uuid, (u64, Registration)>,
    cursor_read: Option<u64>,
    cursor_write: Option<u64>,
    finished: bool,
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn registration(&mut self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        self.ensure_open()?;
        if let Some((_, registration)) = self.snapshots.get(&id) {
            return Ok(Some(registration.clone()));
        }

        // Имитация сетевого round-trip: даём другим задачам вклиниться
        tokio::task::yield_now().await;

        let state = self.state.read().await;
        let Some(record) = state.registrations.get(&id) else {
            return Ok(None);
        };
        self.snapshots
            .insert(id, (record.version, record.value.clone()));
        Ok(Some(record.value.clone()))
    }

    async fn cursor(&mut self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        if let Some(value) = self.cursor_write {
            return Ok(value);
        }

        tokio::task::yield_now().await;

        let state = self.state.read().await;
        if self.cursor_read.is_none() {
            self.cursor_read = Some(state.cursor.version);
        }
        Ok(state.cursor.value)
    }

    async fn assign_seats(
        &mut self,
        id: Uuid,
        seats: &[SeatId],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.snapshots.contains_key(&id) && self.registration(id).await?.is_none() {
            return Err(StoreError::MissingRegistration(id));
        }
        if let Some((_, registration)) = self.snapshots.get_mut(&id) {
            registration.checked_in = true;
            registration.seats = seats.to_vec();
            registration.check_in_timestamp = Some(at);
        }
        Ok(())
    }

    async fn set_cursor(&mut self, next: u64) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.cursor_write = Some(next);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;

        tokio::task::yield_now().await;

        let mut state = self.state.write().await;

        // 1. Проверяем, что всё прочитанное не менялось
        for (id, (version, _)) in &self.snapshots {
            match state.registrations.get(id) {
                Some(current) if current.version == *version => {}
                _ => return Err(StoreError::Conflict),
            }
        }
        if let Some(version) = self.cursor_read {
            if state.cursor.version != version {
                return Err(StoreError::Conflict);
            }
        }

        // 2. Применяем изменения атомарно
        for (id, (_, registration)) in self.snapshots.drain() {
            if let Some(current) = state.registrations.get_mut(&id) {
                if current.value != registration {
                    current.value = registration;
                    current.version += 1;
                }
            }
        }
        if let Some(next) = self.cursor_write {
            state.cursor.value = next;
            state.cursor.version += 1;
        }

        Ok(())
    }
}
