//! allocator.rs
//!
//! Выдача мест при check-in.
//!
//! Одна попытка - одна транзакция хранилища:
//! 1. Читаем регистрацию (нет - `NotFound`, уже отмечена - `AlreadyCheckedIn`).
//! 2. Читаем курсор `i` и проверяем, что в seat map есть `i .. i + n` мест.
//! 3. Прикрепляем места к регистрации и двигаем курсор на `i + n`.
//! 4. Commit.
//!
//! Если commit вернул `Conflict`, вся попытка повторяется с экспоненциальной
//! паузой, но не больше `max_attempts` раз. Частичных изменений не бывает:
//! либо коммитится всё, либо ничего.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::SeatId;
use crate::services::seat_map::SeatMap;
use crate::store::{Store, StoreError};

const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Параметры выдачи мест.
#[derive(Debug, Clone, Copy)]
pub struct AllocationPolicy {
    pub seats_per_registration: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            seats_per_registration: 2,
            max_attempts: 5,
            backoff: Duration::from_millis(20),
        }
    }
}

impl AllocationPolicy {
    // Пауза перед попыткой `attempt` (с 1): base, 2*base, 4*base ... не больше MAX_BACKOFF
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Результат успешного check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub registration_id: Uuid,
    pub seats: Vec<SeatId>,
    /// Курсор после выдачи.
    pub next_seat_index: u64,
    pub checked_in_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckInError {
    #[error("registration {0} not found")]
    NotFound(Uuid),
    #[error("Code already used for {name}. Seats: {}", format_seats(.seats))]
    AlreadyCheckedIn { name: String, seats: Vec<SeatId> },
    #[error("Auditorium is full.")]
    Exhausted { cursor: u64, capacity: usize },
    #[error("check-in is contended, gave up after {attempts} attempts; please retry")]
    Contention { attempts: u32 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn format_seats(seats: &[SeatId]) -> String {
    seats
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(
        "seat map changed (stored fingerprint {stored}, current {current}) while {cursor} seats are already allocated"
    )]
    SeatMapChanged { stored: String, current: String, cursor: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct SeatAllocator {
    store: Arc<dyn Store>,
    seat_map: Arc<SeatMap>,
    policy: AllocationPolicy,
}

impl SeatAllocator {
    pub fn new(store: Arc<dyn Store>, seat_map: Arc<SeatMap>, policy: AllocationPolicy) -> Self {
        Self { store, seat_map, policy }
    }

    /// Проверяет, что курсор в хранилище относится к текущему seat map.
    ///
    /// Отпечатка нет - сохраняем. Отпечаток другой, но ничего не выдано -
    /// перезаписываем. Другой и курсор > 0 - ошибка старта.
    pub async fn bind_seat_map(&self) -> Result<(), BindError> {
        let current = self.seat_map.fingerprint();
        match self.store.seat_map_fingerprint().await? {
            Some(stored) if stored == current => Ok(()),
            Some(stored) => {
                let cursor = self.store.cursor().await?;
                if cursor > 0 {
                    return Err(BindError::SeatMapChanged { stored, current, cursor });
                }
                warn!(
                    "Seat map fingerprint changed from {} to {}, nothing allocated yet - rebinding",
                    stored, current
                );
                self.store.set_seat_map_fingerprint(&current).await?;
                Ok(())
            }
            None => {
                info!("Binding allocation cursor to seat map {}", current);
                self.store.set_seat_map_fingerprint(&current).await?;
                Ok(())
            }
        }
    }

    /// Check-in регистрации: атомарно выдаёт следующие `seats_per_registration` мест.
    pub async fn check_in(&self, registration_id: Uuid) -> Result<Allocation, CheckInError> {
        let mut attempt = 1;
        loop {
            match self.try_check_in(registration_id).await {
                Err(CheckInError::Store(e)) if e.is_conflict() => {
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            "Check-in for {} gave up after {} conflicting attempts",
                            registration_id, attempt
                        );
                        return Err(CheckInError::Contention { attempts: attempt });
                    }
                    let pause = self.policy.backoff_for(attempt);
                    debug!(
                        "Check-in for {} conflicted (attempt {}), retrying in {:?}",
                        registration_id, attempt, pause
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_check_in(&self, registration_id: Uuid) -> Result<Allocation, CheckInError> {
        let n = self.policy.seats_per_registration;
        let mut tx = self.store.begin().await?;

        let registration = tx
            .registration(registration_id)
            .await?
            .ok_or(CheckInError::NotFound(registration_id))?;

        if registration.checked_in {
            return Err(CheckInError::AlreadyCheckedIn {
                name: registration.sname,
                seats: registration.seats,
            });
        }

        let cursor = tx.cursor().await?;
        let capacity = self.seat_map.len();
        let exhausted = || CheckInError::Exhausted { cursor, capacity };

        // Нужно n мест подряд: i + n > S - значит зал заполнен
        let start = usize::try_from(cursor).map_err(|_| exhausted())?;
        let seats = self.seat_map.slice(start, n).ok_or_else(exhausted)?.to_vec();

        let next = cursor + n as u64;
        let now = Utc::now();
        tx.assign_seats(registration_id, &seats, now).await?;
        tx.set_cursor(next).await?;
        tx.commit().await?;

        info!(
            "Checked in {} ({}): seats {}, cursor {} -> {}",
            registration_id,
            registration.registration_code,
            format_seats(&seats),
            cursor,
            next
        );

        Ok(Allocation {
            registration_id,
            seats,
            next_seat_index: next,
            checked_in_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Registration;
    use crate::services::seat_map::{build_seat_map, VenueGeometry};
    use crate::store::{AllocationSnapshot, MemoryStore, StoreTx};
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashSet};

    fn seat_map(rows: &[(u32, u32, u32)]) -> Arc<SeatMap> {
        let geometry = VenueGeometry::new().with_section("A", rows.iter().copied());
        Arc::new(build_seat_map(&geometry, &BTreeSet::new()))
    }

    fn allocator(store: &MemoryStore, map: Arc<SeatMap>) -> SeatAllocator {
        SeatAllocator::new(Arc::new(store.clone()), map, AllocationPolicy::default())
    }

    async fn register(store: &MemoryStore, code: &str) -> Uuid {
        let registration = Registration::new(code, format!("Attendee {}", code));
        let id = registration.id;
        store.insert_registration(registration).await.unwrap();
        id
    }

    fn names(seats: &[SeatId]) -> Vec<String> {
        seats.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn three_seat_venue_fits_one_pair() {
        let store = MemoryStore::new();
        let allocator = allocator(&store, seat_map(&[(3, 31, 33)]));
        let first = register(&store, "R-1").await;
        let second = register(&store, "R-2").await;

        let allocation = allocator.check_in(first).await.unwrap();
        assert_eq!(names(&allocation.seats), vec!["A-31", "A-32"]);
        assert_eq!(allocation.next_seat_index, 2);
        assert_eq!(store.cursor().await.unwrap(), 2);

        let err = allocator.check_in(second).await.unwrap_err();
        assert!(matches!(err, CheckInError::Exhausted { cursor: 2, capacity: 3 }));
        assert_eq!(store.cursor().await.unwrap(), 2);
        assert!(!store.get_registration(second).await.unwrap().unwrap().checked_in);
    }

    #[tokio::test]
    async fn last_single_seat_is_never_handed_out() {
        let store = MemoryStore::new();
        let allocator = allocator(&store, seat_map(&[(3, 1, 10)]));
        let id = register(&store, "R-1").await;

        store.set_cursor(9).await;
        assert!(matches!(
            allocator.check_in(id).await,
            Err(CheckInError::Exhausted { cursor: 9, capacity: 10 })
        ));

        store.set_cursor(8).await;
        let allocation = allocator.check_in(id).await.unwrap();
        assert_eq!(names(&allocation.seats), vec!["A-9", "A-10"]);
        assert_eq!(store.cursor().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn second_check_in_is_rejected_and_changes_nothing() {
        let store = MemoryStore::new();
        let allocator = allocator(&store, seat_map(&[(3, 1, 10)]));
        let id = register(&store, "R-1").await;

        let first = allocator.check_in(id).await.unwrap();
        let err = allocator.check_in(id).await.unwrap_err();
        match err {
            CheckInError::AlreadyCheckedIn { ref name, ref seats } => {
                assert_eq!(name, "Attendee R-1");
                assert_eq!(seats, &first.seats);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Code already used for Attendee R-1. Seats: A-1, A-2");
        assert_eq!(store.cursor().await.unwrap(), 2);

        let stored = store.get_registration(id).await.unwrap().unwrap();
        assert_eq!(stored.seats, first.seats);
        assert_eq!(stored.check_in_timestamp, Some(first.checked_in_at));
    }

    #[tokio::test]
    async fn unknown_registration_is_not_found() {
        let store = MemoryStore::new();
        let allocator = allocator(&store, seat_map(&[(3, 1, 10)]));
        let missing = Uuid::new_v4();
        assert!(matches!(
            allocator.check_in(missing).await,
            Err(CheckInError::NotFound(id)) if id == missing
        ));
        assert_eq!(store.cursor().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cursor_advances_by_group_size() {
        let store = MemoryStore::new();
        let policy = AllocationPolicy { seats_per_registration: 3, ..AllocationPolicy::default() };
        let allocator = SeatAllocator::new(Arc::new(store.clone()), seat_map(&[(3, 1, 7)]), policy);

        let a = register(&store, "R-1").await;
        let b = register(&store, "R-2").await;
        let c = register(&store, "R-3").await;

        assert_eq!(names(&allocator.check_in(a).await.unwrap().seats), vec!["A-1", "A-2", "A-3"]);
        assert_eq!(names(&allocator.check_in(b).await.unwrap().seats), vec!["A-4", "A-5", "A-6"]);
        assert!(matches!(allocator.check_in(c).await, Err(CheckInError::Exhausted { cursor: 6, .. })));
        assert_eq!(store.cursor().await.unwrap(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_check_ins_never_overlap() {
        const N: usize = 40;
        let store = MemoryStore::new();
        let policy = AllocationPolicy {
            max_attempts: N as u32,
            backoff: Duration::from_millis(1),
            ..AllocationPolicy::default()
        };
        let allocator = SeatAllocator::new(Arc::new(store.clone()), seat_map(&[(3, 1, 200)]), policy);

        let mut ids = Vec::new();
        for i in 0..N {
            ids.push(register(&store, &format!("R-{i}")).await);
        }

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.check_in(id).await })
            })
            .collect();

        let mut seats = HashSet::new();
        for handle in handles {
            let allocation = handle.await.unwrap().unwrap();
            assert_eq!(allocation.seats.len(), 2);
            // Пара всегда соседняя: A-(2k+1), A-(2k+2)
            assert_eq!(allocation.seats[0].number() % 2, 1);
            assert_eq!(allocation.seats[1].number(), allocation.seats[0].number() + 1);
            for seat in allocation.seats {
                assert!(seats.insert(seat), "seat handed out twice");
            }
        }
        assert_eq!(seats.len(), 2 * N);
        assert_eq!(store.cursor().await.unwrap(), 2 * N as u64);
    }

    #[tokio::test]
    async fn concurrent_check_ins_of_same_registration_allocate_once() {
        let store = MemoryStore::new();
        let allocator = allocator(&store, seat_map(&[(3, 1, 20)]));
        let id = register(&store, "R-1").await;

        let (a, b) = tokio::join!(allocator.check_in(id), allocator.check_in(id));
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CheckInError::AlreadyCheckedIn { .. }))));
        assert_eq!(store.cursor().await.unwrap(), 2);
    }

    /// Хранилище, у которого commit всегда конфликтует.
    struct AlwaysConflicting {
        inner: MemoryStore,
        commits: Arc<std::sync::atomic::AtomicU32>,
    }

    struct ConflictingTx {
        inner: Box<dyn StoreTx>,
        commits: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl StoreTx for ConflictingTx {
        async fn registration(&mut self, id: Uuid) -> Result<Option<Registration>, StoreError> {
            self.inner.registration(id).await
        }
        async fn cursor(&mut self) -> Result<u64, StoreError> {
            self.inner.cursor().await
        }
        async fn assign_seats(&mut self, id: Uuid, seats: &[SeatId], at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.assign_seats(id, seats, at).await
        }
        async fn set_cursor(&mut self, next: u64) -> Result<(), StoreError> {
            self.inner.set_cursor(next).await
        }
        async fn commit(&mut self) -> Result<(), StoreError> {
            self.commits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(StoreError::Conflict)
        }
    }

    #[async_trait]
    impl Store for AlwaysConflicting {
        async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
            Ok(Box::new(ConflictingTx { inner: self.inner.begin().await?, commits: self.commits.clone() }))
        }
        async fn find_by_code(&self, code: &str) -> Result<Option<Registration>, StoreError> {
            self.inner.find_by_code(code).await
        }
        async fn get_registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
            self.inner.get_registration(id).await
        }
        async fn allocation_snapshot(&self) -> Result<AllocationSnapshot, StoreError> {
            self.inner.allocation_snapshot().await
        }
        async fn cursor(&self) -> Result<u64, StoreError> {
            self.inner.cursor().await
        }
        async fn insert_registration(&self, registration: Registration) -> Result<bool, StoreError> {
            self.inner.insert_registration(registration).await
        }
        async fn seat_map_fingerprint(&self) -> Result<Option<String>, StoreError> {
            self.inner.seat_map_fingerprint().await
        }
        async fn set_seat_map_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
            self.inner.set_seat_map_fingerprint(fingerprint).await
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let inner = MemoryStore::new();
        let id = register(&inner, "R-1").await;
        let commits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let store = AlwaysConflicting { inner: inner.clone(), commits: commits.clone() };
        let policy = AllocationPolicy { max_attempts: 3, backoff: Duration::from_millis(1), ..AllocationPolicy::default() };
        let allocator = SeatAllocator::new(Arc::new(store), seat_map(&[(3, 1, 10)]), policy);

        assert!(matches!(
            allocator.check_in(id).await,
            Err(CheckInError::Contention { attempts: 3 })
        ));
        assert_eq!(commits.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(inner.cursor().await.unwrap(), 0);
        assert!(!inner.get_registration(id).await.unwrap().unwrap().checked_in);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = AllocationPolicy { backoff: Duration::from_millis(20), ..AllocationPolicy::default() };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(80));
        assert_eq!(policy.backoff_for(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn bind_seat_map_rules() {
        let store = MemoryStore::new();
        let small_map = seat_map(&[(3, 1, 10)]);
        let large_map = seat_map(&[(3, 1, 20)]);
        let small = allocator(&store, small_map.clone());
        let large = allocator(&store, large_map.clone());

        small.bind_seat_map().await.unwrap();
        assert_eq!(store.seat_map_fingerprint().await.unwrap(), Some(small_map.fingerprint()));
        small.bind_seat_map().await.unwrap();

        // Ничего не выдано - можно перепривязать
        large.bind_seat_map().await.unwrap();
        assert_eq!(store.seat_map_fingerprint().await.unwrap(), Some(large_map.fingerprint()));

        store.set_cursor(2).await;
        assert!(matches!(
            small.bind_seat_map().await,
            Err(BindError::SeatMapChanged { cursor: 2, .. })
        ));
    }
}
