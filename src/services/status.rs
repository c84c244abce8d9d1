//! Отчёт о выданных местах.
//!
//! `allocated_count` - это сырое значение курсора, а не пересчёт по
//! регистрациям: расхождение между ними и есть сигнал об ошибке.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::models::SeatId;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatStatus {
    /// Места всех отмеченных регистраций, дубликаты не схлопываются.
    pub allocated_seats: Vec<SeatId>,
    pub allocated_count: u64,
}

impl SeatStatus {
    /// Места, встречающиеся больше одного раза.
    pub fn duplicate_seats(&self) -> Vec<SeatId> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut duplicates = Vec::new();
        for seat in &self.allocated_seats {
            if !seen.insert(seat) && reported.insert(seat) {
                duplicates.push(seat.clone());
            }
        }
        duplicates
    }

    /// Курсор совпадает с числом выданных мест и дубликатов нет.
    pub fn is_consistent(&self) -> bool {
        self.allocated_count == self.allocated_seats.len() as u64
            && self.duplicate_seats().is_empty()
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn Store>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn status(&self) -> Result<SeatStatus, StoreError> {
        let snapshot = self.store.allocation_snapshot().await?;

        let allocated_seats = snapshot
            .registrations
            .into_iter()
            .flat_map(|r| r.seats)
            .collect();

        Ok(SeatStatus { allocated_seats, allocated_count: snapshot.cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Registration;
    use crate::services::allocator::{AllocationPolicy, SeatAllocator};
    use crate::services::seat_map::{build_seat_map, VenueGeometry};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use futures::future::join_all;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn empty_store_reports_nothing() {
        let reporter = StatusReporter::new(Arc::new(MemoryStore::new()));
        let status = reporter.status().await.unwrap();
        assert!(status.allocated_seats.is_empty());
        assert_eq!(status.allocated_count, 0);
        assert!(status.is_consistent());
    }

    #[tokio::test]
    async fn count_matches_after_check_ins() {
        let store = MemoryStore::new();
        let geometry = VenueGeometry::new().with_section("A", [(3, 1, 30)]);
        let seat_map = Arc::new(build_seat_map(&geometry, &BTreeSet::new()));
        let allocator = SeatAllocator::new(Arc::new(store.clone()), seat_map, AllocationPolicy::default());

        const K: usize = 5;
        for i in 0..K {
            let registration = Registration::new(format!("R-{i}"), "Guest");
            let id = registration.id;
            store.insert_registration(registration).await.unwrap();
            allocator.check_in(id).await.unwrap();
        }
        // Не отмеченная регистрация в отчёт не попадает
        store.insert_registration(Registration::new("R-late", "Late")).await.unwrap();

        let status = StatusReporter::new(Arc::new(store)).status().await.unwrap();
        assert_eq!(status.allocated_count, 2 * K as u64);
        assert_eq!(status.allocated_seats.len(), 2 * K);
        assert!(status.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_during_concurrent_check_ins_is_never_torn() {
        const N: usize = 200;
        let store = MemoryStore::new();
        let geometry = VenueGeometry::new().with_section("A", [(3, 1, 2 * N as u32)]);
        let seat_map = Arc::new(build_seat_map(&geometry, &BTreeSet::new()));
        let policy = AllocationPolicy {
            max_attempts: N as u32,
            backoff: Duration::from_millis(1),
            ..AllocationPolicy::default()
        };
        let allocator = SeatAllocator::new(Arc::new(store.clone()), seat_map, policy);

        let mut ids = Vec::new();
        for i in 0..N {
            let registration = Registration::new(format!("R-{i}"), "Guest");
            ids.push(registration.id);
            store.insert_registration(registration).await.unwrap();
        }

        let reporter = StatusReporter::new(Arc::new(store.clone()));
        let done = Arc::new(AtomicBool::new(false));
        let poller = {
            let done = done.clone();
            tokio::spawn(async move {
                let mut polls = 0usize;
                let mut torn = Vec::new();
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let status = reporter.status().await.unwrap();
                    if !status.is_consistent() {
                        torn.push((status.allocated_count, status.allocated_seats.len()));
                    }
                    polls += 1;
                    if finished {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                (polls, torn)
            })
        };

        let check_ins = ids.into_iter().map(|id| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.check_in(id).await })
        });
        for result in join_all(check_ins).await {
            result.unwrap().unwrap();
        }
        done.store(true, Ordering::SeqCst);

        let (polls, torn) = poller.await.unwrap();
        assert!(polls > 0);
        assert!(torn.is_empty(), "inconsistent snapshots (cursor, seats): {torn:?}");
    }

    #[tokio::test]
    async fn duplicates_are_detected_not_merged() {
        let store = MemoryStore::new();
        for code in ["R-1", "R-2"] {
            let mut registration = Registration::new(code, "Guest");
            registration.checked_in = true;
            registration.seats = vec![SeatId::new("A", 1), SeatId::new("A", 2)];
            registration.check_in_timestamp = Some(Utc::now());
            store.insert_registration(registration).await.unwrap();
        }
        store.set_cursor(4).await;

        let status = StatusReporter::new(Arc::new(store)).status().await.unwrap();
        assert_eq!(status.allocated_seats.len(), 4);
        assert_eq!(status.duplicate_seats(), vec![SeatId::new("A", 1), SeatId::new("A", 2)]);
        assert!(!status.is_consistent());
    }

    #[test]
    fn cursor_mismatch_is_inconsistent() {
        let status = SeatStatus {
            allocated_seats: vec![SeatId::new("A", 1), SeatId::new("A", 2)],
            allocated_count: 4,
        };
        assert!(status.duplicate_seats().is_empty());
        assert!(!status.is_consistent());
    }
}
