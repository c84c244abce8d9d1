use std::time::Duration;
use tracing::{error, info, warn};

use crate::services::status::{SeatStatus, StatusReporter};
use crate::store::StoreError;

/// Периодическая сверка: курсор против мест, реально прикреплённых к регистрациям.
pub struct AuditService {
    reporter: StatusReporter,
    interval: Duration,
}

impl AuditService {
    pub fn new(reporter: StatusReporter, interval: Duration) -> Self {
        Self { reporter, interval }
    }

    /// Один проход сверки. Возвращает снимок статуса, расхождения только логирует.
    pub async fn run_once(&self) -> Result<SeatStatus, StoreError> {
        let status = self.reporter.status().await?;

        if status.is_consistent() {
            info!(
                "🪑 Seat audit OK: {} seats allocated",
                status.allocated_count
            );
        } else {
            let duplicates: Vec<String> = status
                .duplicate_seats()
                .iter()
                .map(|s| s.to_string())
                .collect();
            warn!(
                "🪑 Seat audit mismatch: cursor {} vs {} attached seats, duplicates: [{}]",
                status.allocated_count,
                status.allocated_seats.len(),
                duplicates.join(", ")
            );
        }

        Ok(status)
    }

    /// Бесконечный цикл сверки; ошибки хранилища не останавливают цикл.
    pub async fn run_forever(self) {
        loop {
            if let Err(e) = self.run_once().await {
                error!("Seat audit failed: {}", e);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
