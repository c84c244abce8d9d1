//! Импорт регистраций из JSON-файла при старте.
//!
//! Формат: `[{"registrationCode": "...", "sname": "..."}, ...]`.
//! Повторный импорт безопасен - существующие коды пропускаются.

use anyhow::Context;
use tracing::info;

use crate::models::{NewRegistration, Registration};
use crate::store::Store;

pub fn parse_registrations(json: &str) -> anyhow::Result<Vec<NewRegistration>> {
    let list: Vec<NewRegistration> =
        serde_json::from_str(json).context("seed file must be a JSON array of registrations")?;

    if let Some(bad) = list.iter().find(|r| r.registration_code.trim().is_empty()) {
        anyhow::bail!("seed entry for '{}' has an empty registrationCode", bad.sname);
    }
    Ok(list)
}

/// Добавляет регистрации в хранилище, возвращает число новых.
pub async fn seed_registrations(store: &dyn Store, list: Vec<NewRegistration>) -> anyhow::Result<usize> {
    let total = list.len();
    let mut inserted = 0;
    for new in list {
        if store.insert_registration(Registration::from(new)).await? {
            inserted += 1;
        }
    }
    info!("Seeded {} of {} registrations ({} already present)", inserted, total, total - inserted);
    Ok(inserted)
}

pub async fn seed_from_file(store: &dyn Store, path: &str) -> anyhow::Result<usize> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path))?;
    seed_registrations(store, parse_registrations(&json)?).await
}
