use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SeatId;

/// Запись регистрации участника.
///
/// Создаётся снаружи (импорт/seed), меняется ровно один раз при check-in:
/// `checked_in` переходит false -> true вместе с назначенными местами.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: Uuid,
    pub registration_code: String,
    pub sname: String,
    pub checked_in: bool,
    pub seats: Vec<SeatId>,
    pub check_in_timestamp: Option<DateTime<Utc>>,
}

impl Registration {
    pub fn new(registration_code: impl Into<String>, sname: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registration_code: registration_code.into(),
            sname: sname.into(),
            checked_in: false,
            seats: Vec::new(),
            check_in_timestamp: None,
        }
    }

    // Первое и второе место в старом формате seat1/seat2
    pub fn seat(&self, position: usize) -> Option<&SeatId> {
        self.seats.get(position)
    }
}

/// Регистрация для импорта (файл seed).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistration {
    pub registration_code: String,
    pub sname: String,
}

impl From<NewRegistration> for Registration {
    fn from(new: NewRegistration) -> Self {
        Registration::new(new.registration_code, new.sname)
    }
}
