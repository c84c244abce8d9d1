use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Идентификатор места в зале: секция + номер, в строковом виде `"A-31"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeatId {
    section: String,
    number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeatIdError {
    #[error("seat id '{0}' must look like '<section>-<number>'")]
    Malformed(String),
    #[error("seat id '{0}' has an empty section")]
    EmptySection(String),
    #[error("seat id '{0}' has an invalid number")]
    InvalidNumber(String),
}

impl SeatId {
    pub fn new(section: impl Into<String>, number: u32) -> Self {
        Self { section: section.into(), number }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Display for SeatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.section, self.number)
    }
}

impl FromStr for SeatId {
    type Err = SeatIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Номер всегда после последнего дефиса
        let (section, number) = s
            .rsplit_once('-')
            .ok_or_else(|| SeatIdError::Malformed(s.to_string()))?;

        if section.is_empty() {
            return Err(SeatIdError::EmptySection(s.to_string()));
        }
        if section.contains('-') {
            return Err(SeatIdError::Malformed(s.to_string()));
        }

        let number = number
            .parse::<u32>()
            .map_err(|_| SeatIdError::InvalidNumber(s.to_string()))?;

        Ok(SeatId::new(section, number))
    }
}

impl TryFrom<String> for SeatId {
    type Error = SeatIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeatId> for String {
    fn from(seat: SeatId) -> Self {
        seat.to_string()
    }
}
