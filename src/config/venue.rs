//! venue.rs
//!
//! Конфигурация зала: версия, геометрия, забронированные места и число мест
//! на одну регистрацию. Читается через `config` (по умолчанию - встроенный
//! `config/venue.toml`) и валидируется один раз до построения seat map.

use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::models::{SeatId, SeatIdError};
use crate::services::seat_map::{SeatRange, VenueGeometry};

/// Встроенная конфигурация зала.
pub const DEFAULT_VENUE: &str = include_str!("../../config/venue.toml");

fn default_seats_per_registration() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub version: String,
    #[serde(default = "default_seats_per_registration")]
    pub seats_per_registration: usize,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
    #[serde(default)]
    pub reserved: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    pub label: String,
    #[serde(default)]
    pub rows: Vec<RowConfig>,
}

/// Ряд в файле записывается как `[row, start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "[u32; 3]")]
pub struct RowConfig {
    pub row: u32,
    pub start: u32,
    pub end: u32,
}

impl From<[u32; 3]> for RowConfig {
    fn from([row, start, end]: [u32; 3]) -> Self {
        Self { row, start, end }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("failed to load venue configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("section label must not be empty")]
    EmptyLabel,
    #[error("section label '{0}' must not contain '-'")]
    InvalidLabel(String),
    #[error("section '{0}' is declared twice")]
    DuplicateSection(String),
    #[error("section '{section}' lists row {row} twice")]
    DuplicateRow { section: String, row: u32 },
    #[error("section '{section}' row {row}: start {start} is after end {end}")]
    InvertedRange { section: String, row: u32, start: u32, end: u32 },
    #[error("reserved seat is malformed: {0}")]
    MalformedReserved(#[from] SeatIdError),
    #[error("seats_per_registration must be at least 1")]
    ZeroSeatsPerRegistration,
}

/// Некритичные замечания к конфигурации: логируются, старт продолжается.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueWarning {
    /// Диапазоны двух рядов секции пересекаются; повторные места выдаются один раз.
    Overlap { section: String, first_row: u32, second_row: u32 },
    /// Забронированное место не попадает ни в один диапазон и ни на что не влияет.
    ReservedOutsideGeometry(SeatId),
}

impl fmt::Display for VenueWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueWarning::Overlap { section, first_row, second_row } => write!(
                f,
                "section {} rows {} and {} overlap, duplicate seats are allocated once",
                section, first_row, second_row
            ),
            VenueWarning::ReservedOutsideGeometry(seat) => {
                write!(f, "reserved seat {} is outside the venue geometry", seat)
            }
        }
    }
}

/// Провалидированный зал, готовый для построения seat map.
#[derive(Debug, Clone)]
pub struct Venue {
    pub version: String,
    pub seats_per_registration: usize,
    pub geometry: VenueGeometry,
    pub reserved: BTreeSet<SeatId>,
    pub warnings: Vec<VenueWarning>,
}

impl VenueConfig {
    /// Загружает конфигурацию из файла или, если путь не задан, встроенную.
    pub fn load(path: Option<&str>) -> Result<Self, VenueError> {
        let builder = config::Config::builder();
        let builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::from_str(
                DEFAULT_VENUE,
                config::FileFormat::Toml,
            )),
        };
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn from_toml(source: &str) -> Result<Self, VenueError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn validate(self) -> Result<Venue, VenueError> {
        if self.seats_per_registration == 0 {
            return Err(VenueError::ZeroSeatsPerRegistration);
        }

        let mut warnings = Vec::new();
        let mut labels = HashSet::new();
        let mut geometry = VenueGeometry::new();

        for section in &self.sections {
            let label = section.label.as_str();
            if label.is_empty() {
                return Err(VenueError::EmptyLabel);
            }
            if label.contains('-') {
                return Err(VenueError::InvalidLabel(label.to_string()));
            }
            if !labels.insert(label) {
                return Err(VenueError::DuplicateSection(label.to_string()));
            }

            let mut rows = HashSet::new();
            for r in &section.rows {
                if !rows.insert(r.row) {
                    return Err(VenueError::DuplicateRow { section: label.to_string(), row: r.row });
                }
                if r.start > r.end {
                    return Err(VenueError::InvertedRange {
                        section: label.to_string(),
                        row: r.row,
                        start: r.start,
                        end: r.end,
                    });
                }
            }

            warnings.extend(find_overlaps(label, &section.rows));
            geometry = geometry.with_section(label, section.rows.iter().map(|r| (r.row, r.start, r.end)));
        }

        let mut reserved = BTreeSet::new();
        for raw in &self.reserved {
            let seat: SeatId = raw.parse()?;
            if !geometry.contains(&seat) {
                warnings.push(VenueWarning::ReservedOutsideGeometry(seat.clone()));
            }
            reserved.insert(seat);
        }

        Ok(Venue {
            version: self.version,
            seats_per_registration: self.seats_per_registration,
            geometry,
            reserved,
            warnings,
        })
    }
}

fn find_overlaps(section: &str, rows: &[RowConfig]) -> Vec<VenueWarning> {
    let mut sorted: Vec<&RowConfig> = rows.iter().collect();
    sorted.sort_by_key(|r| (r.start, r.row));

    let mut overlaps = Vec::new();
    for (i, a) in sorted.iter().enumerate() {
        let range_a = SeatRange { start: a.start, end: a.end };
        for b in &sorted[i + 1..] {
            if b.start > a.end {
                break;
            }
            if range_a.overlaps(&SeatRange { start: b.start, end: b.end }) {
                let (first_row, second_row) = (a.row.min(b.row), a.row.max(b.row));
                overlaps.push(VenueWarning::Overlap {
                    section: section.to_string(),
                    first_row,
                    second_row,
                });
            }
        }
    }
    overlaps
}
