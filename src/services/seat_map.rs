//! seat_map.rs
//!
//! Построение упорядоченного списка мест зала (seat map).
//!
//! Список строится один раз при старте и дальше не меняется: курсор
//! `next_seat_index` в хранилище - это индекс в этом списке. Поэтому
//! порядок обязан быть детерминированным: ряд по возрастанию, внутри ряда
//! секции в объявленном порядке, внутри секции номера по возрастанию.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::models::SeatId;

/// Диапазон номеров мест в ряду, включительно.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatRange {
    pub start: u32,
    pub end: u32,
}

impl SeatRange {
    pub fn contains(&self, number: u32) -> bool {
        self.start <= number && number <= self.end
    }

    pub fn overlaps(&self, other: &SeatRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    label: String,
    rows: BTreeMap<u32, SeatRange>,
}

impl Section {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rows(&self) -> &BTreeMap<u32, SeatRange> {
        &self.rows
    }
}

/// Геометрия зала: секции в фиксированном порядке, у каждой - ряды с диапазонами.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VenueGeometry {
    sections: Vec<Section>,
}

impl VenueGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет секцию в конец порядка обхода. Ряды задаются как `(row, start, end)`;
    /// при повторе ряда остаётся первый.
    pub fn with_section<I>(mut self, label: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32, u32)>,
    {
        let mut map = BTreeMap::new();
        for (row, start, end) in rows {
            map.entry(row).or_insert(SeatRange { start, end });
        }
        self.sections.push(Section { label: label.into(), rows: map });
        self
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.rows.is_empty())
    }

    /// Есть ли такое место в геометрии (без учёта брони).
    pub fn contains(&self, seat: &SeatId) -> bool {
        self.sections
            .iter()
            .filter(|s| s.label == seat.section())
            .flat_map(|s| s.rows.values())
            .any(|range| range.contains(seat.number()))
    }
}

/// Неизменяемый упорядоченный список мест, доступных для выдачи.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatMap {
    seats: Vec<SeatId>,
}

impl SeatMap {
    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SeatId> {
        self.seats.get(index)
    }

    pub fn seats(&self) -> &[SeatId] {
        &self.seats
    }

    /// `count` мест начиная с `start`, если все они есть в списке.
    pub fn slice(&self, start: usize, count: usize) -> Option<&[SeatId]> {
        let end = start.checked_add(count)?;
        self.seats.get(start..end)
    }

    /// SHA-256 от списка мест в порядке выдачи.
    ///
    /// Хранится рядом с курсором, чтобы после рестарта с другой конфигурацией
    /// зала курсор не начал указывать в чужой список.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for seat in &self.seats {
            hasher.update(seat.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Строит seat map по геометрии зала, исключая забронированные места.
///
/// Дубликаты (пересекающиеся диапазоны внутри секции) отбрасываются,
/// остаётся первое вхождение. Пустая геометрия даёт пустой список.
pub fn build_seat_map(geometry: &VenueGeometry, reserved: &BTreeSet<SeatId>) -> SeatMap {
    let rows: BTreeSet<u32> = geometry
        .sections
        .iter()
        .flat_map(|s| s.rows.keys().copied())
        .collect();

    let mut seen = HashSet::new();
    let mut seats = Vec::new();

    for row in rows {
        for section in &geometry.sections {
            let Some(range) = section.rows.get(&row) else {
                continue;
            };
            for number in range.start..=range.end {
                let seat = SeatId::new(section.label.as_str(), number);
                if reserved.contains(&seat) || seen.contains(&seat) {
                    continue;
                }
                seen.insert(seat.clone());
                seats.push(seat);
            }
        }
    }

    SeatMap { seats }
}
