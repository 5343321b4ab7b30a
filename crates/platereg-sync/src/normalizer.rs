//! Raw row to canonical record
//!
//! The registry mixes Cyrillic and Latin letters that look identical on a
//! plate. Mapping the look-alikes to Latin makes "АВ1234СЕ" and "AB1234CE"
//! the same key.

use crate::models::{RawRow, VehicleRecord};

/// Cyrillic capitals that share a glyph with a Latin capital.
const LOOKALIKES: [(char, char); 12] = [
    ('А', 'A'),
    ('В', 'B'),
    ('Е', 'E'),
    ('К', 'K'),
    ('М', 'M'),
    ('Н', 'H'),
    ('О', 'O'),
    ('Р', 'P'),
    ('С', 'C'),
    ('Т', 'T'),
    ('Х', 'X'),
    ('І', 'I'),
];

/// Trim, uppercase, and replace Cyrillic look-alikes with Latin letters.
pub fn normalize_plate(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .map(|c| {
            LOOKALIKES
                .iter()
                .find(|(cyrillic, _)| *cyrillic == c)
                .map_or(c, |(_, latin)| *latin)
        })
        .collect()
}

/// Digits only and fits in `u16`, otherwise 0 (unknown).
pub fn parse_year(raw: &str) -> u16 {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    trimmed.parse().unwrap_or(0)
}

/// Build the canonical record. Never fails; validation happens afterwards.
pub fn normalize(row: RawRow) -> VehicleRecord {
    VehicleRecord {
        plate: normalize_plate(&row.plate),
        vin: row.vin.trim().to_string(),
        make: row.make.trim().to_string(),
        model: row.model.trim().to_string(),
        year: parse_year(&row.year),
        engine_capacity: row.engine_capacity.trim().to_string(),
    }
}
