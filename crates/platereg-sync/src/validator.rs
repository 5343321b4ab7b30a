//! Plate format validation

use regex::Regex;

use crate::error::{Result, SyncError};
use crate::models::{RowRejection, VehicleRecord};

/// Two letters, four ASCII digits, two letters. Letters may be Latin or
/// Ukrainian Cyrillic capitals.
pub const PLATE_PATTERN: &str = r"^[A-ZА-ЯІЄЇҐ]{2}[0-9]{4}[A-ZА-ЯІЄЇҐ]{2}$";

/// Checks normalized records. Only the plate is inspected.
#[derive(Debug, Clone)]
pub struct RecordValidator {
    plate: Regex,
}

impl RecordValidator {
    pub fn new() -> Result<Self> {
        let plate = Regex::new(PLATE_PATTERN)
            .map_err(|e| SyncError::Config(format!("Invalid plate pattern: {}", e)))?;
        Ok(Self { plate })
    }

    pub fn validate(&self, record: &VehicleRecord) -> std::result::Result<(), RowRejection> {
        if record.plate.is_empty() {
            Err(RowRejection::EmptyPlate)
        } else if !self.plate.is_match(&record.plate) {
            Err(RowRejection::InvalidFormat)
        } else {
            Ok(())
        }
    }
}
