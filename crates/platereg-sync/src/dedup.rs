//! In-batch plate deduplication

use std::collections::HashSet;

use crate::models::{RowRejection, VehicleRecord};

/// Tracks plates seen in the current run. The first occurrence wins.
#[derive(Debug, Default)]
pub struct BatchDeduplicator {
    seen: HashSet<String>,
}

impl BatchDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the record unless its plate was already accepted this run.
    pub fn admit(&mut self, record: &VehicleRecord) -> Result<(), RowRejection> {
        if self.seen.contains(&record.plate) {
            return Err(RowRejection::DuplicateInBatch);
        }
        self.seen.insert(record.plate.clone());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(plate: &str, model: &str) -> VehicleRecord {
        VehicleRecord {
            plate: plate.to_string(),
            vin: String::new(),
            make: "SKODA".to_string(),
            model: model.to_string(),
            year: 2010,
            engine_capacity: String::new(),
        }
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut dedup = BatchDeduplicator::new();
        assert!(dedup.admit(&record("AA1111BB", "OCTAVIA")).is_ok());
        assert_eq!(
            dedup.admit(&record("AA1111BB", "FABIA")),
            Err(RowRejection::DuplicateInBatch)
        );
        assert!(dedup.admit(&record("AA1111BC", "FABIA")).is_ok());
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_fresh_per_run() {
        let mut dedup = BatchDeduplicator::new();
        assert!(dedup.is_empty());
        dedup.admit(&record("AA1111BB", "OCTAVIA")).ok();

        let mut next_run = BatchDeduplicator::new();
        assert!(next_run.admit(&record("AA1111BB", "OCTAVIA")).is_ok());
    }
}
