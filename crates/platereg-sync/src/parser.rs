//! Registry CSV decoding
//!
//! The data file is UTF-8, `;`-separated, with a header row. Columns are
//! located by header name, so the publisher may add or reorder columns
//! without breaking the import.
//!
//! Rows are produced on a blocking thread and handed to the async side over a
//! bounded channel, so decoding and persisting overlap.

use csv::{ByteRecord, ReaderBuilder};
use std::io::Read;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ColumnMapping;
use crate::error::{Result, SyncError};
use crate::models::RawRow;

/// A data row that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMalformed {
    pub line: u64,
    pub reason: String,
}

/// One item of the row stream
pub type ParsedRow = std::result::Result<RawRow, RowMalformed>;

/// Header-mapped reader over a registry data file
pub struct RegistryCsvReader<R: Read> {
    reader: csv::Reader<R>,
    file: String,
    /// Field positions in `ColumnMapping::names()` order
    indices: [usize; 6],
    record: ByteRecord,
    rows_read: u64,
    parse_limit: Option<usize>,
}

impl<R: Read> RegistryCsvReader<R> {
    /// Read the header and resolve the mapped columns.
    ///
    /// Fails with `MissingColumns` if any mapped header is absent.
    pub fn new(source: R, file: impl Into<String>, columns: &ColumnMapping) -> Result<Self> {
        let file = file.into();
        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .quote(b'"')
            .has_headers(true)
            .flexible(false)
            .from_reader(source);

        let headers: Vec<String> = reader
            .byte_headers()
            .map_err(|e| SyncError::ArchiveCorrupt(format!("Failed to read header of {}: {}", file, e)))?
            .iter()
            .map(|h| {
                String::from_utf8_lossy(h)
                    .trim_start_matches('\u{feff}')
                    .trim()
                    .to_string()
            })
            .collect();
        debug!(file = %file, ?headers, "Read data file header");

        let mut indices = [0usize; 6];
        let mut missing = Vec::new();
        for (slot, name) in indices.iter_mut().zip(columns.names()) {
            match headers.iter().position(|h| h == name) {
                Some(index) => *slot = index,
                None => missing.push(name.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(SyncError::MissingColumns { file, missing });
        }

        Ok(Self {
            reader,
            file,
            indices,
            record: ByteRecord::new(),
            rows_read: 0,
            parse_limit: None,
        })
    }

    /// Stop after `limit` data rows
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.parse_limit = limit;
        self
    }

    /// Next data row, `Ok(None)` at end of file.
    ///
    /// Undecodable rows come back as `Some(Err(..))`; only I/O failures of the
    /// underlying stream are returned as errors.
    pub fn next_row(&mut self) -> Result<Option<ParsedRow>> {
        if let Some(limit) = self.parse_limit {
            if self.rows_read >= limit as u64 {
                return Ok(None);
            }
        }

        match self.reader.read_byte_record(&mut self.record) {
            Ok(false) => Ok(None),
            Ok(true) => {
                self.rows_read += 1;
                let line = self.record.position().map_or(0, |p| p.line());
                Ok(Some(self.decode(line)))
            },
            Err(e) => {
                let line = e.position().map_or(0, |p| p.line());
                if let csv::ErrorKind::Io(io) = e.kind() {
                    return Err(SyncError::ArchiveCorrupt(format!(
                        "Failed to read {} near line {}: {}",
                        self.file, line, io
                    )));
                }
                self.rows_read += 1;
                Ok(Some(Err(RowMalformed {
                    line,
                    reason: e.to_string(),
                })))
            },
        }
    }

    fn decode(&self, line: u64) -> ParsedRow {
        let field = |slot: usize| -> std::result::Result<String, RowMalformed> {
            let bytes = self.record.get(self.indices[slot]).unwrap_or_default();
            std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| RowMalformed {
                    line,
                    reason: format!("invalid UTF-8 in column {}: {}", slot, e),
                })
        };

        Ok(RawRow {
            line,
            plate: field(0)?,
            vin: field(1)?,
            make: field(2)?,
            model: field(3)?,
            year: field(4)?,
            engine_capacity: field(5)?,
        })
    }

    /// Push every row into `tx`. Blocking; run it under `spawn_blocking`.
    ///
    /// Returns the number of data rows read. Stops early without error if the
    /// receiver has been dropped.
    pub fn stream_into(mut self, tx: mpsc::Sender<ParsedRow>) -> Result<u64> {
        while let Some(row) = self.next_row()? {
            if let Err(malformed) = &row {
                debug!(
                    file = %self.file,
                    line = malformed.line,
                    reason = %malformed.reason,
                    "Skipping malformed row"
                );
            }
            if tx.blocking_send(row).is_err() {
                debug!(rows_read = self.rows_read, "Row receiver closed, stopping reader");
                break;
            }
        }

        if let Some(limit) = self.parse_limit {
            if self.rows_read >= limit as u64 {
                debug!("Reached parse limit of {} rows", limit);
            }
        }

        Ok(self.rows_read)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const HEADER: &str = "PERSON;REG_ADDR_KOATUU;OPER_CODE;D_REG;BRAND;MODEL;VIN;MAKE_YEAR;COLOR;KIND;CAPACITY;N_REG_NEW\n";

    fn reader(body: &str) -> RegistryCsvReader<&[u8]> {
        RegistryCsvReader::new(body.as_bytes(), "reestr.csv", &ColumnMapping::default()).unwrap()
    }

    fn collect(mut reader: RegistryCsvReader<&[u8]>) -> Vec<ParsedRow> {
        let mut rows = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_maps_columns_by_name() {
        let body = format!(
            "{}P;8000000000;100;2025-01-02;TOYOTA;COROLLA;JTDBR32E720123456;2002;СІРИЙ;ЛЕГКОВИЙ;1598;АА1234ВВ\n",
            HEADER
        );
        let rows = collect(reader(&body));
        assert_eq!(rows.len(), 1);

        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.line, 2);
        assert_eq!(row.plate, "АА1234ВВ");
        assert_eq!(row.vin, "JTDBR32E720123456");
        assert_eq!(row.make, "TOYOTA");
        assert_eq!(row.model, "COROLLA");
        assert_eq!(row.year, "2002");
        assert_eq!(row.engine_capacity, "1598");
    }

    #[test]
    fn test_bom_and_padded_header() {
        let body = "\u{feff} N_REG_NEW ;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\nAA1111BB;;SKODA;FABIA;;\n";
        let rows = collect(reader(body));
        assert_eq!(rows[0].as_ref().unwrap().plate, "AA1111BB");
    }

    #[test]
    fn test_quoted_field_with_delimiter() {
        let body = "N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\nAA1111BB;;\"MERCEDES; BENZ\";\"E 200\";2010;1998\n";
        let rows = collect(reader(body));
        assert_eq!(rows[0].as_ref().unwrap().make, "MERCEDES; BENZ");
    }

    #[test]
    fn test_missing_columns() {
        let body = "N_REG_NEW;VIN;BRAND\nAA1111BB;;SKODA\n";
        let err = RegistryCsvReader::new(body.as_bytes(), "reestr.csv", &ColumnMapping::default())
            .err()
            .unwrap();
        match err {
            SyncError::MissingColumns { file, missing } => {
                assert_eq!(file, "reestr.csv");
                assert_eq!(missing, vec!["MODEL", "MAKE_YEAR", "CAPACITY"]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_file_reports_all_columns_missing() {
        let err = RegistryCsvReader::new(&b""[..], "empty.csv", &ColumnMapping::default())
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::MissingColumns { missing, .. } if missing.len() == 6));
    }

    #[test]
    fn test_malformed_rows_are_skipped_not_fatal() {
        let body = "N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\n\
                    AA1111BB;;SKODA;FABIA;2010;1200\n\
                    AA2222BB;;SKODA\n\
                    AA3333BB;;SKODA;OCTAVIA;2012;1400\n";
        let rows = collect(reader(body));
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_ok());
        let malformed = rows[1].as_ref().unwrap_err();
        assert_eq!(malformed.line, 3);
        assert_eq!(rows[2].as_ref().unwrap().plate, "AA3333BB");
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut body = b"N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\n".to_vec();
        body.extend_from_slice(b"AA1111BB;;\xff\xfe;FABIA;2010;1200\n");
        let mut reader =
            RegistryCsvReader::new(body.as_slice(), "reestr.csv", &ColumnMapping::default()).unwrap();
        let row = reader.next_row().unwrap().unwrap();
        assert!(row.unwrap_err().reason.contains("UTF-8"));
    }

    #[test]
    fn test_parse_limit() {
        let body = "N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\nA;;;;;\nB;;;;;\nC;;;;;\n";
        let rows = collect(reader(body).with_limit(Some(2)));
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_into_channel() {
        let body = "N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\nA;;;;;\nB;;;;;\nC;;;;;\n".to_string();
        let (tx, mut rx) = mpsc::channel(1);

        let producer = tokio::task::spawn_blocking(move || {
            RegistryCsvReader::new(body.as_bytes(), "reestr.csv", &ColumnMapping::default())
                .unwrap()
                .stream_into(tx)
        });

        let mut plates = Vec::new();
        while let Some(row) = rx.recv().await {
            plates.push(row.unwrap().plate);
        }

        assert_eq!(plates, vec!["A", "B", "C"]);
        assert_eq!(producer.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stream_stops_when_receiver_dropped() {
        let body = "N_REG_NEW;VIN;BRAND;MODEL;MAKE_YEAR;CAPACITY\nA;;;;;\nB;;;;;\nC;;;;;\n".to_string();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let read = tokio::task::spawn_blocking(move || {
            RegistryCsvReader::new(body.as_bytes(), "reestr.csv", &ColumnMapping::default())
                .unwrap()
                .stream_into(tx)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(read, 1);
    }
}
