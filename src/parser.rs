// 🧹 Record Parser & Cleaner
// Raw CSV rows → typed transactions. Bad rows are dropped and counted, never raised.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::{ByteRecord, ReaderBuilder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ParseError, PipelineError, RowCoercionIssue};
use crate::observer::PipelineObserver;

// ============================================================================
// CORE TYPES
// ============================================================================

pub const BANK_ID_COLUMN: &str = "bank_id";
pub const AMOUNT_COLUMN: &str = "amount";
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// RawTransactionRecord - one CSV data line, nothing validated yet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTransactionRecord {
    pub line_number: usize,
    pub bank_id: Option<String>,
    pub amount: Option<String>,
    pub timestamp: Option<String>,

    // Set when one of the three columns held bytes that are not UTF-8
    pub malformed_encoding: bool,
}

impl RawTransactionRecord {
    pub fn new(line_number: usize, bank_id: &str, amount: &str, timestamp: &str) -> Self {
        RawTransactionRecord {
            line_number,
            bank_id: Some(bank_id.to_string()),
            amount: Some(amount.to_string()),
            timestamp: Some(timestamp.to_string()),
            malformed_encoding: false,
        }
    }
}

/// CleanedTransactionRecord - all three fields coerced, date derived
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedTransactionRecord {
    pub line_number: usize,
    pub bank_id: i64,
    pub amount: Decimal,
    pub timestamp: NaiveDateTime,
    pub date: NaiveDate,
}

/// Rows seen vs. retained, with drop counts by reason
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanStats {
    pub seen: usize,
    pub retained: usize,
    pub dropped: HashMap<RowCoercionIssue, usize>,
}

impl CleanStats {
    pub fn dropped_count(&self) -> usize {
        self.seen - self.retained
    }

    fn record_drop(&mut self, issue: RowCoercionIssue) {
        *self.dropped.entry(issue).or_insert(0) += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows seen, {} retained, {} dropped",
            self.seen,
            self.retained,
            self.dropped_count()
        )
    }
}

// ============================================================================
// COERCION
// ============================================================================

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Decimal amount, plain or scientific notation. Digit separators are not numeric.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let text = text.trim();
    if text.contains('_') {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Integer bank id; numeric text with a zero fractional part ("7.0") is accepted
pub fn parse_bank_id(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(id) = text.parse::<i64>() {
        return Some(id);
    }

    let value = parse_amount(text)?;
    if value.fract().is_zero() {
        value.to_i64()
    } else {
        None
    }
}

// Slash dates are month-first
const NAIVE_TIMESTAMP_FORMATS: [&str; 8] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
];

// Parsed after appending ":00", chrono needs a minute
const HOUR_ONLY_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Timestamp in RFC 3339, ISO-like or slash naive form, or a bare date (midnight).
///
/// Offset-qualified timestamps keep their own wall-clock time, so the derived
/// calendar date is the one printed in the source.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }

    let with_minutes = format!("{}:00", text);
    for format in HOUR_ONLY_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&with_minutes, format) {
            return Some(dt);
        }
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Apply the cleaning rules to one row.
///
/// Presence is checked for all three fields before any coercion is attempted.
pub fn clean_row(raw: &RawTransactionRecord) -> Result<CleanedTransactionRecord, RowCoercionIssue> {
    if raw.malformed_encoding {
        return Err(RowCoercionIssue::Encoding);
    }

    let amount = present(&raw.amount).ok_or(RowCoercionIssue::Missing(AMOUNT_COLUMN))?;
    let timestamp = present(&raw.timestamp).ok_or(RowCoercionIssue::Missing(TIMESTAMP_COLUMN))?;
    let bank_id = present(&raw.bank_id).ok_or(RowCoercionIssue::Missing(BANK_ID_COLUMN))?;

    let amount = parse_amount(amount).ok_or(RowCoercionIssue::InvalidAmount)?;
    let timestamp = parse_timestamp(timestamp).ok_or(RowCoercionIssue::InvalidTimestamp)?;
    let bank_id = parse_bank_id(bank_id).ok_or(RowCoercionIssue::InvalidBankId)?;

    Ok(CleanedTransactionRecord {
        line_number: raw.line_number,
        bank_id,
        amount,
        timestamp,
        date: timestamp.date(),
    })
}

// ============================================================================
// CSV READER
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    bank_id: usize,
    amount: usize,
    timestamp: usize,
}

impl ColumnIndex {
    fn from_headers(headers: &ByteRecord) -> Result<Self, ParseError> {
        if headers.is_empty() {
            return Err(ParseError::EmptyInput);
        }

        let find = |name: &'static str| {
            headers
                .iter()
                .position(|h| h == name.as_bytes())
                .ok_or(ParseError::MissingColumn(name))
        };

        Ok(ColumnIndex {
            bank_id: find(BANK_ID_COLUMN)?,
            amount: find(AMOUNT_COLUMN)?,
            timestamp: find(TIMESTAMP_COLUMN)?,
        })
    }
}

/// Reads raw rows out of a comma-delimited, headered UTF-8 CSV.
///
/// Extra columns are ignored and short rows are tolerated (missing trailing
/// fields read as absent). Only I/O or structural CSV failures are errors.
pub struct CsvTransactionReader<R: Read> {
    reader: csv::Reader<R>,
    columns: ColumnIndex,
    record: ByteRecord,
    rows_read: usize,
}

impl CsvTransactionReader<File> {
    pub fn from_path(path: &Path) -> Result<Self, ParseError> {
        let file = File::open(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }
}

impl<R: Read> CsvTransactionReader<R> {
    pub fn from_reader(input: R) -> Result<Self, ParseError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);

        let columns = ColumnIndex::from_headers(reader.byte_headers()?)?;

        Ok(CsvTransactionReader {
            reader,
            columns,
            record: ByteRecord::new(),
            rows_read: 0,
        })
    }

    fn field(&self, index: usize, malformed: &mut bool) -> Option<String> {
        let bytes = self.record.get(index)?;
        match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                *malformed = true;
                None
            }
        }
    }
}

impl<R: Read> Iterator for CsvTransactionReader<R> {
    type Item = Result<RawTransactionRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_byte_record(&mut self.record) {
            Ok(false) => None,
            Err(e) => Some(Err(ParseError::Csv(e))),
            Ok(true) => {
                self.rows_read += 1;
                let line_number = self
                    .record
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(self.rows_read + 1);

                let mut malformed = false;
                let bank_id = self.field(self.columns.bank_id, &mut malformed);
                let amount = self.field(self.columns.amount, &mut malformed);
                let timestamp = self.field(self.columns.timestamp, &mut malformed);

                Some(Ok(RawTransactionRecord {
                    line_number,
                    bank_id,
                    amount,
                    timestamp,
                    malformed_encoding: malformed,
                }))
            }
        }
    }
}

// ============================================================================
// CLEANING ITERATOR
// ============================================================================

/// Lazy, single-pass stream of cleaned records.
///
/// Dropped rows are reported to the observer and counted in `stats()`. A fatal
/// read error is yielded once as `Err`, after which the stream ends.
pub struct CleanedRecords<'a, R: Read> {
    rows: CsvTransactionReader<R>,
    stats: CleanStats,
    observer: &'a dyn PipelineObserver,
    finished: bool,
}

impl<'a, R: Read> CleanedRecords<'a, R> {
    pub fn new(rows: CsvTransactionReader<R>, observer: &'a dyn PipelineObserver) -> Self {
        CleanedRecords {
            rows,
            stats: CleanStats::default(),
            observer,
            finished: false,
        }
    }

    pub fn stats(&self) -> &CleanStats {
        &self.stats
    }

    pub fn into_stats(self) -> CleanStats {
        self.stats
    }
}

impl<'a, R: Read> Iterator for CleanedRecords<'a, R> {
    type Item = Result<CleanedTransactionRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let raw = match self.rows.next() {
                None => {
                    self.finished = true;
                    self.observer.rows_cleaned(&self.stats);
                    return None;
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(raw)) => raw,
            };

            self.stats.seen += 1;
            match clean_row(&raw) {
                Ok(record) => {
                    self.stats.retained += 1;
                    return Some(Ok(record));
                }
                Err(issue) => {
                    self.stats.record_drop(issue);
                    self.observer.row_dropped(raw.line_number, issue);
                }
            }
        }
    }
}

/// Open a raw extract and return its cleaned record stream
pub fn clean_file<'a>(
    path: &Path,
    observer: &'a dyn PipelineObserver,
) -> Result<CleanedRecords<'a, File>, PipelineError> {
    let rows = CsvTransactionReader::from_path(path)?;
    Ok(CleanedRecords::new(rows, observer))
}

// ============================================================================
// TESTS
// ============================================================================
