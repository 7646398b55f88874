// 📝 Aggregate Writer - intermediate CSV between transform and load
// Columns: bank_id, date (ISO 8601), total_transaction_volume

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Writer};
use rust_decimal::Decimal;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::aggregate::AggregateRow;
use crate::error::{ParseError, PipelineError};

pub const ARTIFACT_HEADER: [&str; 3] = ["bank_id", "date", "total_transaction_volume"];

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write rows to `path`.
///
/// Output goes to a sibling `.partial` file first and is renamed into place,
/// so readers never observe a half-written artifact.
pub fn write_aggregates(path: &Path, rows: &[AggregateRow]) -> Result<(), PipelineError> {
    let partial = temp_path(path);

    let write = || -> Result<(), csv::Error> {
        let mut writer = Writer::from_path(&partial)?;
        writer.write_record(ARTIFACT_HEADER)?;
        for row in rows {
            writer.write_record(&[
                row.key.bank_id.to_string(),
                row.key.date.format("%Y-%m-%d").to_string(),
                row.total_transaction_volume.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&partial);
        return Err(ParseError::Csv(e).into());
    }

    fs::rename(&partial, path).map_err(|e| PipelineError::io(path, e))
}

fn column(headers: &StringRecord, name: &'static str) -> Result<usize, ParseError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or(ParseError::MissingColumn(name))
}

fn value<'r>(record: &'r StringRecord, index: usize) -> &'r str {
    record.get(index).unwrap_or("")
}

/// Read an artifact produced by `write_aggregates`.
///
/// Any malformed value is fatal: this file is our own output, so a bad row
/// means the artifact is corrupt, not that one input row was dirty.
pub fn read_aggregates(path: &Path) -> Result<Vec<AggregateRow>, PipelineError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(ParseError::Csv)?;

    let headers = reader.headers().map_err(ParseError::Csv)?.clone();
    if headers.is_empty() {
        return Err(ParseError::EmptyInput.into());
    }
    let bank_idx = column(&headers, ARTIFACT_HEADER[0])?;
    let date_idx = column(&headers, ARTIFACT_HEADER[1])?;
    let total_idx = column(&headers, ARTIFACT_HEADER[2])?;

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result.map_err(ParseError::Csv)?;
        let line = i + 2;

        let invalid = |field: &'static str, text: &str| ParseError::InvalidValue {
            line,
            field,
            value: text.to_string(),
        };

        let bank_text = value(&record, bank_idx);
        let bank_id = bank_text
            .parse::<i64>()
            .map_err(|_| invalid("bank_id", bank_text))?;

        let date_text = value(&record, date_idx);
        let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d")
            .map_err(|_| invalid("date", date_text))?;

        let total_text = value(&record, total_idx);
        let total = Decimal::from_str(total_text)
            .map_err(|_| invalid("total_transaction_volume", total_text))?;

        rows.push(AggregateRow::new(bank_id, date, total));
    }

    Ok(rows)
}
