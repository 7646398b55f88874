// ➕ Aggregator - daily volume per bank
// Folds cleaned records into one running total per (bank_id, date).

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PipelineError;
use crate::parser::CleanedTransactionRecord;

/// Aggregate key: (bank identifier, calendar date)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub bank_id: i64,
    pub date: NaiveDate,
}

impl AggregateKey {
    pub fn new(bank_id: i64, date: NaiveDate) -> Self {
        AggregateKey { bank_id, date }
    }
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bank {} on {}", self.bank_id, self.date)
    }
}

/// The unit of persistence
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub key: AggregateKey,
    pub total_transaction_volume: Decimal,
}

impl AggregateRow {
    pub fn new(bank_id: i64, date: NaiveDate, total_transaction_volume: Decimal) -> Self {
        AggregateRow {
            key: AggregateKey::new(bank_id, date),
            total_transaction_volume,
        }
    }
}

/// Running totals, one accumulator per distinct key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSet {
    totals: HashMap<AggregateKey, Decimal>,
}

impl AggregateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &CleanedTransactionRecord) -> Result<(), PipelineError> {
        let key = AggregateKey::new(record.bank_id, record.date);
        let total = self.totals.entry(key).or_insert(Decimal::ZERO);
        *total = total
            .checked_add(record.amount)
            .ok_or(PipelineError::Overflow { key })?;
        Ok(())
    }

    pub fn get(&self, key: &AggregateKey) -> Option<Decimal> {
        self.totals.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Rows sorted by key, so artifacts written from the same input are byte-identical
    pub fn into_rows(self) -> Vec<AggregateRow> {
        let mut rows: Vec<AggregateRow> = self
            .totals
            .into_iter()
            .map(|(key, total_transaction_volume)| AggregateRow {
                key,
                total_transaction_volume,
            })
            .collect();
        rows.sort_by_key(|r| r.key);
        rows
    }
}

/// Consume a cleaned record stream in one pass.
///
/// The first fatal error from the stream aborts aggregation.
pub fn aggregate<I>(records: I) -> Result<AggregateSet, PipelineError>
where
    I: IntoIterator<Item = Result<CleanedTransactionRecord, PipelineError>>,
{
    let mut set = AggregateSet::new();
    for record in records {
        set.add(&record?)?;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record(bank_id: i64, amount: &str, ymd: (i32, u32, u32), hour: u32) -> CleanedTransactionRecord {
        let date = NaiveDate::from_ymd_opt(ymd.0, ymd.1, ymd.2).unwrap();
        CleanedTransactionRecord {
            line_number: 0,
            bank_id,
            amount: Decimal::from_str(amount).unwrap(),
            timestamp: date.and_hms_opt(hour, 0, 0).unwrap(),
            date,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn sample() -> Vec<CleanedTransactionRecord> {
        vec![
            record(1, "10.00", (2025, 8, 1), 10),
            record(1, "5.50", (2025, 8, 1), 23),
            record(1, "2.00", (2025, 8, 2), 0),
            record(2, "0.10", (2025, 8, 1), 1),
            record(2, "0.20", (2025, 8, 1), 2),
        ]
    }

    #[test]
    fn test_sums_per_bank_and_day() {
        let set = aggregate(sample().into_iter().map(Ok)).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.get(&AggregateKey::new(1, day(1))), Some(Decimal::from_str("15.50").unwrap()));
        assert_eq!(set.get(&AggregateKey::new(1, day(2))), Some(Decimal::from_str("2.00").unwrap()));
        // exact decimal arithmetic, no float drift
        assert_eq!(set.get(&AggregateKey::new(2, day(1))), Some(Decimal::from_str("0.3").unwrap()));
    }

    #[test]
    fn test_order_does_not_matter() {
        let forward = aggregate(sample().into_iter().map(Ok)).unwrap();
        let reversed = aggregate(sample().into_iter().rev().map(Ok)).unwrap();

        let mut rotated = sample();
        rotated.rotate_left(2);
        let rotated = aggregate(rotated.into_iter().map(Ok)).unwrap();

        assert_eq!(forward, reversed);
        assert_eq!(forward.into_rows(), rotated.into_rows());
    }

    #[test]
    fn test_empty_input_is_empty_set() {
        let set = aggregate(Vec::new()).unwrap();
        assert!(set.is_empty());
        assert!(set.into_rows().is_empty());
    }

    #[test]
    fn test_rows_sorted_by_key() {
        let rows = aggregate(sample().into_iter().rev().map(Ok)).unwrap().into_rows();
        let keys: Vec<_> = rows.iter().map(|r| r.key).collect();

        assert_eq!(
            keys,
            vec![
                AggregateKey::new(1, day(1)),
                AggregateKey::new(1, day(2)),
                AggregateKey::new(2, day(1)),
            ]
        );
    }

    #[test]
    fn test_stream_error_aborts() {
        let records = vec![
            Ok(record(1, "1.00", (2025, 8, 1), 0)),
            Err(PipelineError::Cancelled),
            Ok(record(1, "1.00", (2025, 8, 1), 0)),
        ];
        assert!(matches!(aggregate(records), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut set = AggregateSet::new();
        let mut big = record(1, "0", (2025, 8, 1), 0);
        big.amount = Decimal::MAX;

        set.add(&big).unwrap();
        let result = set.add(&big);
        assert!(matches!(result, Err(PipelineError::Overflow { key }) if key.bank_id == 1));
    }
}
