// 💾 Loader - idempotent upsert of aggregate rows
//
// Pending → Upserting (each row Staged | Skipped) → Committing → Committed | CommitFailed
//
// Row-level failures are skipped and reported; connection or transaction
// failures roll the whole batch back. Nothing is visible until commit.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregate::AggregateRow;
use crate::db::{AggregateStore, LoadRun, UpsertMode};
use crate::error::{PipelineError, StoreError, UpsertIssue};
use crate::observer::PipelineObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Upserting,
    Committing,
    Committed,
    CommitFailed,
    /// Abandoned before commit (cancel, timeout, lost connection)
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Staged,
    Skipped(UpsertIssue),
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Deadline for the whole batch, checked before each row
    pub timeout: Duration,
    pub mode: UpsertMode,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            timeout: Duration::from_secs(300),
            mode: UpsertMode::Native,
        }
    }
}

/// Shared flag a caller flips to abandon an in-flight load
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub run_id: String,
    pub staged: usize,
    pub skipped: Vec<UpsertIssue>,
    pub state: LoadState,
}

impl LoadReport {
    pub fn summary(&self) -> String {
        format!(
            "run {}: {} rows upserted, {} skipped",
            self.run_id,
            self.staged,
            self.skipped.len()
        )
    }
}

pub struct Loader<'a> {
    options: LoadOptions,
    observer: &'a dyn PipelineObserver,
    cancel: Option<CancelToken>,
}

impl<'a> Loader<'a> {
    pub fn new(options: LoadOptions, observer: &'a dyn PipelineObserver) -> Self {
        Loader {
            options,
            observer,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |c| c.is_cancelled())
    }

    fn abandon<S: AggregateStore>(&self, store: S, error: PipelineError) -> PipelineError {
        if let Err(e) = store.rollback() {
            self.observer.rollback_failed(&e);
        }
        self.observer.load_state(LoadState::RolledBack);
        error
    }

    /// Attempt one row. Only row-level failures come back as `Skipped`.
    fn stage_row<S: AggregateStore>(store: &mut S, row: &AggregateRow) -> Result<RowOutcome, StoreError> {
        match store.execute_upsert(row) {
            Ok(()) => Ok(RowOutcome::Staged),
            Err(e) if e.is_row_level() => Ok(RowOutcome::Skipped(UpsertIssue {
                key: row.key,
                reason: e.to_string(),
            })),
            Err(e) => Err(e),
        }
    }

    /// Upsert every row into `store` and commit once at the end.
    ///
    /// `store` is consumed: it is either committed or rolled back before this
    /// returns, and dropping it on unwind rolls back as well.
    pub fn load<S: AggregateStore>(
        &self,
        mut store: S,
        rows: &[AggregateRow],
    ) -> Result<LoadReport, PipelineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        self.observer.load_state(LoadState::Pending);
        self.observer.load_state(LoadState::Upserting);

        let mut staged = 0;
        let mut skipped = Vec::new();

        for row in rows {
            if self.is_cancelled() {
                return Err(self.abandon(store, PipelineError::Cancelled));
            }
            if started.elapsed() >= self.options.timeout {
                let timeout = PipelineError::Timeout {
                    stage: "load",
                    after: self.options.timeout,
                };
                return Err(self.abandon(store, timeout));
            }

            match Self::stage_row(&mut store, row) {
                Ok(RowOutcome::Staged) => {
                    staged += 1;
                    self.observer.row_staged(&row.key);
                }
                Ok(RowOutcome::Skipped(issue)) => {
                    self.observer.row_skipped(&issue);
                    skipped.push(issue);
                }
                Err(e) => return Err(self.abandon(store, PipelineError::Store(e))),
            }
        }

        if self.is_cancelled() {
            return Err(self.abandon(store, PipelineError::Cancelled));
        }

        self.observer.load_state(LoadState::Committing);

        let detail = serde_json::json!({
            "rows": rows.len(),
            "skipped": skipped
                .iter()
                .map(|i| serde_json::json!({ "key": i.key, "reason": i.reason }))
                .collect::<Vec<_>>(),
        });
        let run = LoadRun::new(&run_id, started_at, staged, skipped.len()).with_detail(detail);
        if let Err(e) = store.record_run(&run) {
            return Err(self.abandon(store, PipelineError::Store(e)));
        }

        if let Err(e) = store.commit() {
            self.observer.load_state(LoadState::CommitFailed);
            return Err(PipelineError::Commit(e));
        }

        self.observer.load_state(LoadState::Committed);

        Ok(LoadReport {
            run_id,
            staged,
            skipped,
            state: LoadState::Committed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateKey;
    use crate::db::{count_aggregates, get_load_runs, setup_database, SqliteBatch};
    use crate::observer::NoopObserver;
    use chrono::NaiveDate;
    use rusqlite::Connection;
    use rust_decimal::Decimal;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use std::rc::Rc;
    use std::str::FromStr;

    type Durable = Rc<RefCell<BTreeMap<AggregateKey, Decimal>>>;

    fn io_failure(message: &str) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            Some(message.to_string()),
        ))
    }

    /// In-memory store: staged rows land in `durable` only on commit
    struct MemoryStore {
        durable: Durable,
        staged: BTreeMap<AggregateKey, Decimal>,
        reject_banks: HashSet<i64>,
        drop_connection_at_bank: Option<i64>,
        fail_commit: bool,
    }

    impl MemoryStore {
        fn new(durable: &Durable) -> Self {
            MemoryStore {
                durable: Rc::clone(durable),
                staged: BTreeMap::new(),
                reject_banks: HashSet::new(),
                drop_connection_at_bank: None,
                fail_commit: false,
            }
        }
    }

    impl AggregateStore for MemoryStore {
        fn execute_upsert(&mut self, row: &AggregateRow) -> Result<(), StoreError> {
            if self.drop_connection_at_bank == Some(row.key.bank_id) {
                return Err(io_failure("socket closed"));
            }
            if self.reject_banks.contains(&row.key.bank_id) {
                return Err(StoreError::Rejected("type mismatch".to_string()));
            }
            self.staged.insert(row.key, row.total_transaction_volume);
            Ok(())
        }

        fn record_run(&mut self, _run: &LoadRun) -> Result<(), StoreError> {
            Ok(())
        }

        fn commit(self) -> Result<(), StoreError> {
            if self.fail_commit {
                return Err(io_failure("dropped during commit"));
            }
            self.durable.borrow_mut().extend(self.staged);
            Ok(())
        }

        fn rollback(self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StateRecorder {
        states: RefCell<Vec<LoadState>>,
        skipped: RefCell<Vec<UpsertIssue>>,
        cancel_after_first: Option<CancelToken>,
    }

    impl PipelineObserver for StateRecorder {
        fn load_state(&self, state: LoadState) {
            self.states.borrow_mut().push(state);
        }

        fn row_staged(&self, _key: &AggregateKey) {
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
        }

        fn row_skipped(&self, issue: &UpsertIssue) {
            self.skipped.borrow_mut().push(issue.clone());
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn row(bank_id: i64, d: u32, total: &str) -> AggregateRow {
        AggregateRow::new(bank_id, day(d), Decimal::from_str(total).unwrap())
    }

    fn sample_rows() -> Vec<AggregateRow> {
        vec![row(1, 1, "15.50"), row(1, 2, "2.00"), row(2, 1, "7.25")]
    }

    #[test]
    fn test_load_twice_is_idempotent() {
        let durable = Durable::default();
        let observer = NoopObserver;
        let loader = Loader::new(LoadOptions::default(), &observer);

        loader.load(MemoryStore::new(&durable), &sample_rows()).unwrap();
        let first = durable.borrow().clone();
        loader.load(MemoryStore::new(&durable), &sample_rows()).unwrap();

        assert_eq!(*durable.borrow(), first);
        assert_eq!(
            durable.borrow().get(&AggregateKey::new(1, day(1))),
            Some(&Decimal::from_str("15.50").unwrap())
        );
    }

    #[test]
    fn test_state_sequence_on_success() {
        let durable = Durable::default();
        let observer = StateRecorder::default();
        let report = Loader::new(LoadOptions::default(), &observer)
            .load(MemoryStore::new(&durable), &sample_rows())
            .unwrap();

        assert_eq!(report.state, LoadState::Committed);
        assert_eq!(report.staged, 3);
        assert_eq!(
            *observer.states.borrow(),
            vec![
                LoadState::Pending,
                LoadState::Upserting,
                LoadState::Committing,
                LoadState::Committed,
            ]
        );
    }

    #[test]
    fn test_rejected_row_is_skipped_not_fatal() {
        let durable = Durable::default();
        let observer = StateRecorder::default();
        let mut store = MemoryStore::new(&durable);
        store.reject_banks.insert(1);

        let report = Loader::new(LoadOptions::default(), &observer)
            .load(store, &sample_rows())
            .unwrap();

        assert_eq!(report.staged, 1);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].key, AggregateKey::new(1, day(1)));
        assert_eq!(observer.skipped.borrow().len(), 2);
        assert_eq!(durable.borrow().len(), 1);
        assert!(durable.borrow().contains_key(&AggregateKey::new(2, day(1))));
    }

    #[test]
    fn test_commit_failure_persists_nothing() {
        let durable = Durable::default();
        let observer = StateRecorder::default();
        let mut store = MemoryStore::new(&durable);
        store.fail_commit = true;

        let result = Loader::new(LoadOptions::default(), &observer).load(store, &sample_rows());

        assert!(matches!(result, Err(PipelineError::Commit(_))));
        assert!(durable.borrow().is_empty());
        assert_eq!(observer.states.borrow().last(), Some(&LoadState::CommitFailed));
    }

    #[test]
    fn test_lost_connection_mid_batch_is_fatal() {
        let durable = Durable::default();
        let observer = StateRecorder::default();
        let mut store = MemoryStore::new(&durable);
        store.drop_connection_at_bank = Some(2);

        let result = Loader::new(LoadOptions::default(), &observer).load(store, &sample_rows());

        match result {
            Err(PipelineError::Store(e)) => assert!(!e.is_row_level()),
            other => panic!("expected fatal store error, got {:?}", other),
        }
        assert!(durable.borrow().is_empty());
        assert_eq!(observer.states.borrow().last(), Some(&LoadState::RolledBack));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let durable = Durable::default();
        let observer = NoopObserver;
        let options = LoadOptions {
            timeout: Duration::ZERO,
            ..LoadOptions::default()
        };

        let result = Loader::new(options, &observer).load(MemoryStore::new(&durable), &sample_rows());

        assert!(matches!(result, Err(PipelineError::Timeout { stage: "load", .. })));
        assert!(durable.borrow().is_empty());
    }

    #[test]
    fn test_empty_batch_commits() {
        let durable = Durable::default();
        let observer = NoopObserver;
        let report = Loader::new(LoadOptions::default(), &observer)
            .load(MemoryStore::new(&durable), &[])
            .unwrap();

        assert_eq!(report.staged, 0);
        assert_eq!(report.state, LoadState::Committed);
    }

    #[test]
    fn test_cancel_mid_batch_leaves_sqlite_unchanged() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let token = CancelToken::new();
        let observer = StateRecorder {
            cancel_after_first: Some(token.clone()),
            ..StateRecorder::default()
        };
        let loader = Loader::new(LoadOptions::default(), &observer).with_cancel(token);

        let batch = SqliteBatch::begin(&mut conn, UpsertMode::Native).unwrap();
        let result = loader.load(batch, &sample_rows());

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(count_aggregates(&conn).unwrap(), 0);
        assert!(get_load_runs(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_constraint_failure_skips_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_bank_99 BEFORE INSERT ON transaction_aggregates
             WHEN NEW.bank_id = 99
             BEGIN SELECT RAISE(ABORT, 'bank 99 rejected'); END;",
        )
        .unwrap();
        let observer = StateRecorder::default();
        let rows = vec![row(1, 1, "15.50"), row(99, 1, "1.00"), row(2, 1, "7.25")];

        let batch = SqliteBatch::begin(&mut conn, UpsertMode::Native).unwrap();
        let report = Loader::new(LoadOptions::default(), &observer).load(batch, &rows).unwrap();

        assert_eq!(report.staged, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].key.bank_id, 99);
        assert_eq!(report.state, LoadState::Committed);
        assert_eq!(observer.skipped.borrow().len(), 1);
        assert_eq!(count_aggregates(&conn).unwrap(), 2);
        assert_eq!(get_load_runs(&conn).unwrap()[0].skipped, 1);
    }

    #[test]
    fn test_sqlite_load_records_run() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let observer = NoopObserver;
        let options = LoadOptions {
            mode: UpsertMode::ReadThenWrite,
            ..LoadOptions::default()
        };

        let batch = SqliteBatch::begin(&mut conn, options.mode).unwrap();
        let report = Loader::new(options, &observer).load(batch, &sample_rows()).unwrap();

        assert_eq!(count_aggregates(&conn).unwrap(), 3);
        let runs = get_load_runs(&conn).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, report.run_id);
        assert_eq!(runs[0].staged, 3);
    }
}
