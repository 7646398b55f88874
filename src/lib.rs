// Bank Aggregates - Core Library
// Daily banking extract → cleaned records → (bank_id, date) totals → upserted table

pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod observer;
pub mod parser;
pub mod pipeline;
pub mod writer;

// Re-export commonly used types
pub use aggregate::{aggregate, AggregateKey, AggregateRow, AggregateSet};
pub use config::PipelineConfig;
pub use db::{
    AggregateStore, LoadRun, SqliteBatch, UpsertMode,
    connect, setup_database, count_aggregates, get_aggregate, get_all_aggregates, get_load_runs,
    insert_load_run,
};
pub use error::{FetchError, ParseError, PipelineError, RowCoercionIssue, StoreError, UpsertIssue};
pub use fetch::{BlobFetcher, LocalDirFetcher};
pub use loader::{CancelToken, LoadOptions, LoadReport, LoadState, Loader, RowOutcome};
pub use observer::{LogObserver, NoopObserver, PipelineObserver, Stage};
pub use parser::{
    CleanStats, CleanedRecords, CleanedTransactionRecord, CsvTransactionReader, RawTransactionRecord,
    clean_file, clean_row,
};
pub use pipeline::{run_all, run_fetch, run_load, run_transform, transform, RunReport, TransformReport};
pub use writer::{read_aggregates, write_aggregates};
