// 🔁 Pipeline stages: fetch → transform → load
// Each stage is an independent, restartable unit; run_all sequences them once.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::{aggregate, AggregateSet};
use crate::config::PipelineConfig;
use crate::db::{connect, SqliteBatch};
use crate::error::PipelineError;
use crate::fetch::BlobFetcher;
use crate::loader::{CancelToken, LoadOptions, LoadReport, Loader};
use crate::observer::{PipelineObserver, Stage};
use crate::parser::{clean_file, CleanStats};
use crate::writer::{read_aggregates, write_aggregates};

#[derive(Debug, Clone)]
pub struct TransformReport {
    pub clean: CleanStats,
    pub aggregate_rows: usize,
    pub output: PathBuf,
}

impl TransformReport {
    pub fn summary(&self) -> String {
        format!(
            "{} → {} aggregate rows in {}",
            self.clean.summary(),
            self.aggregate_rows,
            self.output.display()
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub transform: TransformReport,
    pub load: LoadReport,
}

/// Report start/finish/failure of `body` to the observer
fn observed<T>(
    observer: &dyn PipelineObserver,
    stage: Stage,
    body: impl FnOnce() -> Result<T, PipelineError>,
    summary: impl FnOnce(&T) -> String,
) -> Result<T, PipelineError> {
    observer.stage_started(stage);
    match body() {
        Ok(value) => {
            observer.stage_finished(stage, &summary(&value));
            Ok(value)
        }
        Err(e) => {
            observer.stage_failed(stage, &e);
            Err(e)
        }
    }
}

pub fn run_fetch(
    fetcher: &dyn BlobFetcher,
    bucket: &str,
    key: &str,
    dest: &Path,
    timeout: Duration,
    observer: &dyn PipelineObserver,
) -> Result<PathBuf, PipelineError> {
    observed(
        observer,
        Stage::Fetch,
        || Ok(fetcher.fetch(bucket, key, dest, timeout)?),
        |path| format!("{}/{} → {}", bucket, key, path.display()),
    )
}

/// Clean and aggregate a raw extract in one streaming pass
pub fn transform(input: &Path, observer: &dyn PipelineObserver) -> Result<(AggregateSet, CleanStats), PipelineError> {
    let mut records = clean_file(input, observer)?;
    let set = aggregate(records.by_ref())?;
    Ok((set, records.into_stats()))
}

pub fn run_transform(
    input: &Path,
    output: &Path,
    observer: &dyn PipelineObserver,
) -> Result<TransformReport, PipelineError> {
    observed(
        observer,
        Stage::Transform,
        || {
            let (set, clean) = transform(input, observer)?;
            let rows = set.into_rows();
            write_aggregates(output, &rows)?;
            Ok(TransformReport {
                clean,
                aggregate_rows: rows.len(),
                output: output.to_path_buf(),
            })
        },
        TransformReport::summary,
    )
}

/// Load an aggregates artifact into the SQLite store at `db_path`.
///
/// The connection lives only for this call and is closed on every exit path.
pub fn run_load(
    artifact: &Path,
    db_path: &Path,
    options: LoadOptions,
    cancel: Option<CancelToken>,
    observer: &dyn PipelineObserver,
) -> Result<LoadReport, PipelineError> {
    observed(
        observer,
        Stage::Load,
        || {
            let rows = read_aggregates(artifact)?;
            let mut conn = connect(db_path, options.timeout).map_err(PipelineError::Connect)?;
            let batch = SqliteBatch::begin(&mut conn, options.mode).map_err(PipelineError::Store)?;

            let mut loader = Loader::new(options, observer);
            if let Some(token) = cancel {
                loader = loader.with_cancel(token);
            }
            loader.load(batch, &rows)
        },
        LoadReport::summary,
    )
}

/// One full run: fetch, transform, load
pub fn run_all(
    config: &PipelineConfig,
    fetcher: &dyn BlobFetcher,
    observer: &dyn PipelineObserver,
) -> Result<RunReport, PipelineError> {
    let raw = run_fetch(
        fetcher,
        &config.bucket,
        &config.key,
        &config.raw_path(),
        config.fetch_timeout(),
        observer,
    )?;

    let transformed = config.transformed_path();
    let transform = run_transform(&raw, &transformed, observer)?;
    let load = run_load(&transformed, &config.database_path, config.load_options(), None, observer)?;

    if !config.keep_artifacts {
        for path in [&raw, &transformed] {
            fs::remove_file(path).map_err(|e| PipelineError::io(path.as_path(), e))?;
        }
    }

    Ok(RunReport { transform, load })
}
